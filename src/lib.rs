//! skywatch — resumable channel retrieval + LLM enrichment pipeline.

pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extract;
pub mod governor;
pub mod pipeline;
pub mod retriever;
pub mod sink;
