//! Extraction client: one LLM call per message, classified outcomes.

pub mod openai;
pub mod prompt;

pub use openai::{CompletionRequest, ModelClient, OpenAiClient};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::Message;
use crate::error::ExtractError;

/// Decoding settings for extraction calls.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    /// Hard cap on generated tokens.
    pub max_tokens: u32,
    /// Pinned low for reproducible extraction.
    pub temperature: f32,
}

/// Terminal status of one extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Structured fields extracted; a sink row is written.
    Ok,
    /// The model reported no attack data; no sink row.
    SkippedNonMatching,
    /// Malformed output survived the repair re-ask, or retries ran out.
    FailedPermanent,
}

/// Result of extracting one message. Produced once, written once.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub message_id: i64,
    /// Extracted report, absent for skipped and failed items.
    pub fields: Option<serde_json::Value>,
    /// Raw model output, kept for the sink and for diagnostics.
    pub raw_output: String,
    pub status: ExtractionStatus,
}

impl ExtractionResult {
    pub fn ok(message_id: i64, fields: serde_json::Value, raw_output: String) -> Self {
        Self {
            message_id,
            fields: Some(fields),
            raw_output,
            status: ExtractionStatus::Ok,
        }
    }

    pub fn skipped(message_id: i64, raw_output: String) -> Self {
        Self {
            message_id,
            fields: None,
            raw_output,
            status: ExtractionStatus::SkippedNonMatching,
        }
    }

    pub fn failed(message_id: i64, raw_output: String) -> Self {
        Self {
            message_id,
            fields: None,
            raw_output,
            status: ExtractionStatus::FailedPermanent,
        }
    }
}

// ── Report shape ────────────────────────────────────────────────────

/// Extracted attack report, the shape the prompt demands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackReport {
    /// Report date, YYYY-MM-DD.
    pub date: String,
    /// One entry per attacking asset type.
    pub counts: Vec<AssetCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetCount {
    #[serde(rename = "type")]
    pub asset_type: String,
    pub number: i64,
    #[serde(default)]
    pub additional_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtypes: Option<Vec<SubtypeCount>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtypeCount {
    pub subtype: String,
    pub number: i64,
    #[serde(default)]
    pub additional_details: Option<String>,
}

// ── Extraction client ───────────────────────────────────────────────

/// Wraps a single enrichment call per message.
///
/// Builds the fixed-shape prompt, pins the decoding settings, and
/// classifies failures. Malformed JSON gets exactly one repair re-ask with
/// a stricter instruction; a second malformed answer is failed-permanent.
/// No side effects beyond the outbound call.
pub struct ExtractionClient {
    model: Arc<dyn ModelClient>,
    settings: ExtractionSettings,
}

impl ExtractionClient {
    pub fn new(model: Arc<dyn ModelClient>, settings: ExtractionSettings) -> Self {
        Self { model, settings }
    }

    /// Model identifier, for the sink rows.
    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Extract structured attack data from one message.
    pub async fn extract(&self, message: &Message) -> Result<ExtractionResult, ExtractError> {
        let content = self
            .model
            .complete(self.request(prompt::analysis_prompt(&message.text)))
            .await?;

        match interpret(&content) {
            Interpretation::NoData => {
                debug!(id = message.id, "Model reported no attack data");
                Ok(ExtractionResult::skipped(message.id, content))
            }
            Interpretation::Report(fields) => Ok(ExtractionResult::ok(message.id, fields, content)),
            Interpretation::Malformed(reason) => {
                warn!(
                    id = message.id,
                    reason = %reason,
                    "Malformed model output, issuing repair re-ask"
                );
                let repaired = self
                    .model
                    .complete(self.request(prompt::repair_prompt(&message.text)))
                    .await?;

                match interpret(&repaired) {
                    Interpretation::NoData => Ok(ExtractionResult::skipped(message.id, repaired)),
                    Interpretation::Report(fields) => {
                        Ok(ExtractionResult::ok(message.id, fields, repaired))
                    }
                    Interpretation::Malformed(reason) => {
                        warn!(
                            id = message.id,
                            reason = %reason,
                            "Repair re-ask still malformed, marking failed-permanent"
                        );
                        Ok(ExtractionResult::failed(message.id, repaired))
                    }
                }
            }
        }
    }

    fn request(&self, user: String) -> CompletionRequest {
        CompletionRequest {
            system: prompt::SYSTEM_PROMPT.to_string(),
            user,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }
}

// ── Response interpretation ─────────────────────────────────────────

enum Interpretation {
    NoData,
    Report(serde_json::Value),
    Malformed(String),
}

/// Decode a raw model answer: the NULL marker, a valid report object, or
/// malformed output.
fn interpret(raw: &str) -> Interpretation {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("null") {
        return Interpretation::NoData;
    }

    let json_str = extract_json_object(trimmed);
    let value: serde_json::Value = match serde_json::from_str(&json_str) {
        Ok(v) => v,
        Err(e) => return Interpretation::Malformed(format!("JSON parse error: {e}")),
    };

    if value.is_null() {
        return Interpretation::NoData;
    }

    match serde_json::from_value::<AttackReport>(value.clone()) {
        Ok(_) => Interpretation::Report(value),
        Err(e) => Interpretation::Malformed(format!("unexpected report shape: {e}")),
    }
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in a markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use chrono::Utc;

    use crate::error::ModelError;

    const VALID_REPORT: &str = r#"{"date": "2025-08-05", "counts": [
        {"type": "drones", "number": 45,
         "additional_details": "launched from the south, 38 shot down",
         "subtypes": [{"subtype": "Shahed-136", "number": 45,
                       "additional_details": "strike drones"}]},
        {"type": "missiles", "number": 3, "additional_details": "Iskander-M"}
    ]}"#;

    fn message() -> Message {
        Message {
            id: 101,
            date: Utc::now(),
            text: "У ніч на 5 серпня ворог атакував 45 БпЛА та 3 ракетами".into(),
            channel: "kpszsu".into(),
        }
    }

    /// Mock model that returns canned responses in sequence.
    struct ScriptedModel {
        responses: Mutex<Vec<Result<String, ModelError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String, ModelError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelClient for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
            self.calls.lock().unwrap().push(request.user);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ModelError::Transient("script exhausted".into()));
            }
            responses.remove(0)
        }
    }

    fn client(model: Arc<ScriptedModel>) -> ExtractionClient {
        ExtractionClient::new(
            model,
            ExtractionSettings {
                max_tokens: 2000,
                temperature: 0.0,
            },
        )
    }

    // ── interpret / extract_json_object ─────────────────────────────

    #[test]
    fn interpret_valid_report() {
        assert!(matches!(interpret(VALID_REPORT), Interpretation::Report(_)));
    }

    #[test]
    fn interpret_null_marker() {
        assert!(matches!(interpret("NULL"), Interpretation::NoData));
        assert!(matches!(interpret("  null\n"), Interpretation::NoData));
    }

    #[test]
    fn interpret_markdown_wrapped_report() {
        let wrapped = format!("```json\n{VALID_REPORT}\n```");
        assert!(matches!(interpret(&wrapped), Interpretation::Report(_)));
    }

    #[test]
    fn interpret_report_with_surrounding_text() {
        let noisy = format!("Here is the data: {VALID_REPORT} as requested.");
        assert!(matches!(interpret(&noisy), Interpretation::Report(_)));
    }

    #[test]
    fn interpret_wrong_shape_is_malformed() {
        let wrong = r#"{"date": "2025-08-05", "counts": "many"}"#;
        assert!(matches!(interpret(wrong), Interpretation::Malformed(_)));
    }

    #[test]
    fn interpret_garbage_is_malformed() {
        assert!(matches!(
            interpret("the attack involved drones"),
            Interpretation::Malformed(_)
        ));
    }

    #[test]
    fn extract_json_direct_object_passthrough() {
        let input = r#"{"date": "2025-08-05", "counts": []}"#;
        assert_eq!(extract_json_object(input), input);
    }

    #[test]
    fn report_shape_round_trip() {
        let report: AttackReport = serde_json::from_str(VALID_REPORT).unwrap();
        assert_eq!(report.date, "2025-08-05");
        assert_eq!(report.counts.len(), 2);
        assert_eq!(report.counts[0].asset_type, "drones");
        assert_eq!(
            report.counts[0].subtypes.as_ref().unwrap()[0].subtype,
            "Shahed-136"
        );
        assert!(report.counts[1].subtypes.is_none());
    }

    // ── ExtractionClient behavior ───────────────────────────────────

    #[tokio::test]
    async fn extract_valid_response_is_ok() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(VALID_REPORT.to_string())]));
        let result = client(model.clone()).extract(&message()).await.unwrap();

        assert_eq!(result.status, ExtractionStatus::Ok);
        assert_eq!(result.message_id, 101);
        assert!(result.fields.is_some());
        assert_eq!(model.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extract_null_is_skipped() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("NULL".to_string())]));
        let result = client(model).extract(&message()).await.unwrap();
        assert_eq!(result.status, ExtractionStatus::SkippedNonMatching);
        assert!(result.fields.is_none());
    }

    #[tokio::test]
    async fn malformed_then_valid_repairs_once() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("sorry, here you go: nothing".to_string()),
            Ok(VALID_REPORT.to_string()),
        ]));
        let result = client(model.clone()).extract(&message()).await.unwrap();

        assert_eq!(result.status, ExtractionStatus::Ok);
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        // Second call must carry the stricter repair instruction.
        assert!(calls[1].contains("not valid JSON"));
    }

    #[tokio::test]
    async fn malformed_twice_is_failed_permanent() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("not json".to_string()),
            Ok("still not json".to_string()),
        ]));
        let result = client(model.clone()).extract(&message()).await.unwrap();

        assert_eq!(result.status, ExtractionStatus::FailedPermanent);
        assert_eq!(result.raw_output, "still not json");
        // Exactly one repair attempt, never more.
        assert_eq!(model.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rate_limit_surfaces_as_retryable() {
        let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::RateLimited {
            retry_after: None,
        })]));
        let err = client(model).extract(&message()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Retryable(_)));
    }

    #[tokio::test]
    async fn quota_exhaustion_surfaces_as_fatal() {
        let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::QuotaExhausted(
            "insufficient_quota".into(),
        ))]));
        let err = client(model).extract(&message()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Fatal(_)));
    }

    #[tokio::test]
    async fn transient_failure_during_repair_is_retryable() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("not json".to_string()),
            Err(ModelError::Transient("connection reset".into())),
        ]));
        let err = client(model).extract(&message()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Retryable(_)));
    }
}
