//! Prompt templates for attack-report extraction.

/// System role for every extraction call.
pub const SYSTEM_PROMPT: &str = "You are a military analyst. Analyze the provided \
Ukrainian military update text and extract attack data in the specified JSON format. \
Return ONLY the JSON object, no other text.";

/// Build the extraction prompt for one message.
pub fn analysis_prompt(message_text: &str) -> String {
    format!(
        r#"You will be given a military update text reporting attacks on Ukraine by various aerial assets (drones, missiles, aircraft, etc.). Your task is to analyze the text carefully and extract the total number of attacking assets by type and subtype as of the report date.

**Requirements:**

- Extract and return **only one JSON object** matching this exact structure:

```json
{{
  "date": "YYYY-MM-DD",
  "counts": [
    {{
      "type": "string (e.g. drones, missiles, aircraft)",
      "number": integer,
      "additional_details": "string describing key details about the attack or losses",
      "subtypes": [
        {{
          "subtype": "string (e.g. Shahed-136, Iskander-M)",
          "number": integer,
          "additional_details": "string with subtype-specific info"
        }}
      ]
    }}
  ]
}}
```

* The `date` field must correspond to the date of the report or attack described.
* The `counts` array must list each distinct attacking asset type found in the text with its total number (integer).
* If specific subtypes with counts are mentioned, include a `subtypes` array inside the relevant asset object; omit it otherwise.
* The `additional_details` field should summarize important context relevant to that type, such as locations, attack origins, or general outcomes.
* **Do not return any text other than this JSON object.**
* If the input text does not contain sufficient information to build the JSON object as specified, respond with a single literal value: `NULL` (without quotes).
* Be strict: do not add extra fields or deviate from the structure.

Now analyze the following input and return the JSON or NULL:

{message_text}"#
    )
}

/// Build the stricter re-ask used after a malformed first response.
pub fn repair_prompt(message_text: &str) -> String {
    format!(
        "Your previous answer was not valid JSON. Respond again for the text below. \
Output exactly one JSON object with the fields \"date\" (string, YYYY-MM-DD) and \
\"counts\" (array of objects with \"type\", \"number\", \"additional_details\" and \
optional \"subtypes\"), or the literal NULL. No markdown fences, no commentary, \
no leading or trailing text of any kind.\n\n{message_text}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_prompt_embeds_message() {
        let prompt = analysis_prompt("У ніч на 5 серпня ворог атакував");
        assert!(prompt.contains("У ніч на 5 серпня ворог атакував"));
        assert!(prompt.contains("\"counts\""));
        assert!(prompt.contains("NULL"));
    }

    #[test]
    fn repair_prompt_is_stricter() {
        let prompt = repair_prompt("text");
        assert!(prompt.contains("not valid JSON"));
        assert!(prompt.contains("No markdown fences"));
        assert!(prompt.ends_with("text"));
    }

    #[test]
    fn system_prompt_demands_json_only() {
        assert!(SYSTEM_PROMPT.contains("ONLY the JSON object"));
    }
}
