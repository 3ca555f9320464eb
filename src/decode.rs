//! Turning free-text model replies into typed output.
//!
//! Test case replies go through an ordered sequence of decoding attempts;
//! each transition is logged so a bad reply can be diagnosed from the logs:
//!
//! ```text
//! Direct ──fail──► Extracted ──fail──► Failed (GenerationFormat)
//!   │                  │
//!   └──────ok──────────┴──► Unwrap ──► Normalize ──► Validate
//! ```
//!
//! - **Direct**: parse the whole reply as JSON.
//! - **Extracted**: parse the span from the first `[` to the last `]`,
//!   which recovers arrays wrapped in prose or a fenced code block.
//! - **Unwrap**: a top-level object is replaced by its `test_cases` value.
//! - **Normalize**: `Grounded_In` given as a comma-joined string becomes a
//!   list; a lone placeholder entry (e.g. `["context"]`) becomes the unique
//!   sources retrieved for the query.
//! - **Validate**: every record must deserialize as a [`TestCase`]. One bad
//!   record fails the whole reply.

use serde_json::Value;

use crate::error::{QaError, QaResult};
use crate::models::TestCase;

const GROUNDED_IN: &str = "Grounded_In";
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Direct,
    Extracted,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Direct => "direct",
            Stage::Extracted => "extracted",
        }
    }
}

/// Decode a test case reply.
///
/// `sources` are the unique source names retrieved for the query;
/// `placeholders` are the tokens that stand for "the context" in a
/// single-entry `Grounded_In`.
pub fn decode_test_cases(
    reply: &str,
    sources: &[String],
    placeholders: &[String],
) -> QaResult<Vec<TestCase>> {
    let (value, stage) = parse_reply(reply)?;
    let records = unwrap_records(value, reply)?;

    let mut cases = Vec::with_capacity(records.len());
    for (i, mut record) in records.into_iter().enumerate() {
        normalize_grounding(&mut record, sources, placeholders);
        let case: TestCase = serde_json::from_value(record).map_err(|e| {
            tracing::error!(index = i, error = %e, "test case failed validation");
            QaError::GenerationValidation {
                index: i,
                message: e.to_string(),
            }
        })?;
        for name in case.grounded_in.iter().filter(|n| !sources.contains(n)) {
            tracing::warn!(test_id = %case.test_id, source = %name, "Grounded_In names a source that was not retrieved");
        }
        cases.push(case);
    }

    tracing::info!(count = cases.len(), stage = stage.as_str(), "decoded test cases");
    Ok(cases)
}

fn parse_reply(reply: &str) -> QaResult<(Value, Stage)> {
    tracing::debug!(chars = reply.len(), "parsing reply as JSON");
    let direct_err = match serde_json::from_str::<Value>(reply.trim()) {
        Ok(value) => return Ok((value, Stage::Direct)),
        Err(e) => e,
    };
    tracing::warn!(error = %direct_err, "direct parse failed; extracting JSON array from reply");

    let Some(span) = array_span(reply) else {
        tracing::error!("no JSON array found in reply");
        return Err(format_error("no JSON array found", reply));
    };
    tracing::debug!(excerpt = %excerpt(span), "extracted candidate array");

    match serde_json::from_str::<Value>(span) {
        Ok(value) => {
            tracing::info!("parsed extracted JSON array");
            Ok((value, Stage::Extracted))
        }
        Err(e) => {
            tracing::error!(error = %e, "extracted array is not valid JSON");
            Err(format_error(&format!("extracted array is not valid JSON: {}", e), reply))
        }
    }
}

/// The span from the first `[` through the last `]`, if both exist in order.
fn array_span(reply: &str) -> Option<&str> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    (end > start).then(|| &reply[start..=end])
}

fn unwrap_records(value: Value, reply: &str) -> QaResult<Vec<Value>> {
    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove("test_cases") {
            Some(Value::Array(records)) => {
                tracing::debug!("unwrapped test_cases from top-level object");
                Ok(records)
            }
            Some(_) => Err(format_error("test_cases is not an array", reply)),
            None => Err(format_error("object reply has no test_cases key", reply)),
        },
        _ => Err(format_error("reply is neither an array nor an object", reply)),
    }
}

fn normalize_grounding(record: &mut Value, sources: &[String], placeholders: &[String]) {
    let Some(field) = record.get_mut(GROUNDED_IN) else {
        return;
    };

    match field {
        Value::String(joined) => {
            let list: Vec<Value> = joined
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect();
            tracing::debug!(from = %joined, entries = list.len(), "split comma-joined Grounded_In");
            *field = Value::Array(list);
        }
        Value::Array(items) if items.len() == 1 => {
            let is_placeholder = items[0]
                .as_str()
                .map(|s| placeholders.iter().any(|p| p.eq_ignore_ascii_case(s.trim())))
                .unwrap_or(false);
            if is_placeholder {
                tracing::debug!(?sources, "replaced placeholder Grounded_In with retrieved sources");
                *field = Value::Array(sources.iter().cloned().map(Value::String).collect());
            }
        }
        _ => {}
    }
}

fn format_error(reason: &str, reply: &str) -> QaError {
    QaError::GenerationFormat {
        reason: reason.to_string(),
        excerpt: excerpt(reply),
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}

/// Remove a code fence wrapping the whole reply, if there is one.
/// Anything else is returned unchanged.
pub fn strip_code_fence(reply: &str) -> String {
    let trimmed = reply.trim();
    if !trimmed.starts_with("```") || !trimmed.ends_with("```") || trimmed.len() < 6 {
        return reply.to_string();
    }
    let inner = &trimmed[3..trimmed.len() - 3];
    // Drop the info string (e.g. "python") on the opening line.
    let body = match inner.find('\n') {
        Some(nl) => &inner[nl + 1..],
        None => inner,
    };
    body.trim_end().to_string() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    const BARE: &str = r#"[{"Test_ID":"TC-001","Feature":"Discount","Test_Scenario":"Apply SAVE15","Expected_Result":"Price reduced 15%","Grounded_In":["specs.md"]}]"#;

    fn sources() -> Vec<String> {
        vec!["specs.md".to_string(), "ui.txt".to_string()]
    }

    fn placeholders() -> Vec<String> {
        vec!["context".to_string()]
    }

    fn decode(reply: &str) -> QaResult<Vec<TestCase>> {
        decode_test_cases(reply, &sources(), &placeholders())
    }

    #[test]
    fn bare_array() {
        let cases = decode(BARE).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].test_id, "TC-001");
        assert_eq!(cases[0].grounded_in, vec!["specs.md"]);
    }

    #[test]
    fn object_wrapped_array() {
        let reply = format!(r#"{{"test_cases": {}}}"#, BARE);
        assert_eq!(decode(&reply).unwrap(), decode(BARE).unwrap());
    }

    #[test]
    fn fenced_block_with_prose() {
        let reply = format!(
            "Here are the test cases you asked for:\n\n```json\n{}\n```\n\nLet me know if you need more.",
            BARE
        );
        assert_eq!(decode(&reply).unwrap(), decode(BARE).unwrap());
    }

    #[test]
    fn comma_joined_grounded_in_is_split() {
        let reply = r#"[{"Test_ID":"TC-001","Feature":"Discount","Test_Scenario":"Apply SAVE15","Expected_Result":"Price reduced 15%","Grounded_In":"specs.md, ui.txt"}]"#;
        let cases = decode(reply).unwrap();
        assert_eq!(cases[0].grounded_in, vec!["specs.md", "ui.txt"]);
    }

    #[test]
    fn comma_joined_drops_empty_entries() {
        let reply = r#"[{"Test_ID":"T","Feature":"F","Test_Scenario":"S","Expected_Result":"E","Grounded_In":" specs.md,, ,ui.txt,"}]"#;
        assert_eq!(decode(reply).unwrap()[0].grounded_in, vec!["specs.md", "ui.txt"]);
    }

    #[test]
    fn placeholder_becomes_retrieved_sources() {
        let reply = r#"[{"Test_ID":"T","Feature":"F","Test_Scenario":"S","Expected_Result":"E","Grounded_In":["context"]}]"#;
        assert_eq!(decode(reply).unwrap()[0].grounded_in, sources());
    }

    #[test]
    fn placeholder_only_applies_to_single_entry() {
        let reply = r#"[{"Test_ID":"T","Feature":"F","Test_Scenario":"S","Expected_Result":"E","Grounded_In":["context","specs.md"]}]"#;
        assert_eq!(decode(reply).unwrap()[0].grounded_in, vec!["context", "specs.md"]);
    }

    #[test]
    fn no_array_is_format_error() {
        let err = decode("I could not find any relevant features.").unwrap_err();
        assert!(matches!(err, QaError::GenerationFormat { .. }));
    }

    #[test]
    fn broken_array_is_format_error() {
        let err = decode(r#"Sure: [{"Test_ID": "TC-001", }"#).unwrap_err();
        assert!(matches!(err, QaError::GenerationFormat { .. }));
        let err = decode(r#"Sure: [{"Test_ID": "TC-001",] oops"#).unwrap_err();
        assert!(matches!(err, QaError::GenerationFormat { .. }));
    }

    #[test]
    fn object_without_test_cases_is_format_error() {
        let err = decode(r#"{"cases": []}"#).unwrap_err();
        assert!(matches!(err, QaError::GenerationFormat { .. }));
    }

    #[test]
    fn one_invalid_record_fails_the_whole_reply() {
        let reply = format!(
            r#"[{}, {{"Test_ID":"TC-002","Feature":"Cart"}}]"#,
            &BARE[1..BARE.len() - 1]
        );
        match decode(&reply).unwrap_err() {
            QaError::GenerationValidation { index, message } => {
                assert_eq!(index, 1);
                assert!(message.contains("Test_Scenario"), "{}", message);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn extra_keys_are_dropped() {
        let reply = r#"[{"Test_ID":"T","Feature":"F","Test_Scenario":"S","Expected_Result":"E","Grounded_In":["specs.md"],"Priority":"High","Preconditions":"Cart has items"}]"#;
        let cases = decode(reply).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].test_id, "T");
        assert_eq!(cases[0].grounded_in, vec!["specs.md"]);
    }

    #[test]
    fn empty_array_is_empty_result() {
        assert!(decode("[]").unwrap().is_empty());
    }

    #[test]
    fn strips_surrounding_fence() {
        let reply = "```python\nfrom selenium import webdriver\nprint('ok')\n```";
        assert_eq!(
            strip_code_fence(reply),
            "from selenium import webdriver\nprint('ok')\n"
        );
    }

    #[test]
    fn unfenced_script_is_verbatim() {
        let reply = "from selenium import webdriver\n";
        assert_eq!(strip_code_fence(reply), reply);
        let partial = "Here you go:\n```python\nx = 1\n```";
        assert_eq!(strip_code_fence(partial), partial);
    }
}
