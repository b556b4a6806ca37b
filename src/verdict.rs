//! Verdict types and the structured-output schema judges must follow.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Final classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictLabel {
    VerifiedHigh,
    VerifiedLow,
    Plausible,
    Unverifiable,
    Suspect,
    Incorrect,
}

impl VerdictLabel {
    pub const ALL: [VerdictLabel; 6] = [
        VerdictLabel::VerifiedHigh,
        VerdictLabel::VerifiedLow,
        VerdictLabel::Plausible,
        VerdictLabel::Unverifiable,
        VerdictLabel::Suspect,
        VerdictLabel::Incorrect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerifiedHigh => "verified-high",
            Self::VerifiedLow => "verified-low",
            Self::Plausible => "plausible",
            Self::Unverifiable => "unverifiable",
            Self::Suspect => "suspect",
            Self::Incorrect => "incorrect",
        }
    }
}

impl std::fmt::Display for VerdictLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the judge read a source itself or only saw it cited elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Fetched and read by the judge.
    Verified,
    /// Mentioned by another source, not independently fetched.
    Reported,
}

/// One cited source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Evidence {
    pub url: String,
    pub supports_claim: bool,
    pub provenance: Provenance,
}

/// A complete verdict for one (task, backend) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Verdict {
    pub verdict: VerdictLabel,
    pub rationale: String,
    pub sources: Vec<Evidence>,
}

/// Verdict with any field that failed to parse left empty.
///
/// Used when the backend's output was cut off: whatever survived is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialVerdict {
    pub verdict: Option<VerdictLabel>,
    pub rationale: Option<String>,
    #[serde(default)]
    pub sources: Vec<Evidence>,
}

impl From<Verdict> for PartialVerdict {
    fn from(v: Verdict) -> Self {
        PartialVerdict {
            verdict: Some(v.verdict),
            rationale: Some(v.rationale),
            sources: v.sources,
        }
    }
}

/// Why a verdict body was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerdictParseError {
    #[error("verdict output was empty")]
    Empty,
    #[error("verdict output is not JSON: {0}")]
    NotJson(String),
    #[error("verdict output does not match schema: {0}")]
    SchemaMismatch(String),
}

/// JSON Schema for the structured verdict.
pub fn verdict_schema() -> Value {
    let labels: Vec<&str> = VerdictLabel::ALL.iter().map(|l| l.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "verdict": {
                "type": "string",
                "enum": labels,
            },
            "rationale": {"type": "string"},
            "sources": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "url": {"type": "string"},
                        "supports_claim": {"type": "boolean"},
                        "provenance": {"type": "string", "enum": ["verified", "reported"]},
                    },
                    "required": ["url", "supports_claim", "provenance"],
                    "additionalProperties": false,
                },
            },
        },
        "required": ["verdict", "rationale", "sources"],
        "additionalProperties": false,
    })
}

/// Models sometimes wrap JSON in a markdown fence despite being told not to.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Strictly parse a schema-conformant verdict.
pub fn parse_verdict(raw: &str) -> Result<Verdict, VerdictParseError> {
    let body = strip_code_fence(raw);
    if body.is_empty() {
        return Err(VerdictParseError::Empty);
    }
    let value: Value =
        serde_json::from_str(body).map_err(|e| VerdictParseError::NotJson(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| VerdictParseError::SchemaMismatch(e.to_string()))
}

/// Salvage whatever fields parse from a possibly-truncated verdict.
///
/// Returns `None` when nothing at all can be recovered.
pub fn parse_partial_verdict(raw: &str) -> Option<PartialVerdict> {
    if let Ok(full) = parse_verdict(raw) {
        return Some(full.into());
    }

    let body = strip_code_fence(raw);
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        return Some(partial_from_map(&map));
    }

    // Truncated JSON: pick fields out of the text directly.
    let partial = PartialVerdict {
        verdict: scan_string_field(body, "verdict")
            .and_then(|s| serde_json::from_value(Value::String(s)).ok()),
        rationale: scan_string_field(body, "rationale"),
        sources: scan_sources(body),
    };
    if partial.verdict.is_none() && partial.rationale.is_none() && partial.sources.is_empty() {
        None
    } else {
        Some(partial)
    }
}

fn partial_from_map(map: &serde_json::Map<String, Value>) -> PartialVerdict {
    let verdict = map
        .get("verdict")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let rationale = map
        .get("rationale")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let sources = map
        .get("sources")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Evidence>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    PartialVerdict {
        verdict,
        rationale,
        sources,
    }
}

/// Find `"field": "<complete string>"` in text that may not be valid JSON.
fn scan_string_field(body: &str, field: &str) -> Option<String> {
    let pattern = format!(r#""{}"\s*:\s*("(?:[^"\\]|\\.)*")"#, regex::escape(field));
    let re = regex::Regex::new(&pattern).ok()?;
    let literal = re.captures(body)?.get(1)?.as_str();
    serde_json::from_str::<String>(literal).ok()
}

/// Every complete object in a `"sources": [...]` array that may be cut off
/// partway. Scanning stops at the first unterminated item.
fn scan_sources(body: &str) -> Vec<Evidence> {
    let mut sources = Vec::new();
    let Some(open) = regex::Regex::new(r#""sources"\s*:\s*\["#)
        .ok()
        .and_then(|re| re.find(body))
    else {
        return sources;
    };
    let rest = &body[open.end()..];

    let mut depth = 0usize;
    let mut item_start = None;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    item_start = Some(i);
                }
                depth += 1;
            }
            '}' if depth == 0 => break,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = item_start.take() {
                        if let Ok(evidence) = serde_json::from_str::<Evidence>(&rest[start..=i]) {
                            sources.push(evidence);
                        }
                    }
                }
            }
            ']' if depth == 0 => break,
            _ => {}
        }
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_verdict() {
        let raw = r#"{
            "verdict": "verified-high",
            "rationale": "Two independent sources agree.",
            "sources": [
                {"url": "https://a.example/x", "supports_claim": true, "provenance": "verified"},
                {"url": "https://b.example/y", "supports_claim": true, "provenance": "reported"}
            ]
        }"#;
        let verdict = parse_verdict(raw).unwrap();
        assert_eq!(verdict.verdict, VerdictLabel::VerifiedHigh);
        assert_eq!(verdict.sources.len(), 2);
        assert_eq!(verdict.sources[1].provenance, Provenance::Reported);
    }

    #[test]
    fn test_parse_fenced_verdict() {
        let raw = "```json\n{\"verdict\": \"plausible\", \"rationale\": \"r\", \"sources\": []}\n```";
        assert_eq!(parse_verdict(raw).unwrap().verdict, VerdictLabel::Plausible);
    }

    #[test]
    fn test_unknown_label_is_schema_mismatch() {
        let raw = r#"{"verdict": "probably", "rationale": "r", "sources": []}"#;
        assert!(matches!(
            parse_verdict(raw),
            Err(VerdictParseError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_extra_fields_are_schema_mismatch() {
        let raw = r#"{"verdict": "plausible", "rationale": "r", "sources": [], "confidence": 0.9}"#;
        assert!(matches!(
            parse_verdict(raw),
            Err(VerdictParseError::SchemaMismatch(_))
        ));

        let raw = r#"{"verdict": "plausible", "rationale": "r", "sources": [
            {"url": "https://a.example", "supports_claim": true, "provenance": "verified", "quote": "x"}
        ]}"#;
        assert!(matches!(
            parse_verdict(raw),
            Err(VerdictParseError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_non_json_is_rejected() {
        assert!(matches!(
            parse_verdict("I think it is fine."),
            Err(VerdictParseError::NotJson(_))
        ));
        assert_eq!(parse_verdict("   "), Err(VerdictParseError::Empty));
    }

    #[test]
    fn test_partial_from_truncated_output() {
        let raw = r#"{"verdict": "suspect", "rationale": "The cited page says 1953, n"#;
        assert!(parse_verdict(raw).is_err());
        let partial = parse_partial_verdict(raw).unwrap();
        assert_eq!(partial.verdict, Some(VerdictLabel::Suspect));
        assert!(partial.rationale.is_none());
        assert!(partial.sources.is_empty());
    }

    #[test]
    fn test_partial_keeps_sources_completed_before_truncation() {
        let raw = r#"{"verdict": "incorrect", "rationale": "Birth year differs.", "sources": [
            {"url": "https://a.example/{x}?q=\"]\"", "supports_claim": false, "provenance": "verified"},
            {"url": "https://b.example/y", "supports_claim": tr"#;
        assert!(parse_verdict(raw).is_err());
        let partial = parse_partial_verdict(raw).unwrap();
        assert_eq!(partial.verdict, Some(VerdictLabel::Incorrect));
        assert_eq!(partial.rationale.as_deref(), Some("Birth year differs."));
        assert_eq!(
            partial.sources,
            vec![Evidence {
                url: r#"https://a.example/{x}?q="]""#.to_string(),
                supports_claim: false,
                provenance: Provenance::Verified,
            }]
        );
    }

    #[test]
    fn test_partial_keeps_valid_sources() {
        let raw = r#"{"verdict": "incorrect", "sources": [
            {"url": "https://a.example", "supports_claim": false, "provenance": "verified"},
            {"url": "https://b.example"}
        ]}"#;
        let partial = parse_partial_verdict(raw).unwrap();
        assert_eq!(partial.verdict, Some(VerdictLabel::Incorrect));
        assert_eq!(partial.sources.len(), 1);
    }

    #[test]
    fn test_partial_nothing_recoverable() {
        assert!(parse_partial_verdict("{\"verd").is_none());
    }

    #[test]
    fn test_schema_lists_all_labels() {
        let schema = verdict_schema();
        let labels = schema["properties"]["verdict"]["enum"].as_array().unwrap();
        assert_eq!(labels.len(), 6);
        assert!(labels.contains(&json!("verified-low")));
    }
}
