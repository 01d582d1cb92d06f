//! Maps raw step failures onto the provisioning error taxonomy.
//!
//! Errors that never got a response from the engine are transient. Anything
//! else is checked in priority order: duplicate, missing reference,
//! validation, transient, then unknown. The first match wins, so an
//! "already exists" conflict is never mistaken for a validation error.

use db::models::provisioning_run::ErrorKind;
use engine_client::EngineError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::step::StepError;

const MAX_MESSAGE_LEN: usize = 500;
const SHORT_MESSAGE_LEN: usize = 300;

/// Outcome of classifying one failure
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorClassification {
    /// Whether this failure halts the run, given the step's own criticality.
    pub fn is_critical(&self, step_is_critical: bool) -> bool {
        is_critical(self.kind, step_is_critical)
    }
}

pub fn is_critical(kind: ErrorKind, step_is_critical: bool) -> bool {
    match kind {
        ErrorKind::Duplicate => false,
        ErrorKind::MissingReference | ErrorKind::Unknown => true,
        ErrorKind::Validation | ErrorKind::Transient => step_is_critical,
    }
}

pub fn classify(error: &StepError) -> ErrorClassification {
    match error {
        StepError::Engine(e) => classify_engine_error(e),
        StepError::MissingInput(_) => ErrorClassification {
            kind: ErrorKind::MissingReference,
            message: error.to_string(),
        },
        StepError::InvalidConfig(_) => ErrorClassification {
            kind: ErrorKind::Validation,
            message: error.to_string(),
        },
        StepError::Other(e) => {
            let message = clean_message(&format!("{e:#}"));
            ErrorClassification {
                kind: classify_text(None, "", &message),
                message,
            }
        }
    }
}

pub fn classify_engine_error(error: &EngineError) -> ErrorClassification {
    let message = extract_message(error);
    // Transport errors are transient whatever their wording.
    let kind = if error.is_transport() {
        ErrorKind::Transient
    } else {
        let haystack = format!("{} {}", message, error.message);
        classify_text(error.status_code, &error.kind, &haystack)
    };
    ErrorClassification { kind, message }
}

fn classify_text(status_code: Option<u16>, exc_type: &str, text: &str) -> ErrorKind {
    let text = text.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if status_code == Some(409)
        || exc_type.contains("DuplicateEntry")
        || has(&["already exists", "duplicate"])
    {
        return ErrorKind::Duplicate;
    }

    if status_code == Some(404)
        || exc_type.contains("LinkValidation")
        || exc_type.contains("DoesNotExist")
        || has(&["could not find", "does not exist", "not found"])
    {
        return ErrorKind::MissingReference;
    }

    if matches!(status_code, Some(400) | Some(417) | Some(422))
        || exc_type.contains("Validation")
        || exc_type.contains("Mandatory")
        || has(&["mandatory", "invalid", "validation"])
    {
        return ErrorKind::Validation;
    }

    if matches!(status_code, Some(429) | Some(502) | Some(503) | Some(504))
        || exc_type == engine_client::CONNECTION_ERROR
        || exc_type == engine_client::TIMEOUT_ERROR
        || has(&[
            "connection refused",
            "connection reset",
            "timed out",
            "timeout",
            "temporarily unavailable",
        ])
    {
        return ErrorKind::Transient;
    }

    ErrorKind::Unknown
}

/// Most specific human-readable message carried by an engine error.
///
/// Preference: decoded `_server_messages`, a short `message`, `exception`
/// without its class prefix, the last line of an `exc` traceback, then
/// `error` / `detail`, and finally the error's own message.
pub fn extract_message(error: &EngineError) -> String {
    let extracted = error
        .raw
        .as_ref()
        .and_then(message_from_raw)
        .unwrap_or_else(|| error.message.clone());
    clean_message(&extracted)
}

fn message_from_raw(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(inner @ (Value::Object(_) | Value::Array(_))) => message_from_raw(&inner),
            _ if s.contains("Traceback") => last_traceback_line(s),
            _ => Some(s.clone()),
        },
        Value::Object(map) => {
            if let Some(messages) = map.get("_server_messages").and_then(Value::as_str) {
                if let Some(decoded) = decode_server_messages(messages) {
                    return Some(decoded);
                }
            }
            if let Some(message) = map.get("message").and_then(Value::as_str) {
                if is_short(message) {
                    return Some(message.to_string());
                }
            }
            if let Some(exception) = map.get("exception").and_then(Value::as_str) {
                return Some(strip_exception_prefix(exception));
            }
            if let Some(exc) = map.get("exc").and_then(Value::as_str) {
                if let Some(line) = last_traceback_line(exc) {
                    return Some(strip_exception_prefix(&line));
                }
            }
            for key in ["error", "detail"] {
                if let Some(text) = map.get(key).and_then(Value::as_str) {
                    return Some(text.to_string());
                }
            }
            map.get("message")
                .filter(|m| m.is_object())
                .and_then(message_from_raw)
        }
        Value::Array(items) => items.iter().find_map(message_from_raw),
        _ => None,
    }
}

/// `_server_messages` is a JSON list whose items are themselves JSON-encoded
/// objects with a `message` field.
fn decode_server_messages(encoded: &str) -> Option<String> {
    let items: Vec<Value> = serde_json::from_str(encoded).ok()?;
    let messages: Vec<String> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(obj) => obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                Err(_) => Some(s.clone()),
            },
            Value::Object(_) => item
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .filter(|m| !m.trim().is_empty())
        .collect();

    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}

/// `exc` is either a raw traceback or a JSON list of tracebacks.
fn last_traceback_line(exc: &str) -> Option<String> {
    let traceback = match serde_json::from_str::<Vec<String>>(exc) {
        Ok(list) => list.last().cloned()?,
        Err(_) => exc.to_string(),
    };
    traceback
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
}

fn strip_exception_prefix(text: &str) -> String {
    static EXCEPTION_PREFIX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*\.)*[A-Za-z_][A-Za-z0-9_]*(?:Error|Exception):\s*")
            .expect("valid exception prefix regex")
    });
    EXCEPTION_PREFIX.replace(text.trim(), "").to_string()
}

fn is_short(message: &str) -> bool {
    message.len() <= SHORT_MESSAGE_LEN && !message.contains("Traceback")
}

/// Strip markup, collapse whitespace and bound the length.
fn clean_message(message: &str) -> String {
    static HTML_TAG: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid html tag regex"));
    static WHITESPACE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

    let stripped = HTML_TAG.replace_all(message, " ");
    let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");
    if collapsed.chars().count() > MAX_MESSAGE_LEN {
        let mut truncated: String = collapsed.chars().take(MAX_MESSAGE_LEN).collect();
        truncated.push_str("...");
        truncated
    } else {
        collapsed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine_error(status: Option<u16>, kind: &str, message: &str, raw: Option<Value>) -> EngineError {
        let mut error = EngineError::new(kind, message);
        error.status_code = status;
        error.raw = raw;
        error
    }

    #[test]
    fn already_exists_is_duplicate() {
        let e = engine_error(
            Some(409),
            "DuplicateEntryError",
            "Company Acme already exists",
            None,
        );
        let classification = classify_engine_error(&e);
        assert_eq!(classification.kind, ErrorKind::Duplicate);
        assert!(!classification.is_critical(true));

        let by_text = engine_error(Some(417), "HTTPError", "Item ABC already exists", None);
        assert_eq!(classify_engine_error(&by_text).kind, ErrorKind::Duplicate);
    }

    #[test]
    fn could_not_find_is_missing_reference_and_always_critical() {
        let e = engine_error(
            Some(417),
            "LinkValidationError",
            "Could not find Country: Kenya",
            None,
        );
        let classification = classify_engine_error(&e);
        assert_eq!(classification.kind, ErrorKind::MissingReference);
        assert!(classification.is_critical(false));
    }

    #[test]
    fn mandatory_field_is_validation() {
        let e = engine_error(
            Some(417),
            "MandatoryError",
            "frappe.exceptions.MandatoryError: [Company, X]: abbr",
            None,
        );
        let classification = classify_engine_error(&e);
        assert_eq!(classification.kind, ErrorKind::Validation);
        assert!(classification.is_critical(true));
        assert!(!classification.is_critical(false));
    }

    #[test]
    fn transport_failures_are_transient() {
        let refused = EngineError::connection("Connection refused: tcp connect error");
        assert_eq!(classify_engine_error(&refused).kind, ErrorKind::Transient);

        let unavailable = engine_error(Some(503), "HTTPError", "Service Unavailable", None);
        assert_eq!(classify_engine_error(&unavailable).kind, ErrorKind::Transient);
    }

    #[test]
    fn transport_wording_never_reads_as_validation() {
        let tls = EngineError::connection("error sending request: invalid peer certificate: UnknownIssuer");
        assert_eq!(classify_engine_error(&tls).kind, ErrorKind::Transient);

        let dns = EngineError::connection("invalid dns name");
        let classification = classify_engine_error(&dns);
        assert_eq!(classification.kind, ErrorKind::Transient);
        assert!(classification.is_critical(true));
        assert!(!classification.is_critical(false));

        let slow = EngineError::timeout("operation timed out: resource not found in time");
        assert_eq!(classify_engine_error(&slow).kind, ErrorKind::Transient);
    }

    #[test]
    fn anything_else_is_unknown_and_fails_closed() {
        let e = engine_error(Some(500), "HTTPError", "Internal Server Error", None);
        let classification = classify_engine_error(&e);
        assert_eq!(classification.kind, ErrorKind::Unknown);
        assert!(classification.is_critical(false));
    }

    #[test]
    fn step_level_errors_map_onto_kinds() {
        let missing = classify(&StepError::MissingInput("company_id".into()));
        assert_eq!(missing.kind, ErrorKind::MissingReference);
        assert!(missing.message.contains("company_id"));

        let invalid = classify(&StepError::InvalidConfig("company_name must be a string".into()));
        assert_eq!(invalid.kind, ErrorKind::Validation);

        let other = classify(&StepError::Other(anyhow::anyhow!("socket timed out")));
        assert_eq!(other.kind, ErrorKind::Transient);
    }

    #[test]
    fn server_messages_are_decoded_from_nested_json() {
        let inner = json!({"message": "Could not find Country: Kenya", "title": "Message"}).to_string();
        let server_messages = serde_json::to_string(&vec![inner]).unwrap();
        let raw = json!({
            "exc_type": "LinkValidationError",
            "exception": "frappe.exceptions.LinkValidationError: Could not find Country: Kenya",
            "_server_messages": server_messages,
        });
        let e = engine_error(Some(417), "LinkValidationError", "raw", Some(raw));
        assert_eq!(extract_message(&e), "Could not find Country: Kenya");
    }

    #[test]
    fn exception_prefix_is_stripped() {
        let raw = json!({
            "exception": "frappe.exceptions.ValidationError: Abbreviation already used for another company",
        });
        let e = engine_error(Some(417), "ValidationError", "raw", Some(raw));
        assert_eq!(
            extract_message(&e),
            "Abbreviation already used for another company"
        );
    }

    #[test]
    fn traceback_falls_back_to_last_line() {
        let traceback = "Traceback (most recent call last):\n  File \"app.py\", line 1\n    run()\nfrappe.exceptions.DoesNotExistError: Warehouse Stores - AC not found\n";
        let raw = json!({"exc": serde_json::to_string(&vec![traceback]).unwrap()});
        let e = engine_error(Some(404), "DoesNotExistError", "raw", Some(raw));
        assert_eq!(extract_message(&e), "Warehouse Stores - AC not found");
    }

    #[test]
    fn short_message_preferred_over_traceback() {
        let raw = json!({
            "message": "Insufficient Permission for Company",
            "exc": "Traceback (most recent call last):\n  ...\nPermissionError",
        });
        let e = engine_error(Some(403), "PermissionError", "raw", Some(raw));
        assert_eq!(extract_message(&e), "Insufficient Permission for Company");
    }

    #[test]
    fn html_is_stripped_and_long_messages_truncated() {
        let e = engine_error(
            Some(502),
            "HTTPError",
            "raw",
            Some(Value::String("<html><body><h1>502 Bad Gateway</h1></body></html>".into())),
        );
        assert_eq!(extract_message(&e), "502 Bad Gateway");

        let long = "x".repeat(2000);
        let e = engine_error(None, "HTTPError", &long, None);
        let message = extract_message(&e);
        assert!(message.ends_with("..."));
        assert_eq!(message.chars().count(), MAX_MESSAGE_LEN + 3);
    }
}
