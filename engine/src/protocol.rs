//! Wire-level message grammar for the `/judge` transport.
//!
//! Every frame is one UTF-8 JSON object carrying a `type` discriminant; there
//! is no chunking. Inbound frames are parsed by hand against a raw
//! `serde_json::Value` rather than through a single `#[serde(tag = "type")]`
//! enum, so that an unrecognized `type` produces the contract-specified
//! `error{message: "Unknown message type: …"}` instead of a generic serde
//! parse failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One submitted source file, as it arrives on the wire.
#[derive(Clone, Debug, Deserialize)]
pub struct WireSourceFile {
    pub name: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

/// One case of a `run_batch` request.
#[derive(Clone, Debug, Deserialize)]
pub struct WireTestCase {
    pub stdin: Option<String>,
}

// Limit fields are deserialized as `i64`, not `u64`: a client sending a
// negative limit (e.g. `"run_timeout": -1`) must reach the session's own
// validation so it can be reported as a contract violation — a single
// `error` then close 4002. Typed as `u64`, serde would reject the frame
// during deserialization itself, before validation ever runs, which
// collapses that case into the generic malformed-message path instead.
#[derive(Clone, Debug, Deserialize)]
pub struct InitMessage {
    pub language: Option<String>,
    pub version: Option<String>,
    pub files: Option<Vec<WireSourceFile>>,

    pub compile_timeout: Option<i64>,
    pub run_timeout: Option<i64>,
    pub compile_cpu_time: Option<i64>,
    pub run_cpu_time: Option<i64>,
    pub compile_memory_limit: Option<i64>,
    pub run_memory_limit: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RunTestMessage {
    pub stdin: Option<String>,
    #[serde(default)]
    pub test_id: Option<Value>,
    pub timeout: Option<i64>,
    pub cpu_time: Option<i64>,
    pub memory_limit: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RunBatchMessage {
    pub test_cases: Option<Vec<WireTestCase>>,
    pub timeout: Option<i64>,
    pub cpu_time: Option<i64>,
    pub memory_limit: Option<i64>,
}

/// A parsed inbound message, or the reason parsing it failed.
pub enum Inbound {
    Init(InitMessage),
    RunTest(RunTestMessage),
    RunBatch(RunBatchMessage),
    Close,
}

/// Parsing an inbound frame failed before we even got to dispatch it.
pub enum ParseError {
    /// The frame was not a JSON object, or had no `type` field.
    Malformed(String),
    /// The `type` field named something we don't recognize.
    UnknownType(String),
}

/// Parse one inbound text frame.
///
/// This never rejects on the *contents* of a recognized message — a missing
/// `files` array, say, deserializes to `None` and is caught by the session's
/// own validation, which can attach a field-specific message. Only frames
/// that aren't well-formed JSON, or that don't even have a usable `type`
/// tag, fail here.
pub fn parse_inbound(raw: &str) -> Result<Inbound, ParseError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ParseError::Malformed(format!("invalid JSON: {}", e)))?;

    let type_tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::Malformed("message has no string `type` field".to_owned()))?;

    match type_tag {
        "init" => serde_json::from_value(value)
            .map(Inbound::Init)
            .map_err(|e| ParseError::Malformed(format!("malformed init message: {}", e))),
        "run_test" => serde_json::from_value(value)
            .map(Inbound::RunTest)
            .map_err(|e| ParseError::Malformed(format!("malformed run_test message: {}", e))),
        "run_batch" => serde_json::from_value(value)
            .map(Inbound::RunBatch)
            .map_err(|e| ParseError::Malformed(format!("malformed run_batch message: {}", e))),
        "close" => Ok(Inbound::Close),
        other => Err(ParseError::UnknownType(other.to_owned())),
    }
}

/// A single case's outcome inside `result` or (as an element of `results`)
/// `batch_result` — `judge::TestResult` projected onto the wire.
#[derive(Clone, Debug, Serialize)]
pub struct WireStageResult {
    pub test_id: Value,
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub message: Option<String>,
    pub status: Option<String>,
    pub time: u64,
    pub cpu_time: u64,
    pub memory: u64,
}

/// Every message the server ever sends, tagged the same way inbound messages
/// are read: a `type` discriminant sibling to the payload fields.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Outbound {
    Ready {
        language: String,
        version: String,
        compiled: bool,
    },
    Compiled {
        success: bool,
        time: u64,
        stdout: String,
        stderr: String,
        error: Option<String>,
    },
    Result(WireStageResult),
    BatchResult {
        results: Vec<WireStageResult>,
        total_tests: usize,
        total_time: u64,
        total_cpu_time: u64,
        memory: u64,
        success: bool,
        stderr: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        test_id: Option<Value>,
    },
    Done {
        total_tests: u64,
        total_time: u64,
    },
}

impl Outbound {
    /// Serialize to the single-frame JSON text the transport sends.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("Outbound always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_message() {
        let raw = r#"{"type":"init","language":"python","version":"*","files":[{"content":"print(1)"}]}"#;
        match parse_inbound(raw) {
            Ok(Inbound::Init(msg)) => {
                assert_eq!(Some("python".to_owned()), msg.language);
                assert_eq!(1, msg.files.unwrap().len());
            }
            _ => panic!("expected Init"),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        match parse_inbound(r#"{"type":"frobnicate"}"#) {
            Err(ParseError::UnknownType(t)) => assert_eq!("frobnicate", t),
            _ => panic!("expected UnknownType"),
        }
    }

    #[test]
    fn test_parse_malformed_missing_type() {
        match parse_inbound(r#"{"language":"python"}"#) {
            Err(ParseError::Malformed(_)) => {}
            _ => panic!("expected Malformed"),
        }
    }

    #[test]
    fn test_outbound_ready_serializes_with_type_tag() {
        let frame = Outbound::Ready {
            language: "python".to_owned(),
            version: "3".to_owned(),
            compiled: false,
        }
        .to_frame();
        assert!(frame.contains("\"type\":\"ready\""));
        assert!(frame.contains("\"compiled\":false"));
    }

    #[test]
    fn test_outbound_error_omits_absent_test_id() {
        let frame = Outbound::Error {
            message: "boom".to_owned(),
            test_id: None,
        }
        .to_frame();
        assert!(!frame.contains("test_id"));
    }
}
