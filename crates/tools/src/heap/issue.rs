use thiserror::Error;

/// Data-quality problems met while capturing or decoding.
///
/// None of these abort a capture: the orchestrator renders them into the
/// result's `limitations` list and marks the summary unparsed where relevant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureIssue {
    #[error("Malformed capture: {0}")]
    MalformedCapture(String),

    #[error(
        "Capture truncated: {seen} bytes streamed but maxCaptureBytes is {budget}; \
         the file holds only the first {written} bytes, so parsing was skipped"
    )]
    CaptureTruncated { seen: u64, written: u64, budget: u64 },

    #[error(
        "Parse skipped: capture is {size} bytes on disk, above maxParseBytes {budget}"
    )]
    ParseBudgetExceeded { size: u64, budget: u64 },

    #[error("Capture file I/O failure: {0}")]
    SinkIoFailure(String),

    #[error("Instrumentation unavailable: {0}")]
    InstrumentationUnavailable(String),
}

impl CaptureIssue {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedCapture(msg.into())
    }
}

impl From<serde_json::Error> for CaptureIssue {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedCapture(format!("invalid JSON document: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_message_mentions_budget() {
        let issue = CaptureIssue::CaptureTruncated {
            seen: 300,
            written: 100,
            budget: 100,
        };
        let msg = issue.to_string();
        assert!(msg.contains("truncated"));
        assert!(msg.contains("maxCaptureBytes is 100"));
    }

    #[test]
    fn test_json_error_is_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(CaptureIssue::from(err), CaptureIssue::MalformedCapture(_)));
    }
}
