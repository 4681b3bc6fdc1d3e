//! Fire-and-forget usage recording.
//!
//! The recorder is an external collaborator: it must never block the request
//! path, and its failures are logged and swallowed, never propagated.

use crate::model::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub session_id: SessionId,
    pub endpoint: String,
    pub http_method: String,
    pub status_code: u16,
}

pub trait UsageRecorder: Send + Sync + 'static {
    /// Record one request. Implementations must return quickly; anything
    /// slow belongs on the implementation's own queue.
    fn record(&self, record: UsageRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Default recorder: structured log line per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUsageRecorder;

impl UsageRecorder for LogUsageRecorder {
    fn record(&self, record: UsageRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(
            session_id = %record.session_id,
            endpoint = %record.endpoint,
            method = %record.http_method,
            status = record.status_code,
            "usage"
        );
        Ok(())
    }
}

/// Swallow recorder errors so they never reach the request path.
pub(crate) fn record_usage(recorder: &dyn UsageRecorder, record: UsageRecord) {
    let session_id = record.session_id.clone();
    if let Err(error) = recorder.record(record) {
        tracing::warn!(session_id = %session_id, error = %error, "usage recorder failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingRecorder;

    impl UsageRecorder for FailingRecorder {
        fn record(
            &self,
            _record: UsageRecord,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("backend down".into())
        }
    }

    #[test]
    fn recorder_errors_are_swallowed() {
        record_usage(
            &FailingRecorder,
            UsageRecord {
                session_id: "s1".into(),
                endpoint: "https://h/message".into(),
                http_method: "POST".into(),
                status_code: 200,
            },
        );
    }
}
