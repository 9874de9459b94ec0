use serde::Serialize;
use std::time::SystemTime;

/// One completed iteration: the child ran (possibly after transient retries)
/// and its final output was recorded.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    #[serde(with = "rfc3339")]
    pub started_at: SystemTime,
    #[serde(with = "rfc3339")]
    pub ended_at: SystemTime,
    pub stdout: String,
    pub exit_code: i32,
    /// Transient retries absorbed before this iteration's output was accepted.
    pub retried: u32,
}

/// In-memory, append-only trail of iteration records. Never persisted and
/// never fed back to the child; it exists only for the final result.
#[derive(Debug, Default)]
pub struct History {
    records: Vec<IterationRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn all(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_retries(&self) -> u32 {
        self.records.iter().map(|record| record.retried).sum()
    }

    pub fn summary(&self) -> String {
        if self.records.is_empty() {
            return "no iterations".to_string();
        }
        let retries = self.total_retries();
        let last_exit = self.records[self.records.len() - 1].exit_code;
        format!(
            "{} iteration(s), {} retr{}, last exit code {}",
            self.records.len(),
            retries,
            if retries == 1 { "y" } else { "ies" },
            last_exit
        )
    }

    pub fn into_records(self) -> Vec<IterationRecord> {
        self.records
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxIterations,
    ChildNotFound,
    Cancelled,
    IoError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MaxIterations => "max_iterations",
            FailureReason::ChildNotFound => "child_not_found",
            FailureReason::Cancelled => "cancelled",
            FailureReason::IoError => "io_error",
        }
    }
}

/// Structured result of one run. `iterations` always equals `context.len()`;
/// on success the configured sentinel is a substring of `output`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub iterations: u32,
    pub output: String,
    pub duration_seconds: f64,
    pub context: Vec<IterationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

mod rfc3339 {
    use serde::Serializer;
    use std::time::SystemTime;

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let datetime: chrono::DateTime<chrono::Utc> = (*time).into();
        serializer.serialize_str(&datetime.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(iteration: u32, exit_code: i32, retried: u32) -> IterationRecord {
        let started_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_750_000_000);
        IterationRecord {
            iteration,
            started_at,
            ended_at: started_at + Duration::from_secs(30),
            stdout: format!("output {}", iteration),
            exit_code,
            retried,
        }
    }

    #[test]
    fn history_appends_in_order() {
        let mut history = History::new();
        assert!(history.is_empty());

        history.add(record(1, 0, 0));
        history.add(record(2, 0, 2));

        assert_eq!(history.len(), 2);
        assert_eq!(history.all()[0].iteration, 1);
        assert_eq!(history.all()[1].iteration, 2);
        assert_eq!(history.total_retries(), 2);
    }

    #[test]
    fn summary_reports_counts_and_last_exit() {
        let mut history = History::new();
        assert_eq!(history.summary(), "no iterations");

        history.add(record(1, 0, 1));
        assert_eq!(history.summary(), "1 iteration(s), 1 retry, last exit code 0");

        history.add(record(2, 7, 1));
        assert_eq!(history.summary(), "2 iteration(s), 2 retries, last exit code 7");
    }

    #[test]
    fn failure_reasons_serialize_to_snake_case_tags() {
        for (reason, expected) in [
            (FailureReason::MaxIterations, "\"max_iterations\""),
            (FailureReason::ChildNotFound, "\"child_not_found\""),
            (FailureReason::Cancelled, "\"cancelled\""),
            (FailureReason::IoError, "\"io_error\""),
        ] {
            assert_eq!(serde_json::to_string(&reason).unwrap(), expected);
            assert_eq!(format!("\"{}\"", reason.as_str()), expected);
        }
    }

    #[test]
    fn outcome_serializes_records_with_rfc3339_timestamps() {
        let outcome = RunOutcome {
            success: false,
            iterations: 1,
            output: "still thinking".to_string(),
            duration_seconds: 1.5,
            context: vec![record(1, 0, 0)],
            reason: Some(FailureReason::MaxIterations),
            error_detail: None,
        };

        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"reason\":\"max_iterations\""));
        assert!(json.contains("\"started_at\":\"2025-"));
        assert!(!json.contains("error_detail"));
    }
}
