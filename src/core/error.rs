use thiserror::Error;

/// Why a duplicity operation did not produce a result.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("another duplicity operation is already running")]
    Busy,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("duplicity exited with {}", exit_label(.code))]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("output exceeded {limit} bytes, process killed")]
    OutputOverflow { limit: usize },

    #[error("invalid cli options: {0}")]
    InvalidCliOptions(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

impl RunError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Every error is a failed run except `Busy`, which never started one.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Busy)
    }
}

/// Result of a scraping operation: whatever was parsed, plus the error if the run failed.
///
/// Listing and status output is parsed even when duplicity exits non-zero or is
/// cancelled, so a failed dry run does not hide chain data already printed.
#[derive(Debug)]
#[must_use]
pub struct Outcome<T> {
    pub data: T,
    pub error: Option<RunError>,
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self { data, error: None }
    }

    pub fn failed(data: T, error: RunError) -> Self {
        Self {
            data,
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            data: f(self.data),
            error: self.error,
        }
    }

    /// Drop partial data on failure.
    pub fn into_result(self) -> Result<T, RunError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_message_mentions_code_or_signal() {
        let err = RunError::ProcessExit {
            code: Some(23),
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "duplicity exited with status 23");

        let err = RunError::ProcessExit {
            code: None,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "duplicity exited with a signal");
    }

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(RunError::Cancelled.is_cancelled());
        assert!(RunError::Cancelled.is_failure());
        assert!(!RunError::OutputOverflow { limit: 1 }.is_cancelled());
        assert!(!RunError::Busy.is_failure());
    }

    #[test]
    fn outcome_keeps_data_next_to_error() {
        let outcome = Outcome::failed(vec![1, 2], RunError::Cancelled).map(|v| v.len());
        assert!(outcome.is_failed());
        assert_eq!(outcome.data, 2);
        assert!(outcome.into_result().unwrap_err().is_cancelled());

        let outcome = Outcome::ok("done");
        assert!(!outcome.is_failed());
        assert_eq!(outcome.into_result().unwrap(), "done");
    }
}
