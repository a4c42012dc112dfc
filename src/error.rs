//! Error types for the build/restart lifecycle

use std::time::Duration;
use thiserror::Error;

/// The build command failed or could not be launched.
///
/// Cloneable so the coordinator can replay it for every request until the
/// next dirty signal arrives.
#[derive(Debug, Clone, Error)]
#[error("build error: {message}")]
pub struct BuildError {
    /// Short description of the failure (exit status or spawn error)
    pub message: String,
    /// Combined stdout/stderr captured from the build command
    pub output: Vec<u8>,
}

impl BuildError {
    pub fn new(message: impl Into<String>, output: Vec<u8>) -> Self {
        Self {
            message: message.into(),
            output,
        }
    }
}

/// No connection could be opened before the deadline.
#[derive(Debug, Clone, Error)]
#[error("timed out waiting for connection to {addr} after {timeout:?}")]
pub struct TimeoutError {
    pub addr: String,
    pub timeout: Duration,
}

/// The backend could not be launched or never became reachable.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl StartError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StartError::Timeout(_))
    }
}

/// Outcome of a failed readiness check.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("failed to start app: {0}")]
    Start(#[from] StartError),
    #[error("readiness check did not complete: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

impl LifecycleError {
    /// Build output attached to this error (empty for start failures)
    pub fn output(&self) -> &[u8] {
        match self {
            LifecycleError::Build(e) => &e.output,
            LifecycleError::Start(_) | LifecycleError::Interrupted(_) => &[],
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            output: self.output().to_vec(),
            error: self.to_string(),
        }
    }
}

/// What the error page is rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub output: Vec<u8>,
    pub error: String,
}

/// Failure of the client-side dirty notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to connect to proxy: {0}")]
    Unreachable(#[from] TimeoutError),
    #[error("invalid notify url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
    #[error("failed to notify proxy: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_report_carries_output() {
        let err = LifecycleError::from(BuildError::new(
            "exit status: 2",
            b"main.rs:3: expected `;`".to_vec(),
        ));
        let report = err.report();

        assert_eq!(report.error, "build error: exit status: 2");
        assert_eq!(report.output, b"main.rs:3: expected `;`".to_vec());
    }

    #[test]
    fn test_start_error_report_has_empty_output() {
        let err = LifecycleError::from(StartError::from(TimeoutError {
            addr: "127.0.0.1:3000".to_string(),
            timeout: Duration::from_secs(2),
        }));
        let report = err.report();

        assert!(report.output.is_empty());
        assert!(report.error.starts_with("failed to start app: timed out"));
        assert!(report.error.contains("127.0.0.1:3000"));
    }

    #[test]
    fn test_timeout_is_distinguishable_from_launch_failure() {
        let timeout = StartError::from(TimeoutError {
            addr: "127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(1),
        });
        let launch = StartError::Launch {
            binary: "./app".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };

        assert!(timeout.is_timeout());
        assert!(!launch.is_timeout());
        assert_eq!(launch.to_string(), "failed to launch ./app: no such file");
    }
}
