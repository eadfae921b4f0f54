//! Error types for subfork.

use thiserror::Error;

use crate::codec::CodecError;

/// Main error type for dispatcher operations.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A caller-supplied argument was rejected before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The work function failed in the child. The message carries the
    /// submission site so failures can be traced back to their origin.
    #[error("Child (created at {file} line {line}) died with error: {message}")]
    ChildFailure {
        file: &'static str,
        line: u32,
        message: String,
    },

    /// The pipe reached EOF before a complete frame was read.
    #[error("could not read child data")]
    TruncatedFrame,

    /// The frame header or payload was inconsistent.
    #[error("malformed frame from child: {0}")]
    BadFrame(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("event loop error: {0}")]
    EventLoop(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Result type alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_failure_message_carries_origin() {
        let err = DispatchError::ChildFailure {
            file: "src/job.rs",
            line: 42,
            message: "division by zero".into(),
        };
        let text = err.to_string();
        assert!(text.contains("src/job.rs"));
        assert!(text.contains("line 42"));
        assert!(text.contains("division by zero"));
    }

    #[test]
    fn test_truncated_frame_message() {
        assert_eq!(
            DispatchError::TruncatedFrame.to_string(),
            "could not read child data"
        );
    }
}
