///
/// Scheduler error types.
///
/// `ThreadError` covers the recoverable failures of the thread API;
/// `ConfigError` covers loading and validating a `SchedulerConfig`.
/// Contract violations (yielding from outside a scheduled thread, a corrupted
/// ready queue) are not represented here: they panic.
///

use thiserror::Error;

use crate::pool::ThreadId;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("No thread with id {id}")]
    NoSuchThread { id: ThreadId },

    #[error("Thread pool exhausted: capacity is {capacity} threads")]
    CapacityExceeded { capacity: usize },

    #[error("Thread {id} cannot join itself")]
    JoinSelf { id: ThreadId },

    #[error("Scheduler has been shut down")]
    ShutDown,

    #[error("Failed to spawn backing thread for {id}: {source}")]
    Spawn {
        id: ThreadId,
        #[source]
        source: std::io::Error,
    },
}

impl ThreadError {
    /// Status code reported through the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            ThreadError::NoSuchThread { .. } => -1,
            ThreadError::CapacityExceeded { .. } => -2,
            ThreadError::ShutDown => -4,
            ThreadError::Spawn { .. } => -5,
            ThreadError::JoinSelf { .. } => -6,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid scheduler config: {0}")]
    Invalid(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ThreadError::NoSuchThread { id: ThreadId::new(9) };
        assert!(err.to_string().contains("No thread"));
        assert!(err.to_string().contains("#9"));

        let err = ThreadError::CapacityExceeded { capacity: 101 };
        assert!(err.to_string().contains("exhausted"));
        assert!(err.to_string().contains("101"));

        let err = ThreadError::JoinSelf { id: ThreadId::new(3) };
        assert!(err.to_string().contains("cannot join itself"));

        let err = ThreadError::Spawn {
            id: ThreadId::new(4),
            source: std::io::Error::other("out of memory"),
        };
        assert!(err.to_string().contains("#4"));
        assert!(err.to_string().contains("out of memory"));

        let err = ConfigError::Invalid("capacity must be at least 2".to_string());
        assert!(err.to_string().contains("Invalid scheduler config"));
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_error_codes_are_distinct() {
        let codes = [
            ThreadError::NoSuchThread { id: ThreadId::new(1) }.code(),
            ThreadError::CapacityExceeded { capacity: 1 }.code(),
            ThreadError::ShutDown.code(),
            ThreadError::Spawn {
                id: ThreadId::new(1),
                source: std::io::Error::other("x"),
            }
            .code(),
            ThreadError::JoinSelf { id: ThreadId::new(1) }.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(*a < 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
