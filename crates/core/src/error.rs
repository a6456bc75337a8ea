//! Error classification shared by producer and consumer.
//!
//! Instead of inspecting error messages to decide whether to retry, every
//! error type in the pipeline reports which class of outcome it is.
//! Callers branch on the class, not on the concrete variant.

/// How a failure should be handled by whoever observes it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient; the operation may succeed on a later attempt
    /// (broker unreachable, channel lost).
    Retryable,
    /// Terminal for the owning process (startup retries exhausted,
    /// shutdown in progress).
    Fatal,
    /// Contained at the granularity of a single message or event;
    /// logged and dropped, the process continues (poison message,
    /// already-recorded duplicate).
    Ignorable,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClass::Fatal)
    }

    pub fn is_ignorable(&self) -> bool {
        matches!(self, ErrorClass::Ignorable)
    }
}

/// Implemented by every error type in the pipeline.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}
