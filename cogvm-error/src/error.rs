//! The main Error type for cogvm

use crate::{ErrorKind, ErrorStatus};
use std::fmt;

/// The unified error type for all cogvm operations.
///
/// Carries:
/// - `kind`: what type of error occurred
/// - `message`: human-readable description
/// - `status`: whether the error is retryable
/// - `operation`: what operation raised it
/// - `context`: key-value pairs for debugging
/// - `source`: the underlying error (if any)
///
/// # Example
///
/// ```rust
/// use cogvm_error::{Error, ErrorKind, ErrorStatus};
///
/// let err = Error::new(ErrorKind::Timeout, "compute unit did not answer")
///     .with_operation("scheduler::launch")
///     .with_context("task", "task_3")
///     .with_context("limit_ms", "1500");
///
/// assert_eq!(err.kind(), ErrorKind::Timeout);
/// assert_eq!(err.status(), ErrorStatus::Temporary);
/// ```
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<anyhow::Error>,
}

impl Error {
    /// Create a new error with the given kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = if kind.is_retryable() {
            ErrorStatus::Temporary
        } else {
            ErrorStatus::Permanent
        };

        Self {
            kind,
            message: message.into(),
            status,
            operation: "",
            context: Vec::new(),
            source: None,
        }
    }

    // =========================================================================
    // Getters
    // =========================================================================

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error status
    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Get the operation that raised this error
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Get the context key-value pairs
    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    /// Get the source error (if any)
    pub fn source_ref(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }

    // =========================================================================
    // Builders (chainable)
    // =========================================================================

    /// Set the error status
    pub fn with_status(mut self, status: ErrorStatus) -> Self {
        self.status = status;
        self
    }

    /// Mark as temporary (retryable)
    pub fn temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Mark as permanent (not retryable)
    pub fn permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }

    /// Set the operation that raised this error.
    ///
    /// A previously set operation is moved to context as "called" so the
    /// call chain survives.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Set the source error.
    ///
    /// # Panics (debug only)
    /// Panics in debug mode if source was already set.
    pub fn set_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "source error already set");
        self.source = Some(source.into());
        self
    }

    // =========================================================================
    // Status mutations
    // =========================================================================

    /// Mark as persistent after failed retries
    pub fn persist(mut self) -> Self {
        self.status = self.status.persist();
        self
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}

// =============================================================================
// Display - compact, single-line format for logs
// =============================================================================

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;

        if !self.context.is_empty() {
            write!(f, ", context {{ ")?;
            for (i, (key, value)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", key, value)?;
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        Ok(())
    }
}

// =============================================================================
// Debug - verbose, multi-line format for debugging
// =============================================================================

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;

        if !self.message.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Message: {}", self.message)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "        {}: {}", key, value)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "    Source: {:?}", source)?;
        }

        Ok(())
    }
}

// =============================================================================
// std::error::Error implementation
// =============================================================================

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// =============================================================================
// Convenient From implementations (be careful not to leak raw errors!)
// =============================================================================

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IoFailed,
        };
        Error::new(kind, err.to_string())
            .with_operation("io")
            .set_source(err)
    }
}

// =============================================================================
// Convenience constructors
// =============================================================================

impl Error {
    /// Create an Unexpected error
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    /// Create an Unsupported error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    /// Create a PageNotFound error
    pub fn page_not_found(page_id: impl Into<String>) -> Self {
        let page_id = page_id.into();
        Self::new(ErrorKind::PageNotFound, format!("page '{}' not found", page_id))
            .with_context("page_id", page_id)
    }

    /// Create a StackOverflow error
    pub fn stack_overflow(limit: usize) -> Self {
        Self::new(ErrorKind::StackOverflow, format!("stack depth exceeded maximum {}", limit))
            .with_context("limit", limit.to_string())
    }

    /// Create a StackUnderflow error
    pub fn stack_underflow(needed: usize, available: usize) -> Self {
        Self::new(
            ErrorKind::StackUnderflow,
            format!("needed {} stack values, found {}", needed, available),
        )
        .with_context("needed", needed.to_string())
        .with_context("available", available.to_string())
    }

    /// Create a MalformedOpcode error
    pub fn malformed_opcode(op: impl Into<String>, reason: impl Into<String>) -> Self {
        let op = op.into();
        Self::new(ErrorKind::MalformedOpcode, reason).with_context("opcode", op)
    }

    /// Create an UnknownProgram error
    pub fn unknown_program(program_id: impl Into<String>) -> Self {
        let program_id = program_id.into();
        Self::new(ErrorKind::UnknownProgram, format!("program '{}' is not registered", program_id))
            .with_context("program_id", program_id)
    }

    /// Create an UnknownTask error
    pub fn unknown_task(task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self::new(ErrorKind::UnknownTask, format!("task '{}' is not live", task_id))
            .with_context("task_id", task_id)
    }

    /// Create an InvalidLabel error
    pub fn invalid_label(label: impl Into<String>) -> Self {
        let label = label.into();
        Self::new(ErrorKind::InvalidLabel, format!("label '{}' not found", label))
            .with_context("label", label)
    }

    /// Create an InvalidInjection error
    pub fn invalid_injection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInjection, message)
    }

    /// Create a ParseFailed error
    pub fn parse_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseFailed, message)
    }

    /// Create an AssertionFailed error
    pub fn assertion_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AssertionFailed, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::new(ErrorKind::PageNotFound, "page 'context' not found");
        assert_eq!(err.kind(), ErrorKind::PageNotFound);
        assert_eq!(err.message(), "page 'context' not found");
        assert_eq!(err.status(), ErrorStatus::Permanent);
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::new(ErrorKind::Timeout, "no answer")
            .with_operation("scheduler::launch")
            .with_context("task", "task_1")
            .with_context("limit_ms", "1500");

        assert_eq!(err.operation(), "scheduler::launch");
        assert_eq!(err.context().len(), 2);
        assert_eq!(err.context()[0], ("task", "task_1".to_string()));
    }

    #[test]
    fn test_operation_chaining() {
        let err = Error::new(ErrorKind::IoFailed, "write failed")
            .with_operation("storage::set")
            .with_operation("run::write_page");

        assert_eq!(err.operation(), "run::write_page");
        assert_eq!(err.context().len(), 1);
        assert_eq!(err.context()[0], ("called", "storage::set".to_string()));
    }

    #[test]
    fn test_temporary_status() {
        let err = Error::new(ErrorKind::RateLimited, "slow down");
        assert!(err.is_retryable());

        let err = Error::new(ErrorKind::PageNotFound, "not found");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_persist() {
        let err = Error::new(ErrorKind::InvalidResponse, "garbled").temporary();
        assert!(err.is_retryable());

        let err = err.persist();
        assert!(!err.is_retryable());
        assert_eq!(err.status(), ErrorStatus::Persistent);
    }

    #[test]
    fn test_display() {
        let err = Error::new(ErrorKind::Timeout, "compute unit unavailable")
            .with_operation("scheduler::launch")
            .with_context("kind", "infer")
            .with_context("attempt", "3");

        let display = format!("{}", err);
        assert!(display.contains("Timeout"));
        assert!(display.contains("temporary"));
        assert!(display.contains("scheduler::launch"));
        assert!(display.contains("kind: infer"));
    }

    #[test]
    fn test_convenience_constructors() {
        let err = Error::page_not_found("context");
        assert_eq!(err.kind(), ErrorKind::PageNotFound);
        assert!(err.message().contains("context"));

        let err = Error::stack_overflow(256);
        assert_eq!(err.kind(), ErrorKind::StackOverflow);

        let err = Error::stack_underflow(2, 1);
        assert_eq!(err.kind(), ErrorKind::StackUnderflow);
        assert_eq!(err.message(), "needed 2 stack values, found 1");

        let err = Error::malformed_opcode("CHUNK", "chunk_size must be positive");
        assert_eq!(err.context()[0], ("opcode", "CHUNK".to_string()));
    }

    #[test]
    fn test_set_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::new(ErrorKind::FileNotFound, "program.json not found")
            .set_source(io_err);

        assert!(err.source_ref().is_some());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.operation(), "io");
    }
}
