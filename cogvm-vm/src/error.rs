//! VM error helpers
//!
//! Re-exports cogvm-error and provides VM-specific constructors.

pub use cogvm_error::{Error, ErrorKind, ErrorStatus, Result};

use std::time::Duration;

// =============================================================================
// Memory
// =============================================================================

/// Create a PageNotFound error
pub fn page_not_found(page_id: impl Into<String>) -> Error {
    Error::page_not_found(page_id)
}

/// Create a MemoryExhausted error
pub fn memory_exhausted(page_id: &str, needed: usize, budget: usize, max_pages: usize) -> Error {
    Error::new(
        ErrorKind::MemoryExhausted,
        format!(
            "cannot fit page '{}' ({} units) within budget {} / {} pages",
            page_id, needed, budget, max_pages
        ),
    )
    .with_context("page_id", page_id)
    .with_context("needed", needed.to_string())
}

// =============================================================================
// Stack and frames
// =============================================================================

/// Create a StackOverflow error
pub fn stack_overflow(limit: usize) -> Error {
    Error::stack_overflow(limit)
}

/// Create a StackUnderflow error
pub fn stack_underflow(needed: usize, available: usize) -> Error {
    Error::stack_underflow(needed, available)
}

/// Create a CallDepthExceeded error
pub fn call_depth_exceeded(max: usize) -> Error {
    Error::new(ErrorKind::CallDepthExceeded, format!("call depth exceeded max {}", max))
        .with_context("max_depth", max.to_string())
}

// =============================================================================
// Programs
// =============================================================================

/// Create a MalformedOpcode error
pub fn malformed_opcode(op: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::malformed_opcode(op, reason)
}

/// Create a MalformedOpcode error pointing at a position in a block
pub fn malformed_at(position: usize, reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::MalformedOpcode, reason)
        .with_context("position", position.to_string())
}

/// Create an UnknownProgram error
pub fn unknown_program(program_id: impl Into<String>) -> Error {
    Error::unknown_program(program_id)
}

/// Create an InvalidLabel error
pub fn invalid_label(label: impl Into<String>) -> Error {
    Error::invalid_label(label)
}

/// Create an InvalidInjection error
pub fn invalid_injection(message: impl Into<String>) -> Error {
    Error::invalid_injection(message)
}

/// Create a StepLimitExceeded error
pub fn step_limit_exceeded(max: usize) -> Error {
    Error::new(ErrorKind::StepLimitExceeded, format!("task exceeded {} steps", max))
        .with_context("max_steps", max.to_string())
}

// =============================================================================
// Tasks
// =============================================================================

/// Create an UnknownTask error
pub fn unknown_task(task_id: impl Into<String>) -> Error {
    Error::unknown_task(task_id)
}

/// Create a Deadlock error
pub fn deadlock(task_id: impl Into<String>) -> Error {
    let task_id = task_id.into();
    Error::new(
        ErrorKind::Deadlock,
        format!("task '{}' is blocked and nothing can wake it", task_id),
    )
    .with_context("task_id", task_id)
}

/// Create an Abandoned error
pub fn abandoned(task_id: impl Into<String>, reason: &str) -> Error {
    let task_id = task_id.into();
    Error::new(ErrorKind::Abandoned, format!("task '{}' abandoned: {}", task_id, reason))
        .with_context("task_id", task_id)
}

// =============================================================================
// Debug
// =============================================================================

/// Create an AssertionFailed error
pub fn assertion_failed(message: impl Into<String>) -> Error {
    Error::assertion_failed(message)
}

/// Create a CheckpointNotFound error
pub fn checkpoint_not_found(name: impl Into<String>) -> Error {
    let name = name.into();
    Error::new(ErrorKind::CheckpointNotFound, format!("checkpoint '{}' not found", name))
        .with_context("checkpoint", name)
}

// =============================================================================
// External units
// =============================================================================

/// Create a Timeout error
pub fn timeout(limit: Duration) -> Error {
    Error::new(
        ErrorKind::Timeout,
        format!("external call exceeded {} ms", limit.as_millis()),
    )
    .with_context("limit_ms", limit.as_millis().to_string())
}

/// Create a RateLimited error
pub fn rate_limited(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::RateLimited, message)
}

/// Create an InvalidResponse error
pub fn invalid_response(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidResponse, message)
}

// =============================================================================
// Infrastructure
// =============================================================================

/// Create a ConfigInvalid error
pub fn config_invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::ConfigInvalid, message)
}

/// Create an IoFailed error
pub fn io_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::IoFailed, message)
}

/// Create a SerializationFailed error
pub fn serialization_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::SerializationFailed, message)
}

/// Create a StorageFailed error
pub fn storage_failed(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::StorageFailed, reason)
}

/// Create a ParseFailed error
pub fn parse_error(message: impl Into<String>) -> Error {
    Error::parse_failed(message)
}
