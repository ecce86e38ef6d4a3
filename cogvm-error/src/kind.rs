//! Error kinds for cogvm operations

use std::fmt;

/// The kind of error that occurred.
///
/// Callers match on the kind to decide how to react; tasks that fail carry
/// the kind name in their error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// An unexpected error occurred - catch-all for unhandled cases
    Unexpected,

    /// The requested operation is not supported
    Unsupported,

    /// Invalid configuration or parameters
    ConfigInvalid,

    // =========================================================================
    // Program errors
    // =========================================================================
    /// An opcode record is missing a field or has the wrong shape
    MalformedOpcode,

    /// CALL or SPAWN named a program that was never registered
    UnknownProgram,

    /// Jump target does not exist in the current block
    InvalidLabel,

    /// INJECT produced content that is not a valid opcode block
    InvalidInjection,

    /// Call stack depth exceeded its maximum
    CallDepthExceeded,

    /// A task executed more opcodes than allowed
    StepLimitExceeded,

    // =========================================================================
    // Stack errors
    // =========================================================================
    /// Too many values pushed
    StackOverflow,

    /// Not enough values on the stack
    StackUnderflow,

    // =========================================================================
    // Memory errors
    // =========================================================================
    /// The requested page is neither resident nor in the durable store
    PageNotFound,

    /// The working set cannot fit a write even after eviction
    MemoryExhausted,

    // =========================================================================
    // Task errors
    // =========================================================================
    /// JOIN named a task id that is not live
    UnknownTask,

    /// Every remaining task is blocked and nothing is in flight
    Deadlock,

    /// Task was discarded by a rollback or by the end of its run
    Abandoned,

    // =========================================================================
    // Debug errors
    // =========================================================================
    /// ASSERT condition evaluated falsy
    AssertionFailed,

    /// ROLLBACK named an unknown checkpoint
    CheckpointNotFound,

    // =========================================================================
    // External unit errors
    // =========================================================================
    /// External call did not finish in time
    Timeout,

    /// External unit asked us to slow down
    RateLimited,

    /// External unit answered with something unusable
    InvalidResponse,

    // =========================================================================
    // Storage errors
    // =========================================================================
    /// Storage operation failed
    StorageFailed,

    /// Serialization/deserialization failed
    SerializationFailed,

    // =========================================================================
    // IO errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// IO operation failed
    IoFailed,

    // =========================================================================
    // Parse errors
    // =========================================================================
    /// Failed to parse input
    ParseFailed,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            // General
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::ConfigInvalid => "ConfigInvalid",

            // Program
            ErrorKind::MalformedOpcode => "MalformedOpcode",
            ErrorKind::UnknownProgram => "UnknownProgram",
            ErrorKind::InvalidLabel => "InvalidLabel",
            ErrorKind::InvalidInjection => "InvalidInjection",
            ErrorKind::CallDepthExceeded => "CallDepthExceeded",
            ErrorKind::StepLimitExceeded => "StepLimitExceeded",

            // Stack
            ErrorKind::StackOverflow => "StackOverflow",
            ErrorKind::StackUnderflow => "StackUnderflow",

            // Memory
            ErrorKind::PageNotFound => "PageNotFound",
            ErrorKind::MemoryExhausted => "MemoryExhausted",

            // Tasks
            ErrorKind::UnknownTask => "UnknownTask",
            ErrorKind::Deadlock => "Deadlock",
            ErrorKind::Abandoned => "Abandoned",

            // Debug
            ErrorKind::AssertionFailed => "AssertionFailed",
            ErrorKind::CheckpointNotFound => "CheckpointNotFound",

            // External
            ErrorKind::Timeout => "Timeout",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::InvalidResponse => "InvalidResponse",

            // Storage
            ErrorKind::StorageFailed => "StorageFailed",
            ErrorKind::SerializationFailed => "SerializationFailed",

            // IO
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::IoFailed => "IoFailed",

            // Parse
            ErrorKind::ParseFailed => "ParseFailed",
        }
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
