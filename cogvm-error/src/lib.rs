//! # cogvm-error
//!
//! Unified error handling for cogvm, modelled on OpenDAL's error practices.
//!
//! ## Design
//!
//! - **ErrorKind**: what went wrong (e.g. `PageNotFound`, `StackUnderflow`)
//! - **ErrorStatus**: how a caller may react (`Permanent`, `Temporary`, `Persistent`)
//! - **Context**: key/value pairs and the failing operation
//! - **Source**: the wrapped underlying error, never leaked as a raw type
//!
//! ## Usage
//!
//! ```rust
//! use cogvm_error::{Error, ErrorKind};
//!
//! fn example() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::PageNotFound, "page 'content' not loaded")
//!         .with_operation("interpreter::load")
//!         .with_context("page_id", "content")
//!         .with_context("task", "task_0"))
//! }
//! ```
//!
//! ## Principles
//!
//! - All fallible functions return `Result<T, cogvm_error::Error>`
//! - External errors are wrapped with `set_source(err)`
//! - An error is handled once; later layers only append context

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

/// Result type alias using the cogvm Error
pub type Result<T> = std::result::Result<T, Error>;
