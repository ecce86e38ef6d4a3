//! # cogvm
//!
//! A virtual machine that drives a slow, fallible compute unit.
//!
//! ## Core Concepts
//! - **Pages**: Named values in a bounded working set, spilled to a durable store on eviction
//! - **Stack**: Per-task operand stack for intermediate values
//! - **Opcodes**: Instruction set for memory, thinking, control flow, tools and parallelism
//! - **Tasks**: Independent executions sharing pages, fanned out by SPAWN and PARALLEL
//! - **Units**: Trait-based compute and tool backends awaited by the scheduler
//! - **Trace**: Append-only record of every step, transition and landed call

pub mod config;
pub mod error;
pub mod frame;
pub mod interpreter;
pub mod memory;
pub mod opcode;
pub mod program;
pub mod run;
pub mod scheduler;
pub mod stack;
pub mod storage;
pub mod task;
pub mod trace;
pub mod units;
pub mod value;

pub use config::VmConfig;
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use frame::{CallStack, Frame, FrameKind};
pub use interpreter::{ExternalCall, Interpreter, Step, Suspension};
pub use memory::{Memory, Page};
pub use opcode::{Branch, InferParams, LogLevel, Opcode, Program, Range, Register};
pub use program::CodeBlock;
pub use run::{Registers, Run};
pub use scheduler::{failure_payload, RunOutcome, Scheduler};
pub use stack::Stack;
pub use storage::{FileStorage, MemoryStorage, Storage, StorageBackend};
pub use task::{Task, TaskError, TaskId, TaskState};
pub use trace::{Trace, TraceEntry, TraceEvent};
pub use units::{
    ComputeKind, ComputeRequest, ComputeUnit, LocalToolUnit, ScriptedComputeUnit, ScriptedToolUnit,
    ToolKind, ToolUnit,
};
