//! # External units
//!
//! The two collaborators the VM drives:
//!
//! - `ComputeUnit` backs the thinking opcodes (INFER, PLAN, REFLECT, INJECT,
//!   INFER_BATCH, SUMMARIZE). It may fail with `Timeout`, `RateLimited` or
//!   `InvalidResponse`; the VM never retries.
//! - `ToolUnit` backs the tool opcodes. It always answers with a mapping
//!   holding `success: bool`, failures included.
//!
//! Both are awaited by the scheduler, never by the interpreter, so a slow
//! call only parks the task that made it.

pub mod local;
pub mod scripted;

pub use local::LocalToolUnit;
pub use scripted::{ScriptedComputeUnit, ScriptedToolUnit};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Which thinking opcode produced a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeKind {
    Infer,
    Plan,
    Reflect,
    Inject,
    Summarize,
}

impl ComputeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeKind::Infer => "infer",
            ComputeKind::Plan => "plan",
            ComputeKind::Reflect => "reflect",
            ComputeKind::Inject => "inject",
            ComputeKind::Summarize => "summarize",
        }
    }
}

impl fmt::Display for ComputeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call to the compute unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub kind: ComputeKind,
    /// Prompt, goal or question
    pub instruction: String,
    /// Context page values in declared order, current at call time
    pub context: Vec<Value>,
    /// Opcode parameters (temperature, target_tokens, ...)
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Register snapshot
    #[serde(default)]
    pub registers: Value,
}

impl ComputeRequest {
    pub fn new(kind: ComputeKind, instruction: impl Into<String>, context: Vec<Value>) -> Self {
        Self {
            kind,
            instruction: instruction.into(),
            context,
            parameters: Map::new(),
            registers: Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_registers(mut self, registers: Value) -> Self {
        self.registers = registers;
        self
    }
}

/// Tool operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    ListDir,
    Exec,
    Grep,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::ListDir => "list_dir",
            ToolKind::Exec => "exec",
            ToolKind::Grep => "grep",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The opaque reasoning backend
#[allow(async_fn_in_trait)]
pub trait ComputeUnit: Send + Sync {
    /// Unit name for traces
    fn name(&self) -> &str;

    async fn invoke(&self, request: ComputeRequest) -> Result<Value>;
}

/// The side-effecting tool backend
#[allow(async_fn_in_trait)]
pub trait ToolUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Always a mapping with `success: bool`
    async fn invoke(&self, tool: ToolKind, args: Map<String, Value>) -> Value;
}

/// Failure payload written in place of a tool result
pub fn tool_failure(message: impl Into<String>) -> Value {
    serde_json::json!({"success": false, "error": message.into()})
}
