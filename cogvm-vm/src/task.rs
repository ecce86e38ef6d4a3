//! # Tasks
//!
//! A task is one running instance of a code block: program counter, call
//! stack, operand stack, bindings and lifecycle state. Tasks share the run's
//! pages but nothing else.

use crate::config::VmConfig;
use crate::error::Error;
use crate::frame::CallStack;
use crate::program::CodeBlock;
use crate::stack::Stack;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;

/// Task identifier, unique among live tasks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Ready,
    Running,
    /// An external call is in flight
    Waiting,
    /// Waiting on other tasks or on a reserved page
    Blocked,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// Allowed edges of the state machine. Any live state may fail, which
    /// covers abandonment and deadlock breaking.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Ready, Running) => true,
            (Running, Ready | Waiting | Blocked | Done) => true,
            (Waiting | Blocked, Ready) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Waiting => "WAITING",
            TaskState::Blocked => "BLOCKED",
            TaskState::Done => "DONE",
            TaskState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Error kind name, or `Fail` for the FAIL opcode
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pc: Option<usize>,
}

impl TaskError {
    pub fn from_error(err: &Error) -> Self {
        Self {
            kind: err.kind().as_str().to_string(),
            message: err.message().to_string(),
            program: None,
            pc: None,
        }
    }

    /// Error raised by the FAIL opcode
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            kind: "Fail".to_string(),
            message: message.into(),
            program: None,
            pc: None,
        }
    }

    /// Record where the error happened
    pub fn at(mut self, program: impl Into<String>, pc: usize) -> Self {
        self.program = Some(program.into());
        self.pc = Some(pc);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"kind": self.kind, "message": self.message}))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let (Some(program), Some(pc)) = (&self.program, self.pc) {
            write!(f, " (at {}:{})", program, pc)?;
        }
        Ok(())
    }
}

/// Why a task is BLOCKED
#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    /// JOIN or PARALLEL waiting for these tasks
    Join(Vec<TaskId>),
    /// Next opcode touches a page another task has reserved
    Page(String),
}

/// A pending JOIN or PARALLEL: result keys and the tasks behind them
#[derive(Debug, Clone, PartialEq)]
pub struct JoinWait {
    pub entries: Vec<(String, TaskId)>,
    pub store_to: String,
}

impl JoinWait {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|(_, id)| id.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    /// Block currently executing
    pub code: CodeBlock,
    pub pc: usize,
    pub frames: CallStack,
    pub stack: Stack,
    /// Spawn arguments; `args` holds the whole value
    pub bindings: Map<String, Value>,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub join: Option<JoinWait>,
    pub blocked_on: Option<BlockReason>,
    /// Serial of the external call this task is WAITING on
    pub pending_call: Option<u64>,
    /// Opcodes executed so far
    pub steps: usize,
}

impl Task {
    pub fn new(id: TaskId, code: CodeBlock, parent: Option<TaskId>, args: Value, config: &VmConfig) -> Self {
        let mut bindings = Map::new();
        if let Value::Object(map) = &args {
            bindings.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if !args.is_null() {
            bindings.insert("args".to_string(), args);
        }
        Self {
            id,
            parent,
            pc: code.entry(),
            code,
            frames: CallStack::new(config.max_call_depth),
            stack: Stack::with_limit(config.max_stack),
            bindings,
            state: TaskState::Ready,
            result: None,
            error: None,
            join: None,
            blocked_on: None,
            pending_call: None,
            steps: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// String values this task may use as page ids, plus its pending JOIN target
    pub fn collect_page_refs(&self, out: &mut HashSet<String>) {
        let frame_bindings = self.frames.iter().flat_map(|f| f.bindings.values());
        for value in self.bindings.values().chain(frame_bindings) {
            collect_strings(value, out);
        }
        if let Some(join) = &self.join {
            out.insert(join.store_to.clone());
        }
    }

    /// `{success, value}` or `{success, error}` as surfaced by JOIN
    pub fn outcome(&self) -> Value {
        match (self.state, &self.error) {
            (TaskState::Done, _) => json!({
                "success": true,
                "value": self.result.clone().unwrap_or(Value::Null),
            }),
            (_, Some(error)) => json!({"success": false, "error": error.to_value()}),
            (state, None) => json!({
                "success": false,
                "error": {"kind": "Unexpected", "message": format!("task is {}", state)},
            }),
        }
    }
}

fn collect_strings(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            out.insert(s.clone());
        }
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
