//! Scripted units
//!
//! Deterministic stand-ins for the compute and tool units. They answer from
//! a script, optionally after a delay, and record every call so runs can be
//! replayed and inspected.

use super::{ComputeRequest, ComputeUnit, ToolKind, ToolUnit};
use crate::error::{self, Error, ErrorKind, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Reply {
    Value(Value),
    Error(ErrorKind, String),
}

#[derive(Debug, Clone)]
struct Scripted {
    reply: Reply,
    delay: Option<Duration>,
}

impl Scripted {
    fn value(value: Value) -> Self {
        Self {
            reply: Reply::Value(value),
            delay: None,
        }
    }

    async fn deliver(self) -> Result<Value> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.reply {
            Reply::Value(value) => Ok(value),
            Reply::Error(kind, message) => Err(Error::new(kind, message).with_operation("ScriptedComputeUnit::invoke")),
        }
    }
}

/// Compute unit answering from a script.
///
/// Lookup order: exact instruction, then the FIFO queue, then the fallback.
/// With none of those an `InvalidResponse` error is returned.
#[derive(Debug, Default)]
pub struct ScriptedComputeUnit {
    responses: HashMap<String, Scripted>,
    queue: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    calls: Mutex<Vec<ComputeRequest>>,
}

#[derive(Debug, Default, Deserialize)]
struct Script {
    #[serde(default)]
    responses: HashMap<String, Value>,
    #[serde(default)]
    queue: Vec<Value>,
    #[serde(default)]
    fallback: Option<Value>,
}

impl ScriptedComputeUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `{responses: {instruction: value}, queue: [...], fallback}`
    pub fn from_value(value: Value) -> Result<Self> {
        let script: Script = serde_json::from_value(value)
            .map_err(|e| error::parse_error(format!("invalid response script: {}", e)))?;
        let mut unit = Self::new();
        for (instruction, reply) in script.responses {
            unit = unit.respond(instruction, reply);
        }
        for reply in script.queue {
            unit = unit.then(reply);
        }
        if let Some(fallback) = script.fallback {
            unit = unit.with_fallback(fallback);
        }
        Ok(unit)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).with_context("path", path.display().to_string()))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| error::parse_error(format!("{}: {}", path.display(), e)))?;
        Self::from_value(value)
    }

    /// Answer `instruction` with `value`, every time it is asked
    pub fn respond(mut self, instruction: impl Into<String>, value: Value) -> Self {
        self.responses.insert(instruction.into(), Scripted::value(value));
        self
    }

    /// Like `respond`, answering only after `delay`
    pub fn respond_after(mut self, instruction: impl Into<String>, value: Value, delay: Duration) -> Self {
        self.responses.insert(
            instruction.into(),
            Scripted {
                reply: Reply::Value(value),
                delay: Some(delay),
            },
        );
        self
    }

    /// Fail `instruction` with an error of `kind`
    pub fn fail(mut self, instruction: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.responses.insert(
            instruction.into(),
            Scripted {
                reply: Reply::Error(kind, message.into()),
                delay: None,
            },
        );
        self
    }

    /// Queue a reply for the next unmatched call
    pub fn then(self, value: Value) -> Self {
        self.push_reply(value);
        self
    }

    pub fn push_reply(&self, value: Value) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Scripted::value(value));
    }

    /// Reply used when nothing else matches
    pub fn with_fallback(mut self, value: Value) -> Self {
        self.fallback = Some(Scripted::value(value));
        self
    }

    /// Every request seen so far, in arrival order
    pub fn calls(&self) -> Vec<ComputeRequest> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn next_reply(&self, instruction: &str) -> Option<Scripted> {
        if let Some(scripted) = self.responses.get(instruction) {
            return Some(scripted.clone());
        }
        let queued = self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        queued.or_else(|| self.fallback.clone())
    }
}

impl ComputeUnit for ScriptedComputeUnit {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: ComputeRequest) -> Result<Value> {
        let reply = self.next_reply(&request.instruction);
        let instruction = request.instruction.clone();
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(request);

        match reply {
            Some(scripted) => scripted.deliver().await,
            None => Err(error::invalid_response(format!(
                "no scripted reply for '{}'",
                instruction
            ))),
        }
    }
}

/// Tool unit answering from a script, per tool or per tool and path
#[derive(Debug, Default)]
pub struct ScriptedToolUnit {
    by_tool: HashMap<ToolKind, Scripted>,
    by_path: HashMap<(ToolKind, String), Scripted>,
    calls: Mutex<Vec<(ToolKind, Map<String, Value>)>>,
}

impl ScriptedToolUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every `tool` call with `value`
    pub fn respond(mut self, tool: ToolKind, value: Value) -> Self {
        self.by_tool.insert(tool, Scripted::value(value));
        self
    }

    /// Answer `tool` calls on `path` with `value`
    pub fn respond_path(self, tool: ToolKind, path: impl Into<String>, value: Value) -> Self {
        self.respond_path_after(tool, path, value, Duration::ZERO)
    }

    /// Answer `tool` calls on `path` with `value` after `delay`
    pub fn respond_path_after(
        mut self,
        tool: ToolKind,
        path: impl Into<String>,
        value: Value,
        delay: Duration,
    ) -> Self {
        let scripted = Scripted {
            reply: Reply::Value(value),
            delay: (!delay.is_zero()).then_some(delay),
        };
        self.by_path.insert((tool, path.into()), scripted);
        self
    }

    pub fn calls(&self) -> Vec<(ToolKind, Map<String, Value>)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ToolUnit for ScriptedToolUnit {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, tool: ToolKind, args: Map<String, Value>) -> Value {
        let path = args.get("path").and_then(Value::as_str).map(str::to_string);
        let scripted = path
            .and_then(|p| self.by_path.get(&(tool, p)).cloned())
            .or_else(|| self.by_tool.get(&tool).cloned());
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push((tool, args));

        match scripted {
            Some(scripted) => scripted
                .deliver()
                .await
                .unwrap_or_else(|e| json!({"success": false, "error": e.message()})),
            None => json!({"success": false, "error": format!("no scripted response for {}", tool)}),
        }
    }
}
