//! # Execution trace
//!
//! Append-only record of executed opcodes, LOG messages, task state
//! transitions and landed external calls. Entries carry a global sequence
//! number, so cross-task interleaving is recorded rather than inferred;
//! per-task order follows from the sequence as well.

use crate::opcode::LogLevel;
use crate::task::{TaskId, TaskState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One trace record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Global append order
    pub seq: u64,
    pub task: TaskId,
    /// Steps the task had executed when this was recorded
    pub step: usize,
    pub program: String,
    pub pc: usize,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// An opcode ran
    Exec {
        opcode: String,
        detail: String,
        outcome: String,
    },
    /// A LOG opcode
    Log { level: LogLevel, message: String },
    /// A task was submitted or spawned
    Created {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<TaskId>,
    },
    /// A task changed state
    Transition {
        from: TaskState,
        to: TaskState,
        reason: String,
    },
    /// An external call landed
    External { call: String, success: bool },
}

/// Where an entry came from
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    pub task: &'a TaskId,
    pub step: usize,
    pub program: &'a str,
    pub pc: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Trace {
    entries: Vec<TraceEntry>,
    next_seq: u64,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number
    pub fn record(&mut self, origin: Origin<'_>, event: TraceEvent) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(TraceEntry {
            seq,
            task: origin.task.clone(),
            step: origin.step,
            program: origin.program.to_string(),
            pc: origin.pc,
            event,
        });
        seq
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last `n` entries in order
    pub fn tail(&self, n: usize) -> &[TraceEntry] {
        &self.entries[self.entries.len().saturating_sub(n)..]
    }

    /// Entries recorded for one task, in order
    pub fn for_task<'a>(&'a self, task: &'a TaskId) -> impl Iterator<Item = &'a TraceEntry> + 'a {
        self.entries.iter().filter(move |e| &e.task == task)
    }

    /// Last `n` entries as a JSON sequence, as handed to REFLECT
    pub fn tail_value(&self, n: usize) -> Value {
        serde_json::to_value(self.tail(n)).unwrap_or(Value::Null)
    }

    /// Human-readable listing
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let line = match &entry.event {
                TraceEvent::Exec { opcode, detail, outcome } => {
                    format!("{:<12} {} {}", opcode, detail, outcome)
                }
                TraceEvent::Log { level, message } => format!("LOG[{:?}] {}", level, message),
                TraceEvent::Created { parent } => match parent {
                    Some(parent) => format!("created by {}", parent),
                    None => "submitted".to_string(),
                },
                TraceEvent::Transition { from, to, reason } => {
                    format!("{} -> {} ({})", from.as_str(), to.as_str(), reason)
                }
                TraceEvent::External { call, success } => {
                    format!("<- {} {}", call, if *success { "ok" } else { "failed" })
                }
            };
            out.push_str(&format!(
                "{:>5} {:<10} {}@{:<3} {}\n",
                entry.seq,
                entry.task.as_str(),
                entry.program,
                entry.pc,
                line.trim_end()
            ));
        }
        out
    }
}
