//! # VM configuration
//!
//! Limits and timeouts for one run. Every field has a default, so a config
//! file only needs the values it changes.

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default page-count limit of the working set
pub const DEFAULT_MAX_PAGES: usize = 1024;

/// Default aggregate size budget (approximate tokens)
pub const DEFAULT_MEMORY_BUDGET: usize = 128_000;

/// Default per-task operand stack depth
pub const DEFAULT_MAX_STACK: usize = 256;

/// Configuration for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum resident pages
    pub max_pages: usize,
    /// Maximum total `size_estimate` of resident pages
    pub memory_budget: usize,
    /// Operand stack depth per task
    pub max_stack: usize,
    /// Frames per task (CALL and LOOP)
    pub max_call_depth: usize,
    /// Opcodes a single task may execute
    pub max_steps: usize,
    /// Opcodes run per dispatch before the task is requeued
    pub time_slice: usize,
    /// Per external call, `None` disables the limit
    pub call_timeout_ms: Option<u64>,
    /// Trace entries attached by REFLECT when `include_trace` is set
    pub trace_tail: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            max_stack: DEFAULT_MAX_STACK,
            max_call_depth: 64,
            max_steps: 10_000,
            time_slice: 64,
            call_timeout_ms: Some(120_000),
            trace_tail: 50,
        }
    }
}

impl VmConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            error::config_invalid(format!("cannot read {}: {}", path.display(), e))
                .set_source(e)
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            error::config_invalid(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make every program fail
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_pages", self.max_pages),
            ("memory_budget", self.memory_budget),
            ("max_stack", self.max_stack),
            ("max_call_depth", self.max_call_depth),
            ("max_steps", self.max_steps),
            ("time_slice", self.time_slice),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(error::config_invalid(format!("{} must be positive", name))
                    .with_context("field", name));
            }
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_memory_budget(mut self, budget: usize) -> Self {
        self.memory_budget = budget;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps;
        self
    }

    pub fn with_time_slice(mut self, slice: usize) -> Self {
        self.time_slice = slice;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout_ms = timeout.map(|d| d.as_millis() as u64);
        self
    }
}
