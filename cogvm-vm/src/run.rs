//! # Run state
//!
//! Everything one execution shares: page memory and its durable store,
//! registers, the trace, the task table, the callable program library,
//! checkpoints and page reservations. Handlers receive it by reference,
//! so concurrent runs stay independent.

use crate::config::VmConfig;
use crate::error::{self, Result};
use crate::memory::{Memory, Page};
use crate::opcode::{Program, Register};
use crate::program::CodeBlock;
use crate::storage::Storage;
use crate::task::{Task, TaskError, TaskId, TaskState};
use crate::trace::{Origin, Trace, TraceEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Run-wide registers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registers {
    pub goal: Value,
    pub focus: Value,
    pub thought: Value,
    pub flags: Value,
}

impl Registers {
    pub fn get(&self, reg: Register) -> &Value {
        match reg {
            Register::Goal => &self.goal,
            Register::Focus => &self.focus,
            Register::Thought => &self.thought,
            Register::Flags => &self.flags,
        }
    }

    pub fn set(&mut self, reg: Register, value: Value) {
        match reg {
            Register::Goal => self.goal = value,
            Register::Focus => self.focus = value,
            Register::Thought => self.thought = value,
            Register::Flags => self.flags = value,
        }
    }

    /// Register by name, for path roots
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        Register::from_name(name).map(|reg| self.get(reg))
    }

    pub fn to_value(&self) -> Value {
        json!({
            "goal": self.goal,
            "focus": self.focus,
            "thought": self.thought,
            "flags": self.flags,
        })
    }
}

/// Snapshot taken by CHECKPOINT
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub name: String,
    memory: Memory,
    registers: Registers,
    /// Live tasks when the snapshot was taken
    pub task_states: BTreeMap<TaskId, TaskState>,
}

/// Single-writer reservations per page id.
///
/// A task with an external call in flight reserves the pages the call will
/// write; other tasks touching those pages wait until the write lands.
#[derive(Debug, Clone, Default)]
pub struct PageLocks {
    writers: HashMap<String, TaskId>,
}

impl PageLocks {
    /// Reserve `page` for `owner`. Fails if another task holds it.
    pub fn acquire(&mut self, page: &str, owner: &TaskId) -> bool {
        match self.writers.get(page) {
            Some(holder) => holder == owner,
            None => {
                self.writers.insert(page.to_string(), owner.clone());
                true
            }
        }
    }

    pub fn release(&mut self, page: &str, owner: &TaskId) {
        if self.writers.get(page) == Some(owner) {
            self.writers.remove(page);
        }
    }

    pub fn release_all(&mut self, owner: &TaskId) {
        self.writers.retain(|_, holder| holder != owner);
    }

    pub fn owner(&self, page: &str) -> Option<&TaskId> {
        self.writers.get(page)
    }

    /// First page in `pages` reserved by someone other than `task`
    pub fn conflict<'p>(&self, pages: &'p [String], task: &TaskId) -> Option<&'p str> {
        pages
            .iter()
            .find(|page| self.owner(page).is_some_and(|holder| holder != task))
            .map(String::as_str)
    }

    pub fn pages(&self) -> impl Iterator<Item = &str> {
        self.writers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

pub struct Run {
    pub config: VmConfig,
    memory: Memory,
    storage: Storage,
    pub registers: Registers,
    pub trace: Trace,
    pub(crate) tasks: HashMap<TaskId, Task>,
    programs: HashMap<String, CodeBlock>,
    checkpoints: HashMap<String, Checkpoint>,
    pub(crate) locks: PageLocks,
    spawned: Vec<TaskId>,
    abandoned: Vec<TaskId>,
    next_task: u64,
}

impl Run {
    pub fn new(config: VmConfig, storage: Storage) -> Self {
        Self {
            memory: Memory::new(config.max_pages, config.memory_budget),
            storage,
            registers: Registers::default(),
            trace: Trace::new(),
            tasks: HashMap::new(),
            programs: HashMap::new(),
            checkpoints: HashMap::new(),
            locks: PageLocks::default(),
            spawned: Vec::new(),
            abandoned: Vec::new(),
            next_task: 0,
            config,
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ========================================================================
    // Programs
    // ========================================================================

    /// Add a callable program to the library
    pub fn register_program(&mut self, program: &Program) -> Result<()> {
        program.validate()?;
        let block = CodeBlock::from_program(program)?;
        self.programs.insert(program.id.clone(), block);
        Ok(())
    }

    pub fn program(&self, id: &str) -> Result<&CodeBlock> {
        self.programs.get(id).ok_or_else(|| error::unknown_program(id))
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Pages eviction must leave alone: reservations, string bindings and
    /// pending JOIN targets of every live task
    pub fn pinned_pages(&self, current: Option<&Task>) -> HashSet<String> {
        let mut pinned: HashSet<String> = self.locks.pages().map(str::to_string).collect();
        for task in self.tasks.values().filter(|t| !t.is_terminal()) {
            task.collect_page_refs(&mut pinned);
        }
        if let Some(task) = current {
            task.collect_page_refs(&mut pinned);
        }
        pinned
    }

    /// Page value from the working set, then the durable store
    pub fn lookup_page(&mut self, id: &str) -> Option<Value> {
        if let Some(value) = self.memory.get(id) {
            return Some(value.clone());
        }
        self.storage.get_page(id).map(|page| page.data)
    }

    pub fn read_page(&mut self, id: &str) -> Result<Value> {
        self.lookup_page(id).ok_or_else(|| error::page_not_found(id))
    }

    /// Write a page, spilling dirty evictions to the durable store
    pub fn write_page(&mut self, current: Option<&Task>, id: &str, value: Value) -> Result<()> {
        let pinned = self.pinned_pages(current);
        let evicted = self.memory.store(id, value, &pinned)?;
        self.spill(evicted)
    }

    /// Write several pages as one unit. If any of them cannot fit, the
    /// working set is restored and nothing reaches the durable store.
    pub fn write_pages(&mut self, current: Option<&Task>, pages: Vec<(String, Value)>) -> Result<()> {
        let mut pinned = self.pinned_pages(current);
        pinned.extend(pages.iter().map(|(id, _)| id.clone()));
        let before = self.memory.clone();

        let mut evicted = Vec::new();
        for (id, value) in pages {
            match self.memory.store(&id, value, &pinned) {
                Ok(out) => evicted.extend(out),
                Err(err) => {
                    self.memory = before;
                    return Err(err);
                }
            }
        }
        self.spill(evicted)
    }

    /// Bring a page back from the durable store into the working set
    pub fn reload_page(&mut self, current: Option<&Task>, id: &str) -> Result<Value> {
        if let Some(value) = self.memory.get(id) {
            return Ok(value.clone());
        }
        let page = self.storage.get_page(id).ok_or_else(|| error::page_not_found(id))?;
        let pinned = self.pinned_pages(current);
        let evicted = self.memory.insert_clean(id, page.data.clone(), page.label, &pinned)?;
        self.spill(evicted)?;
        Ok(page.data)
    }

    pub fn alloc_page(&mut self, current: Option<&Task>, label: Option<String>) -> Result<String> {
        let pinned = self.pinned_pages(current);
        let (id, evicted) = self.memory.alloc(label, &pinned)?;
        self.spill(evicted)?;
        Ok(id)
    }

    /// Drop a page from the working set and the durable store
    pub fn free_page(&mut self, id: &str) -> Result<()> {
        self.memory.remove(id);
        self.storage.remove_page(id)
    }

    fn spill(&mut self, evicted: Vec<Page>) -> Result<()> {
        for page in evicted {
            debug!(page = %page.id, dirty = page.dirty, size = page.size_estimate, "evicted page");
            if page.dirty {
                self.storage.put_page(&page)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    pub fn save_checkpoint(&mut self, name: &str, current: &Task) {
        let mut task_states: BTreeMap<TaskId, TaskState> = self
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| (t.id.clone(), t.state))
            .collect();
        task_states.insert(current.id.clone(), current.state);

        let checkpoint = Checkpoint {
            name: name.to_string(),
            memory: self.memory.clone(),
            registers: self.registers.clone(),
            task_states,
        };
        self.checkpoints.insert(name.to_string(), checkpoint);
    }

    /// Restore pages and registers; abandon live tasks created after the checkpoint
    pub fn rollback(&mut self, name: &str, current: &Task) -> Result<()> {
        let checkpoint = self
            .checkpoints
            .get(name)
            .ok_or_else(|| error::checkpoint_not_found(name))?;
        self.memory = checkpoint.memory.clone();
        self.registers = checkpoint.registers.clone();

        let newer: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| !t.is_terminal() && t.id != current.id)
            .filter(|t| !checkpoint.task_states.contains_key(&t.id))
            .map(|t| t.id.clone())
            .collect();
        for id in newer {
            self.abandon(&id, &format!("rolled back to checkpoint '{}'", name));
        }
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Create a READY task. Explicit ids must not name a live task.
    pub fn spawn_task(
        &mut self,
        code: CodeBlock,
        args: Value,
        parent: Option<TaskId>,
        explicit_id: Option<String>,
    ) -> Result<TaskId> {
        let id = match explicit_id {
            Some(id) => {
                let id = TaskId::from(id);
                let live = self.tasks.get(&id).is_some_and(|t| !t.is_terminal());
                if live || parent.as_ref() == Some(&id) {
                    return Err(error::malformed_opcode(
                        "SPAWN",
                        format!("task id '{}' is already live", id),
                    ));
                }
                id
            }
            None => loop {
                let id = TaskId::from(format!("task_{}", self.next_task));
                self.next_task += 1;
                if !self.tasks.contains_key(&id) && parent.as_ref() != Some(&id) {
                    break id;
                }
            },
        };

        let task = Task::new(id.clone(), code, parent.clone(), args, &self.config);
        let origin = Origin {
            task: &id,
            step: 0,
            program: task.code.program_id(),
            pc: task.pc,
        };
        self.trace.record(origin, TraceEvent::Created { parent });
        debug!(task = %id, program = task.code.program_id(), "task created");

        self.tasks.insert(id.clone(), task);
        self.spawned.push(id.clone());
        Ok(id)
    }

    /// Tasks created since the last call
    pub fn take_spawned(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.spawned)
    }

    /// Tasks abandoned since the last call
    pub fn take_abandoned(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.abandoned)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub(crate) fn take_task(&mut self, id: &TaskId) -> Option<Task> {
        self.tasks.remove(id)
    }

    pub(crate) fn put_task(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// Remove a collected task
    pub fn reap_task(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        self.locks.release_all(id);
        Some(task)
    }

    /// Stop scheduling a live task and fail it with `Abandoned`
    pub fn abandon(&mut self, id: &TaskId, reason: &str) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        warn!(task = %id, reason, "abandoning task");
        let err = error::abandoned(id.as_str(), reason);
        task.error = Some(TaskError::from_error(&err).at(task.code.program_id(), task.pc));
        task.join = None;
        task.blocked_on = None;
        task.pending_call = None;
        let from = task.state;
        task.state = TaskState::Failed;
        let origin = Origin {
            task: &task.id,
            step: task.steps,
            program: task.code.program_id(),
            pc: task.pc,
        };
        self.trace.record(
            origin,
            TraceEvent::Transition {
                from,
                to: TaskState::Failed,
                reason: reason.to_string(),
            },
        );
        self.locks.release_all(id);
        self.abandoned.push(id.clone());
    }

    /// Move a task to `to`, recording the transition
    pub fn transition(&mut self, task: &mut Task, to: TaskState, reason: &str) {
        if task.state == to {
            return;
        }
        debug_assert!(task.state.can_transition_to(to), "{} -> {}", task.state, to);
        debug!(task = %task.id, from = %task.state, to = %to, reason, "task transition");
        let origin = Origin {
            task: &task.id,
            step: task.steps,
            program: task.code.program_id(),
            pc: task.pc,
        };
        self.trace.record(
            origin,
            TraceEvent::Transition {
                from: task.state,
                to,
                reason: reason.to_string(),
            },
        );
        task.state = to;
    }

    /// Append a trace entry for `task`
    pub fn record(&mut self, task: &Task, pc: usize, event: TraceEvent) {
        let origin = Origin {
            task: &task.id,
            step: task.steps,
            program: task.code.program_id(),
            pc,
        };
        self.trace.record(origin, event);
    }
}
