//! # Scheduler
//!
//! Drives every task of a run to completion. Ready tasks are dispatched one at
//! a time for up to `time_slice` opcodes; a task that needs the compute or
//! tool unit parks in WAITING while its call joins the in-flight set, so other
//! tasks keep running. Landed calls write their pages, release the pages they
//! reserved and requeue the caller.
//!
//! ## Example
//!
//! ```ignore
//! let compute = ScriptedComputeUnit::new().respond("classify", json!("bug"));
//! let mut vm = Scheduler::new(VmConfig::default(), compute, LocalToolUnit::new());
//! vm.submit(&program)?;
//! let outcome = vm.run().await?;
//! ```

use crate::config::VmConfig;
use crate::error::{self, Error, ErrorKind, Result};
use crate::interpreter::{ExternalCall, Interpreter, Step, Suspension};
use crate::opcode::{parse_injection, Program, Register};
use crate::program::CodeBlock;
use crate::run::Run;
use crate::storage::Storage;
use crate::task::{BlockReason, Task, TaskError, TaskId, TaskState};
use crate::trace::{Trace, TraceEvent};
use crate::units::{ComputeUnit, ToolUnit};
use futures_util::future::{join_all, LocalBoxFuture};
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Final outcome of the top-level task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub task: TaskId,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Opcodes executed by the top-level task
    pub steps: usize,
}

impl RunOutcome {
    fn from_task(task: &Task) -> Self {
        Self {
            success: task.state == TaskState::Done,
            task: task.id.clone(),
            state: task.state,
            value: task.result.clone(),
            error: task.error.clone(),
            steps: task.steps,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"success": self.success}))
    }
}

/// Reply of an external call
enum Reply {
    Compute(Result<Value>),
    Batch(Vec<Result<Value>>),
    Tool(Value),
}

/// An external call that has finished
struct Landed {
    task: TaskId,
    /// Serial handed out at dispatch
    serial: u64,
    call: ExternalCall,
    reply: Reply,
}

/// Payload written in place of a compute or timed-out result
pub fn failure_payload(err: &Error) -> Value {
    json!({
        "success": false,
        "error": err.kind().as_str(),
        "message": err.message(),
        "retryable": err.is_retryable(),
    })
}

/// Tool replies must be mappings with a boolean `success`
fn normalize_tool_reply(reply: Value) -> Value {
    let well_formed = reply.get("success").is_some_and(Value::is_boolean);
    if well_formed {
        reply
    } else {
        json!({"success": false, "error": "malformed tool response", "response": reply})
    }
}

async fn with_timeout<F>(limit: Option<Duration>, call: F) -> Result<Value>
where
    F: Future<Output = Result<Value>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(error::timeout(limit))),
        None => call.await,
    }
}

fn perform<'u, C: ComputeUnit, T: ToolUnit>(
    compute: &'u C,
    tools: &'u T,
    timeout: Option<Duration>,
    task: TaskId,
    serial: u64,
    call: ExternalCall,
) -> LocalBoxFuture<'u, Landed> {
    async move {
        let reply = match &call {
            ExternalCall::Compute { request, .. } | ExternalCall::Inject { request, .. } => {
                Reply::Compute(with_timeout(timeout, compute.invoke(request.clone())).await)
            }
            ExternalCall::Batch { requests, .. } => {
                let calls = requests
                    .iter()
                    .map(|request| with_timeout(timeout, compute.invoke(request.clone())));
                Reply::Batch(join_all(calls).await)
            }
            ExternalCall::Tool { tool, args, timeout, .. } => {
                let invoked = async { Ok(tools.invoke(*tool, args.clone()).await) };
                match with_timeout(*timeout, invoked).await {
                    Ok(reply) => Reply::Tool(normalize_tool_reply(reply)),
                    Err(err) => Reply::Tool(failure_payload(&err)),
                }
            }
        };
        Landed {
            task,
            serial,
            call,
            reply,
        }
    }
    .boxed_local()
}

/// Run state the dispatch loop mutates while calls are in flight
struct Core {
    run: Run,
    ready: VecDeque<TaskId>,
    root: Option<TaskId>,
    /// Next external call serial
    next_call: u64,
}

impl Core {
    fn root_done(&self, root: &TaskId) -> bool {
        self.run.task(root).map_or(true, Task::is_terminal)
    }

    /// Queue newly spawned tasks and wake anything the last step unblocked
    fn settle(&mut self) {
        self.ready.extend(self.run.take_spawned());
        self.run.take_abandoned();
        self.wake_blocked();
    }

    /// Run one task for up to a time slice. Returns the external call it
    /// suspended on, if any, with its serial.
    fn dispatch(&mut self, id: &TaskId) -> Option<(u64, ExternalCall)> {
        let mut task = self.run.take_task(id)?;
        if task.state != TaskState::Ready {
            // Stale queue entry; the task was abandoned or already requeued
            self.run.put_task(task);
            return None;
        }
        self.run.transition(&mut task, TaskState::Running, "dispatched");

        let mut pending = None;
        for _ in 0..self.run.config.time_slice {
            let step = Interpreter::new(&mut task, &mut self.run).step();
            match step {
                Step::Continue => continue,
                Step::Yield => {
                    self.run.transition(&mut task, TaskState::Ready, "yield");
                    self.ready.push_back(task.id.clone());
                }
                Step::Suspend(Suspension::External(call)) => {
                    for page in call.reserved_pages() {
                        if !self.run.locks.acquire(&page, &task.id) {
                            debug!(task = %task.id, page = %page, "page already reserved");
                        }
                    }
                    let serial = self.next_call;
                    self.next_call += 1;
                    let describe = call.describe();
                    debug!(task = %task.id, call = %describe, serial, "external call dispatched");
                    task.pending_call = Some(serial);
                    self.run.transition(&mut task, TaskState::Waiting, &describe);
                    pending = Some((serial, call));
                }
                Step::Suspend(Suspension::Blocked(reason)) => {
                    let why = match &reason {
                        BlockReason::Join(ids) => format!("join on {} task(s)", ids.len()),
                        BlockReason::Page(page) => format!("page '{}' reserved", page),
                    };
                    task.blocked_on = Some(reason);
                    self.run.transition(&mut task, TaskState::Blocked, &why);
                }
                Step::Complete(value) => {
                    task.result = Some(value);
                    self.run.transition(&mut task, TaskState::Done, "complete");
                }
                Step::Fail(err) => {
                    let reason = err.to_string();
                    task.error = Some(err);
                    self.run.transition(&mut task, TaskState::Failed, &reason);
                }
            }
            break;
        }

        if task.state == TaskState::Running {
            self.run.transition(&mut task, TaskState::Ready, "time slice");
            self.ready.push_back(task.id.clone());
        }
        if task.is_terminal() {
            self.run.locks.release_all(&task.id);
        }
        self.run.put_task(task);
        pending
    }

    fn can_resume(&self, task: &Task) -> bool {
        match &task.blocked_on {
            Some(BlockReason::Join(ids)) => ids
                .iter()
                .all(|id| self.run.task(id).map_or(true, Task::is_terminal)),
            Some(BlockReason::Page(page)) => self
                .run
                .locks
                .owner(page)
                .map_or(true, |owner| *owner == task.id),
            None => true,
        }
    }

    fn wake_blocked(&mut self) {
        let mut woken: Vec<TaskId> = self
            .run
            .tasks()
            .filter(|t| t.state == TaskState::Blocked && self.can_resume(t))
            .map(|t| t.id.clone())
            .collect();
        woken.sort();

        for id in woken {
            let Some(mut task) = self.run.take_task(&id) else {
                continue;
            };
            task.blocked_on = None;
            self.run.transition(&mut task, TaskState::Ready, "unblocked");
            self.run.put_task(task);
            self.ready.push_back(id);
        }
    }

    /// Write a landed call's reply and requeue its task. Replies whose
    /// serial is not the one the task waits on belong to an abandoned
    /// task and are dropped untouched.
    fn land(&mut self, landed: Landed) {
        let Landed {
            task: id,
            serial,
            call,
            reply,
        } = landed;

        let Some(mut task) = self.run.take_task(&id) else {
            return;
        };
        if task.state != TaskState::Waiting || task.pending_call != Some(serial) {
            debug!(task = %id, call = %call.describe(), serial, "dropping stale reply");
            self.run.put_task(task);
            return;
        }
        task.pending_call = None;
        for page in call.reserved_pages() {
            self.run.locks.release(&page, &id);
        }

        let success = match &reply {
            Reply::Compute(result) => result.is_ok(),
            Reply::Batch(results) => results.iter().all(Result::is_ok),
            Reply::Tool(value) => value["success"] == json!(true),
        };
        let pc = task.pc.saturating_sub(1);
        self.run.record(
            &task,
            pc,
            TraceEvent::External {
                call: call.describe(),
                success,
            },
        );

        match self.apply(&mut task, call, reply) {
            Ok(()) => {
                self.run.transition(&mut task, TaskState::Ready, "call landed");
                self.ready.push_back(id);
            }
            Err(err) => {
                let err = TaskError::from_error(&err).at(task.code.program_id(), pc);
                let reason = err.to_string();
                task.error = Some(err);
                self.run.transition(&mut task, TaskState::Failed, &reason);
                self.run.locks.release_all(&task.id);
            }
        }
        self.run.put_task(task);
    }

    fn apply(&mut self, task: &mut Task, call: ExternalCall, reply: Reply) -> Result<()> {
        match (call, reply) {
            (ExternalCall::Compute { store_to, .. }, Reply::Compute(result)) => {
                let value = result.unwrap_or_else(|err| failure_payload(&err));
                self.run.write_page(Some(&*task), &store_to, value)
            }

            (ExternalCall::Inject { store_to, .. }, Reply::Compute(result)) => {
                let report = match result {
                    Ok(payload) => {
                        let ops = parse_injection(&payload)?;
                        let injected = ops.len();
                        task.code.splice(task.pc, ops)?;
                        debug!(task = %task.id, injected, at = task.pc, "opcodes injected");
                        json!({"success": true, "injected": injected})
                    }
                    Err(err) => failure_payload(&err),
                };
                match store_to {
                    Some(page) => self.run.write_page(Some(&*task), &page, report),
                    None => Ok(()),
                }
            }

            (
                ExternalCall::Batch {
                    store_prefix,
                    store_combined,
                    ..
                },
                Reply::Batch(results),
            ) => {
                let count = results.len();
                let mut pages = Vec::with_capacity(count + 1);
                let mut combined = Vec::with_capacity(count);
                let mut all_ok = true;
                for (index, result) in results.into_iter().enumerate() {
                    let (success, value) = match result {
                        Ok(value) => (true, value),
                        Err(err) => (false, failure_payload(&err)),
                    };
                    all_ok &= success;
                    combined.push(json!({"index": index, "success": success, "response": value.clone()}));
                    pages.push((format!("{}_{}", store_prefix, index), value));
                }
                if let Some(page) = store_combined {
                    let summary = json!({"results": combined, "count": count, "success": all_ok});
                    pages.push((page, summary));
                }
                self.run.write_pages(Some(&*task), pages)
            }

            (ExternalCall::Tool { store_to, .. }, Reply::Tool(value)) => match store_to {
                Some(page) => self.run.write_page(Some(&*task), &page, value),
                None => Ok(()),
            },

            (call, _) => Err(Error::unexpected(format!(
                "reply does not match call {}",
                call.describe()
            ))),
        }
    }

    /// Nothing ready and nothing in flight: fail every blocked task
    fn fail_deadlocked(&mut self) -> bool {
        let mut blocked: Vec<TaskId> = self
            .run
            .tasks()
            .filter(|t| t.state == TaskState::Blocked)
            .map(|t| t.id.clone())
            .collect();
        if blocked.is_empty() {
            return false;
        }
        blocked.sort();

        for id in blocked {
            let Some(mut task) = self.run.take_task(&id) else {
                continue;
            };
            warn!(task = %id, "deadlock");
            let err = error::deadlock(id.as_str());
            task.error = Some(TaskError::from_error(&err).at(task.code.program_id(), task.pc));
            task.blocked_on = None;
            task.join = None;
            self.run.transition(&mut task, TaskState::Failed, "deadlock");
            self.run.locks.release_all(&id);
            self.run.put_task(task);
        }
        true
    }

    /// Reclaim every task still live once the run is over
    fn reclaim(&mut self, reason: &str) {
        let mut live: Vec<TaskId> = self
            .run
            .tasks()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        live.sort();
        for id in live {
            self.run.abandon(&id, reason);
        }
        self.run.take_abandoned();
        self.run.take_spawned();
        self.ready.clear();
    }
}

/// Executes submitted programs against a compute unit and a tool unit
pub struct Scheduler<C: ComputeUnit, T: ToolUnit> {
    core: Core,
    compute: C,
    tools: T,
}

impl<C: ComputeUnit, T: ToolUnit> Scheduler<C, T> {
    pub fn new(config: VmConfig, compute: C, tools: T) -> Self {
        Self {
            core: Core {
                run: Run::new(config, Storage::default()),
                ready: VecDeque::new(),
                root: None,
                next_call: 0,
            },
            compute,
            tools,
        }
    }

    /// Use `storage` as the durable page store. Call before registering or
    /// submitting anything.
    pub fn with_storage(mut self, storage: Storage) -> Self {
        let config = self.core.run.config.clone();
        self.core.run = Run::new(config, storage);
        self
    }

    pub fn set_register(&mut self, reg: Register, value: Value) {
        self.core.run.registers.set(reg, value);
    }

    /// Add a program to the library reachable by CALL and SPAWN
    pub fn register(&mut self, program: &Program) -> Result<()> {
        self.core.run.register_program(program)
    }

    /// Submit the top-level program
    pub fn submit(&mut self, program: &Program) -> Result<TaskId> {
        self.submit_with_args(program, Value::Null)
    }

    /// Submit the top-level program with bindings from `args`
    pub fn submit_with_args(&mut self, program: &Program, args: Value) -> Result<TaskId> {
        if let Some(root) = &self.core.root {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("program already submitted as task '{}'", root),
            ));
        }
        program.validate()?;
        let code = CodeBlock::from_program(program)?;
        self.core.run.register_program(program)?;
        let id = self.core.run.spawn_task(code, args, None, None)?;
        info!(task = %id, program = %program.id, "program submitted");
        self.core.root = Some(id.clone());
        Ok(id)
    }

    /// Run until the top-level task is DONE or FAILED
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let root = self.core.root.clone().ok_or_else(|| {
            Error::new(ErrorKind::UnknownTask, "no program submitted").with_operation("Scheduler::run")
        })?;
        let Scheduler { core, compute, tools } = self;
        let (compute, tools) = (&*compute, &*tools);
        let call_timeout = core.run.config.call_timeout();
        let mut in_flight: FuturesUnordered<LocalBoxFuture<'_, Landed>> = FuturesUnordered::new();

        loop {
            core.settle();
            if core.root_done(&root) {
                break;
            }

            // Collect calls that already finished without waiting
            while let Some(Some(landed)) = in_flight.next().now_or_never() {
                core.land(landed);
                core.settle();
            }

            if let Some(id) = core.ready.pop_front() {
                if let Some((serial, call)) = core.dispatch(&id) {
                    in_flight.push(perform(compute, tools, call_timeout, id, serial, call));
                }
                continue;
            }

            if in_flight.is_empty() {
                if core.fail_deadlocked() {
                    continue;
                }
                break;
            }

            if let Some(landed) = in_flight.next().await {
                core.land(landed);
            }
        }

        let dropped = in_flight.len();
        drop(in_flight);
        if dropped > 0 {
            debug!(dropped, "dropping in-flight calls");
        }
        core.reclaim("run finished");

        let task = core
            .run
            .task(&root)
            .ok_or_else(|| error::unknown_task(root.as_str()))?;
        let outcome = RunOutcome::from_task(task);
        info!(
            task = %root,
            state = %outcome.state,
            steps = outcome.steps,
            trace = core.run.trace.len(),
            "run finished"
        );
        Ok(outcome)
    }

    /// Current value of a page, from memory or the durable store
    pub fn page(&mut self, id: &str) -> Option<Value> {
        self.core.run.lookup_page(id)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.core.run.task(id)
    }

    pub fn trace(&self) -> &Trace {
        &self.core.run.trace
    }

    /// Shared run state: memory, storage, registers and tasks
    pub fn state(&self) -> &Run {
        &self.core.run
    }

    pub fn compute(&self) -> &C {
        &self.compute
    }

    pub fn tools(&self) -> &T {
        &self.tools
    }
}
