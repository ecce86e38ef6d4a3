//! # Interpreter
//!
//! Fetch-decode-execute for one task. `step` runs the opcode at the task's
//! pc against the shared run state and reports what the scheduler should do
//! next. It never awaits: opcodes that need the compute or tool unit advance
//! the pc and hand back an `ExternalCall`, which the scheduler completes.
//!
//! ## Path expressions
//!
//! BRANCH and ASSERT conditions, LOOP `over`, and string leaves of COMPLETE,
//! RETURN, CALL/SPAWN args, SET_REG and tool parameters are path expressions
//! like `content.success` or `files.0.name`. The root resolves against, in
//! order: frame bindings up to the nearest CALL frame, task bindings, pages
//! (working set, then durable store), and registers. Every path root counts
//! as a page the opcode touches, so a page reserved by another task's
//! in-flight call blocks readers as well as writers.

use crate::error::{self, Error, Result};
use crate::frame::{Frame, FrameKind};
use crate::opcode::{LogLevel, Opcode};
use crate::program::CodeBlock;
use crate::run::Run;
use crate::task::{BlockReason, JoinWait, Task, TaskError, TaskId};
use crate::trace::{Origin, TraceEvent};
use crate::units::{ComputeKind, ComputeRequest, ToolKind};
use crate::value::{self, is_truthy, lookup, parse_path};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of executing one opcode
#[derive(Debug)]
pub enum Step {
    /// Keep running this task
    Continue,
    /// Requeue behind other ready tasks
    Yield,
    /// Park the task
    Suspend(Suspension),
    /// The task finished with a result
    Complete(Value),
    /// The task failed
    Fail(TaskError),
}

impl Step {
    fn label(&self) -> &'static str {
        match self {
            Step::Continue => "ok",
            Step::Yield => "yield",
            Step::Suspend(Suspension::External(_)) => "waiting",
            Step::Suspend(Suspension::Blocked(_)) => "blocked",
            Step::Complete(_) => "complete",
            Step::Fail(_) => "fail",
        }
    }
}

#[derive(Debug)]
pub enum Suspension {
    /// An external call must complete first
    External(ExternalCall),
    /// Another task must finish or release a page
    Blocked(BlockReason),
}

/// Work handed to the compute or tool unit
#[derive(Debug, Clone)]
pub enum ExternalCall {
    /// INFER, PLAN, REFLECT, SUMMARIZE
    Compute {
        request: ComputeRequest,
        store_to: String,
    },
    /// INJECT; the reply is spliced in at the task's pc
    Inject {
        request: ComputeRequest,
        store_to: Option<String>,
    },
    /// INFER_BATCH; every request runs concurrently
    Batch {
        requests: Vec<ComputeRequest>,
        store_prefix: String,
        store_combined: Option<String>,
    },
    Tool {
        tool: ToolKind,
        args: Map<String, Value>,
        store_to: Option<String>,
        timeout: Option<Duration>,
    },
}

impl ExternalCall {
    /// Pages the reply will be written to
    pub fn reserved_pages(&self) -> Vec<String> {
        match self {
            ExternalCall::Compute { store_to, .. } => vec![store_to.clone()],
            ExternalCall::Inject { store_to, .. } | ExternalCall::Tool { store_to, .. } => {
                store_to.iter().cloned().collect()
            }
            ExternalCall::Batch {
                requests,
                store_prefix,
                store_combined,
            } => (0..requests.len())
                .map(|i| format!("{}_{}", store_prefix, i))
                .chain(store_combined.iter().cloned())
                .collect(),
        }
    }

    /// Short description for traces and logs
    pub fn describe(&self) -> String {
        match self {
            ExternalCall::Compute { request, .. } | ExternalCall::Inject { request, .. } => {
                format!("{} \"{}\"", request.kind, value::truncate(&request.instruction, 30))
            }
            ExternalCall::Batch { requests, .. } => format!("batch of {}", requests.len()),
            ExternalCall::Tool { tool, .. } => tool.to_string(),
        }
    }
}

pub struct Interpreter<'a> {
    task: &'a mut Task,
    run: &'a mut Run,
}

impl<'a> Interpreter<'a> {
    pub fn new(task: &'a mut Task, run: &'a mut Run) -> Self {
        Self { task, run }
    }

    /// Execute the next opcode. Errors fail the task.
    pub fn step(&mut self) -> Step {
        let program = self.task.code.program_id().to_string();
        let pc = self.task.pc;
        match self.try_step() {
            Ok(step) => step,
            Err(err) => Step::Fail(TaskError::from_error(&err).at(program, pc)),
        }
    }

    fn try_step(&mut self) -> Result<Step> {
        let Some(op) = self.task.code.get(self.task.pc).cloned() else {
            return self.end_of_block();
        };

        let touched = op.touched_pages();
        if let Some(page) = self.run.locks.conflict(&touched, &self.task.id) {
            return Ok(Step::Suspend(Suspension::Blocked(BlockReason::Page(page.to_string()))));
        }

        self.task.steps += 1;
        if self.task.steps > self.run.config.max_steps {
            return Err(error::step_limit_exceeded(self.run.config.max_steps));
        }

        let program = self.task.code.program_id().to_string();
        let pc = self.task.pc;
        let result = self.execute(&op, &program, pc);

        if !matches!(op, Opcode::Log { .. }) {
            let outcome = match &result {
                Ok(step) => step.label().to_string(),
                Err(err) => format!("error: {}", err.kind()),
            };
            let origin = Origin {
                task: &self.task.id,
                step: self.task.steps,
                program: &program,
                pc,
            };
            let event = TraceEvent::Exec {
                opcode: op.name().to_string(),
                detail: op.summary(),
                outcome,
            };
            self.run.trace.record(origin, event);
        }
        result
    }

    fn execute(&mut self, op: &Opcode, program: &str, pc: usize) -> Result<Step> {
        match op {
            // =================================================================
            // MEMORY
            // =================================================================
            Opcode::Load { page_id, range, store_to } => {
                let mut data = self.run.read_page(page_id)?;
                if let Some(range) = range {
                    data = value::slice(&data, range);
                }
                self.store_or_push(store_to.as_deref(), data)?;
                self.advance()
            }

            Opcode::LoadPage { page_id, store_to } => {
                let data = self.run.reload_page(Some(&*self.task), page_id)?;
                if let Some(target) = store_to {
                    self.write(target, data)?;
                }
                self.advance()
            }

            Opcode::Store { page_id, data } => {
                self.write(page_id, data.clone())?;
                self.advance()
            }

            Opcode::Alloc { label, store_to, .. } => {
                let id = self.run.alloc_page(Some(&*self.task), label.clone())?;
                self.store_or_push(store_to.as_deref(), Value::String(id))?;
                self.advance()
            }

            Opcode::Free { page_id } => {
                self.run.free_page(page_id)?;
                self.advance()
            }

            Opcode::Copy { src, dst, range } => {
                let mut data = self.run.read_page(src)?;
                if let Some(range) = range {
                    data = value::slice(&data, range);
                }
                self.write(dst, data)?;
                self.advance()
            }

            // =================================================================
            // THINKING
            // =================================================================
            Opcode::Infer { prompt, context, store_to, params } => {
                let request = self
                    .compute_request(ComputeKind::Infer, prompt, context, false)
                    .with_parameters(params.to_map());
                self.external(ExternalCall::Compute {
                    request,
                    store_to: store_to.clone(),
                })
            }

            Opcode::Plan { goal, context, store_to } => {
                let request = self.compute_request(ComputeKind::Plan, goal, context, false);
                self.external(ExternalCall::Compute {
                    request,
                    store_to: store_to.clone(),
                })
            }

            Opcode::Reflect { question, context, include_trace, store_to } => {
                let request = self.compute_request(ComputeKind::Reflect, question, context, *include_trace);
                self.external(ExternalCall::Compute {
                    request,
                    store_to: store_to.clone(),
                })
            }

            Opcode::Inject { goal, context, include_trace, store_to } => {
                let request = self.compute_request(ComputeKind::Inject, goal, context, *include_trace);
                self.external(ExternalCall::Inject {
                    request,
                    store_to: store_to.clone(),
                })
            }

            Opcode::InferBatch { prompts, context, store_prefix, store_combined } => {
                let requests = prompts
                    .iter()
                    .map(|prompt| self.compute_request(ComputeKind::Infer, prompt, context, false))
                    .collect();
                self.external(ExternalCall::Batch {
                    requests,
                    store_prefix: store_prefix.clone(),
                    store_combined: store_combined.clone(),
                })
            }

            // =================================================================
            // CONTEXT MANAGEMENT
            // =================================================================
            Opcode::Summarize { pages, target_tokens, store_to } => {
                let mut parameters = Map::new();
                if let Some(target) = target_tokens {
                    parameters.insert("target_tokens".to_string(), json!(target));
                }
                let request = self
                    .compute_request(ComputeKind::Summarize, "summarize", pages, false)
                    .with_parameters(parameters);
                self.external(ExternalCall::Compute {
                    request,
                    store_to: store_to.clone(),
                })
            }

            Opcode::Chunk { source, chunk_size, prefix, store_to } => {
                let data = self.run.read_page(source)?;
                let prefix = prefix.as_deref().unwrap_or(source);
                let mut pages: Vec<(String, Value)> = value::chunk(&data, *chunk_size)
                    .into_iter()
                    .enumerate()
                    .map(|(i, part)| (format!("{}_{}", prefix, i), part))
                    .collect();
                if let Some(target) = store_to {
                    let ids: Vec<&String> = pages.iter().map(|(id, _)| id).collect();
                    let manifest = json!({"chunks": ids, "count": ids.len()});
                    pages.push((target.clone(), manifest));
                }
                self.run.write_pages(Some(&*self.task), pages)?;
                self.advance()
            }

            Opcode::Merge { pages, store_to, separator } => {
                let values = pages
                    .iter()
                    .map(|page| self.run.read_page(page))
                    .collect::<Result<Vec<_>>>()?;
                self.write(store_to, value::merge(values, separator.as_deref()))?;
                self.advance()
            }

            // =================================================================
            // CONTROL FLOW
            // =================================================================
            Opcode::Label { .. } | Opcode::Nop => self.advance(),

            Opcode::Jump { target } => self.jump(target),

            Opcode::Branch { condition, if_true, if_false } => {
                if self.eval_condition(condition) {
                    self.jump(if_true)
                } else {
                    self.jump(if_false)
                }
            }

            Opcode::Call { program_id, args, store_to } => {
                let callee = self.run.program(program_id)?.clone();
                self.task.frames.ensure_room()?;
                let args = self.resolve_value(args);
                let store_to = store_to.clone().unwrap_or_else(|| format!("{}_result", program_id));

                let entry = callee.entry();
                let caller = std::mem::replace(&mut self.task.code, callee);
                self.task.frames.push(Frame::call(caller, pc + 1, args, store_to))?;
                self.task.pc = entry;
                Ok(Step::Continue)
            }

            Opcode::Return { value } => {
                let value = self.resolve_value(value);
                self.unwind_return(value)
            }

            Opcode::Loop { var, over, body } => {
                let items = match self.eval_path(over) {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => {
                        return Err(error::malformed_opcode(
                            "LOOP",
                            format!("'{}' is a {}, not a sequence", over, value::type_name(&other)),
                        ))
                    }
                };
                if items.is_empty() {
                    return self.advance();
                }

                self.task.frames.ensure_room()?;
                let body = CodeBlock::new(format!("{}/loop@{}", program, pc), body.clone())?;
                let entry = body.entry();
                let caller = std::mem::replace(&mut self.task.code, body);
                let frame = Frame::iteration(caller, pc + 1, var.clone(), items, 0)
                    .ok_or_else(|| Error::unexpected("empty loop snapshot"))?;
                self.task.frames.push(frame)?;
                self.task.pc = entry;
                Ok(Step::Continue)
            }

            Opcode::Complete { result } => Ok(Step::Complete(self.resolve_value(result))),

            Opcode::Fail { error } => Ok(Step::Fail(TaskError::fail(error.clone()).at(program, pc))),

            Opcode::Yield => {
                self.task.pc += 1;
                Ok(Step::Yield)
            }

            // =================================================================
            // STACK
            // =================================================================
            Opcode::Push { value } => {
                self.task.stack.push(value.clone())?;
                self.advance()
            }

            Opcode::PushPage { page_id } => {
                let data = self.run.read_page(page_id)?;
                self.task.stack.push(data)?;
                self.advance()
            }

            Opcode::Pop => {
                self.task.stack.pop()?;
                self.advance()
            }

            Opcode::PopTo { store_to } => {
                let top = self.task.stack.pop()?;
                self.write(store_to, top)?;
                self.advance()
            }

            Opcode::Dup => {
                self.task.stack.dup()?;
                self.advance()
            }

            Opcode::Swap => {
                self.task.stack.swap()?;
                self.advance()
            }

            Opcode::Peek { store_to } => {
                let top = self.task.stack.peek()?.clone();
                self.write(store_to, top)?;
                self.advance()
            }

            Opcode::PeekAt { depth, store_to } => {
                let value = self.task.stack.peek_at(*depth)?.clone();
                self.write(store_to, value)?;
                self.advance()
            }

            Opcode::DupN { n } => {
                self.task.stack.dup_n(*n)?;
                self.advance()
            }

            Opcode::SwapN { n } => {
                self.task.stack.swap_n(*n)?;
                self.advance()
            }

            Opcode::Rot { n } => {
                self.task.stack.rot(*n)?;
                self.advance()
            }

            Opcode::Drop { n } => {
                self.task.stack.drop_n(*n)?;
                self.advance()
            }

            Opcode::Depth { store_to } => {
                let depth = self.task.stack.len();
                self.write(store_to, json!(depth))?;
                self.advance()
            }

            Opcode::Clear => {
                self.task.stack.clear();
                self.advance()
            }

            // =================================================================
            // REGISTERS
            // =================================================================
            Opcode::SetReg { reg, value } => {
                let value = self.resolve_value(value);
                self.run.registers.set(*reg, value);
                self.advance()
            }

            Opcode::GetReg { reg, store_to } => {
                let value = self.run.registers.get(*reg).clone();
                self.write(store_to, value)?;
                self.advance()
            }

            // =================================================================
            // TOOLS
            // =================================================================
            Opcode::ReadFile { path, store_to } => {
                let args = self.tool_args(&[("path", path)]);
                self.tool(ToolKind::ReadFile, args, Some(store_to.clone()), None)
            }

            Opcode::WriteFile { path, content, store_to } => {
                let args = self.tool_args(&[("path", path), ("content", content)]);
                self.tool(ToolKind::WriteFile, args, store_to.clone(), None)
            }

            Opcode::ListDir { path, store_to } => {
                let args = self.tool_args(&[("path", path)]);
                self.tool(ToolKind::ListDir, args, Some(store_to.clone()), None)
            }

            Opcode::Exec { command, store_to, timeout_ms } => {
                let args = self.tool_args(&[("command", command)]);
                let timeout = timeout_ms.map(Duration::from_millis);
                self.tool(ToolKind::Exec, args, Some(store_to.clone()), timeout)
            }

            Opcode::Grep { pattern, path, store_to } => {
                let args = self.tool_args(&[("pattern", pattern), ("path", path)]);
                self.tool(ToolKind::Grep, args, Some(store_to.clone()), None)
            }

            // =================================================================
            // DEBUG
            // =================================================================
            Opcode::Log { level, message } => {
                let id = &self.task.id;
                match level {
                    LogLevel::Debug => debug!(task = %id, "{}", message),
                    LogLevel::Info => info!(task = %id, "{}", message),
                    LogLevel::Warn => warn!(task = %id, "{}", message),
                    LogLevel::Error => tracing::error!(task = %id, "{}", message),
                }
                let origin = Origin {
                    task: &self.task.id,
                    step: self.task.steps,
                    program,
                    pc,
                };
                let event = TraceEvent::Log {
                    level: *level,
                    message: message.clone(),
                };
                self.run.trace.record(origin, event);
                self.advance()
            }

            Opcode::Checkpoint { name } => {
                self.run.save_checkpoint(name, &*self.task);
                self.advance()
            }

            Opcode::Rollback { name } => {
                self.run.rollback(name, &*self.task)?;
                self.advance()
            }

            Opcode::Assert { condition, message } => {
                if !self.eval_condition(condition) {
                    let message = if message.is_empty() {
                        format!("assertion failed: {}", condition)
                    } else {
                        message.clone()
                    };
                    return Err(error::assertion_failed(message).with_context("condition", condition.clone()));
                }
                self.advance()
            }

            // =================================================================
            // PARALLEL
            // =================================================================
            Opcode::Spawn { opcode, program_id, args, id, store_to } => {
                let code = match (opcode, program_id) {
                    (Some(op), _) => CodeBlock::single(format!("{}/spawn@{}", program, pc), (**op).clone())?,
                    (None, Some(program_id)) => self.run.program(program_id)?.clone(),
                    (None, None) => {
                        return Err(error::malformed_opcode("SPAWN", "nothing to run"));
                    }
                };
                let args = self.resolve_value(args);
                let parent = Some(self.task.id.clone());
                let child = self.run.spawn_task(code, args, parent, id.clone())?;
                self.store_or_push(store_to.as_deref(), Value::String(child.to_string()))?;
                self.advance()
            }

            Opcode::Join { tasks, store_to } => {
                if self.task.join.is_none() {
                    let entries = self.join_entries(tasks)?;
                    self.task.join = Some(JoinWait {
                        entries,
                        store_to: store_to.clone(),
                    });
                }
                self.finish_join()
            }

            Opcode::Parallel { branches, store_to } => {
                if self.task.join.is_none() {
                    let mut entries = Vec::with_capacity(branches.len());
                    for (i, branch) in branches.iter().enumerate() {
                        let key = branch.key(i);
                        let code = CodeBlock::new(format!("{}/{}", program, key), branch.code.clone())?;
                        let parent = Some(self.task.id.clone());
                        let child = self.run.spawn_task(code, Value::Null, parent, None)?;
                        entries.push((key, child));
                    }
                    self.task.join = Some(JoinWait {
                        entries,
                        store_to: store_to.clone(),
                    });
                }
                self.finish_join()
            }
        }
    }

    // =========================================================================
    // Control helpers
    // =========================================================================

    fn advance(&mut self) -> Result<Step> {
        self.task.pc += 1;
        Ok(Step::Continue)
    }

    fn jump(&mut self, label: &str) -> Result<Step> {
        self.task.pc = self.task.code.label(label)?;
        Ok(Step::Continue)
    }

    /// Ran past the last opcode of the current block
    fn end_of_block(&mut self) -> Result<Step> {
        let Some(frame) = self.task.frames.pop() else {
            return Ok(Step::Complete(Value::Null));
        };

        match frame.kind {
            FrameKind::Loop { var, items, index } if index + 1 < items.len() => {
                let entry = self.task.code.entry();
                let next = Frame::iteration(frame.caller_code, frame.return_pc, var, items, index + 1)
                    .ok_or_else(|| Error::unexpected("loop snapshot exhausted"))?;
                self.task.frames.push(next)?;
                self.task.pc = entry;
            }
            FrameKind::Loop { .. } => {
                self.task.code = frame.caller_code;
                self.task.pc = frame.return_pc;
            }
            FrameKind::Call { store_to } => {
                self.task.code = frame.caller_code;
                self.task.pc = frame.return_pc;
                self.write(&store_to, Value::Null)?;
            }
        }
        Ok(Step::Continue)
    }

    /// Pop loop frames up to the nearest CALL frame and hand `value` back
    fn unwind_return(&mut self, value: Value) -> Result<Step> {
        while let Some(frame) = self.task.frames.pop() {
            self.task.code = frame.caller_code;
            if let FrameKind::Call { store_to } = frame.kind {
                self.task.pc = frame.return_pc;
                self.write(&store_to, value)?;
                return Ok(Step::Continue);
            }
        }
        Ok(Step::Complete(value))
    }

    // =========================================================================
    // Pages and values
    // =========================================================================

    fn write(&mut self, page: &str, value: Value) -> Result<()> {
        self.run.write_page(Some(&*self.task), page, value)
    }

    fn store_or_push(&mut self, store_to: Option<&str>, value: Value) -> Result<()> {
        match store_to {
            Some(page) => self.write(page, value),
            None => self.task.stack.push(value),
        }
    }

    /// Value of a path root, or `None` if nothing by that name exists
    fn resolve_root(&mut self, root: &str) -> Option<Value> {
        let hidden = match self.task.frames.binding(root) {
            Ok(Some(value)) => return Some(value.clone()),
            Ok(None) => false,
            Err(()) => true,
        };
        if !hidden {
            if let Some(value) = self.task.bindings.get(root) {
                return Some(value.clone());
            }
        }
        if let Some(value) = self.run.lookup_page(root) {
            return Some(value);
        }
        self.run.registers.get_named(root).cloned()
    }

    fn try_path(&mut self, expr: &str) -> Option<Value> {
        let (root, segments) = parse_path(expr)?;
        let base = self.resolve_root(root)?;
        lookup(&base, &segments).cloned()
    }

    /// Evaluate a path; unresolvable paths are null
    fn eval_path(&mut self, expr: &str) -> Value {
        self.try_path(expr).unwrap_or(Value::Null)
    }

    /// Truthiness of a path, negated by a leading `!`
    fn eval_condition(&mut self, condition: &str) -> bool {
        let condition = condition.trim();
        match condition.strip_prefix('!') {
            Some(inner) => !is_truthy(&self.eval_path(inner)),
            None => is_truthy(&self.eval_path(condition)),
        }
    }

    /// Replace string leaves that name resolvable paths
    fn resolve_value(&mut self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.try_path(s).unwrap_or_else(|| value.clone()),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_text(&mut self, text: &str) -> String {
        match self.try_path(text) {
            Some(Value::String(s)) => s,
            Some(other) => value::render_text(&other),
            None => text.to_string(),
        }
    }

    // =========================================================================
    // External calls
    // =========================================================================

    fn compute_request(
        &mut self,
        kind: ComputeKind,
        instruction: &str,
        pages: &[String],
        include_trace: bool,
    ) -> ComputeRequest {
        // Missing context pages keep their slot as null
        let mut context: Vec<Value> = pages
            .iter()
            .map(|page| self.run.lookup_page(page).unwrap_or(Value::Null))
            .collect();
        if include_trace {
            context.push(self.run.trace.tail_value(self.run.config.trace_tail));
        }
        ComputeRequest::new(kind, instruction, context).with_registers(self.run.registers.to_value())
    }

    fn tool_args(&mut self, params: &[(&str, &String)]) -> Map<String, Value> {
        params
            .iter()
            .map(|(key, raw)| (key.to_string(), Value::String(self.resolve_text(raw))))
            .collect()
    }

    fn tool(
        &mut self,
        tool: ToolKind,
        args: Map<String, Value>,
        store_to: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Step> {
        let timeout = timeout.or_else(|| self.run.config.call_timeout());
        self.external(ExternalCall::Tool {
            tool,
            args,
            store_to,
            timeout,
        })
    }

    fn external(&mut self, call: ExternalCall) -> Result<Step> {
        self.task.pc += 1;
        Ok(Step::Suspend(Suspension::External(call)))
    }

    // =========================================================================
    // JOIN
    // =========================================================================

    /// Resolve JOIN names to live tasks: a task id, or a path holding one or
    /// a sequence of them
    fn join_entries(&mut self, names: &[String]) -> Result<Vec<(String, TaskId)>> {
        let mut entries = Vec::new();
        for name in names {
            let direct = TaskId::from(name.as_str());
            if self.run.task(&direct).is_some() {
                entries.push((name.clone(), direct));
                continue;
            }

            let ids: Vec<String> = match self.try_path(name) {
                Some(Value::String(id)) => vec![id],
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            if ids.is_empty() {
                return Err(error::unknown_task(name.clone()));
            }
            for id in ids.into_iter().map(TaskId::from) {
                if self.run.task(&id).is_none() {
                    return Err(error::unknown_task(id.as_str()));
                }
                entries.push((id.to_string(), id));
            }
        }
        Ok(entries)
    }

    /// Block until every joined task is terminal, then collect and reap them
    fn finish_join(&mut self) -> Result<Step> {
        let Some(join) = &self.task.join else {
            return self.advance();
        };
        let pending: Vec<TaskId> = join
            .entries
            .iter()
            .filter(|(_, id)| self.run.task(id).is_some_and(|t| !t.is_terminal()))
            .map(|(_, id)| id.clone())
            .collect();
        if !pending.is_empty() {
            return Ok(Step::Suspend(Suspension::Blocked(BlockReason::Join(pending))));
        }

        let mut results = Map::new();
        for (key, id) in &join.entries {
            let outcome = match self.run.task(id) {
                Some(task) => task.outcome(),
                None => json!({
                    "success": false,
                    "error": {"kind": "UnknownTask", "message": format!("task '{}' was already collected", id)},
                }),
            };
            results.insert(key.clone(), outcome);
        }
        let ids = join.task_ids();
        let store_to = join.store_to.clone();

        self.write(&store_to, Value::Object(results))?;
        self.task.join = None;
        for id in &ids {
            self.run.reap_task(id);
        }
        self.advance()
    }
}
