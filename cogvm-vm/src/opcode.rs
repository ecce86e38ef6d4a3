//! # Opcodes
//!
//! The instruction set of the VM. Programs are sequences of opcodes that
//! move structured values between pages and the operand stack, and hand
//! opaque work to the compute unit and the tool unit.
//!
//! Opcodes serialize as records tagged by `"op"`:
//!
//! ```json
//! {"op": "READ_FILE", "path": "a.txt", "store_to": "content"}
//! ```

use crate::error::{self, Result};
use crate::value;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// VM opcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // =========================================================================
    // MEMORY
    // =========================================================================

    /// Read a page. Pushes the value unless `store_to` is given.
    Load {
        /// Page to read
        page_id: String,
        /// Restrict to a sub-slice of a sequence or string
        #[serde(default)]
        range: Option<Range>,
        /// Destination page instead of the stack
        #[serde(default)]
        store_to: Option<String>,
    },

    /// Bring a page back from the durable store into the working set
    LoadPage {
        /// Page to reload
        page_id: String,
        /// Also copy the reloaded value here
        #[serde(default)]
        store_to: Option<String>,
    },

    /// Write a value to a page, creating it if needed
    Store {
        /// Page to write
        page_id: String,
        /// Value to store, taken literally
        data: Value,
    },

    /// Allocate a fresh empty page
    Alloc {
        /// Optional label for the page
        #[serde(default)]
        label: Option<String>,
        /// Expected size in tokens (advisory)
        #[serde(default)]
        size_hint: Option<usize>,
        /// Page receiving the new id; pushed when absent
        #[serde(default)]
        store_to: Option<String>,
    },

    /// Release a page. Missing pages are fine.
    Free {
        /// Page to release
        page_id: String,
    },

    /// Copy a page, optionally a sub-slice of it
    Copy {
        /// Source page
        src: String,
        /// Destination page
        dst: String,
        /// Optional range to copy
        #[serde(default)]
        range: Option<Range>,
    },

    // =========================================================================
    // THINKING - calls to the compute unit
    // =========================================================================

    /// Run inference with the given prompt and context pages
    Infer {
        /// Instruction for the compute unit
        prompt: String,
        /// Pages passed as context, in order
        #[serde(default)]
        context: Vec<String>,
        /// Page receiving the result
        store_to: String,
        /// Inference parameters
        #[serde(default)]
        params: InferParams,
    },

    /// Ask for a plan toward a goal
    Plan {
        /// What the plan should achieve
        goal: String,
        /// Pages passed as context
        #[serde(default)]
        context: Vec<String>,
        /// Page receiving the plan
        store_to: String,
    },

    /// Ask the compute unit to reflect, optionally over the recent trace
    Reflect {
        /// Question to reflect on
        question: String,
        /// Pages passed as context
        #[serde(default)]
        context: Vec<String>,
        /// Append the trace tail to the context
        #[serde(default)]
        include_trace: bool,
        /// Page receiving the reflection
        store_to: String,
    },

    /// Ask for opcodes and splice them in after this instruction
    Inject {
        /// What the generated code should do
        goal: String,
        /// Pages passed as context
        #[serde(default)]
        context: Vec<String>,
        /// Append the trace tail to the context
        #[serde(default)]
        include_trace: bool,
        /// Page receiving `{success, injected}` or the failure payload
        #[serde(default)]
        store_to: Option<String>,
    },

    /// Issue independent inference calls concurrently
    InferBatch {
        /// One call per prompt
        prompts: Vec<String>,
        /// Pages passed as context to every call
        #[serde(default)]
        context: Vec<String>,
        /// Results land in `{store_prefix}_{i}`
        store_prefix: String,
        /// Optional page receiving `{results, count, success}`
        #[serde(default)]
        store_combined: Option<String>,
    },

    // =========================================================================
    // CONTEXT MANAGEMENT
    // =========================================================================

    /// Condense pages through the compute unit
    Summarize {
        /// Pages to summarize
        pages: Vec<String>,
        /// Size to aim for (not guaranteed)
        #[serde(default)]
        target_tokens: Option<usize>,
        /// Page receiving the summary
        store_to: String,
    },

    /// Split a page into `prefix_0`, `prefix_1`, ...
    Chunk {
        /// Page to split
        source: String,
        /// Approximate tokens per chunk
        chunk_size: usize,
        /// Chunk page prefix, defaults to the source id
        #[serde(default)]
        prefix: Option<String>,
        /// Optional page receiving `{chunks, count}`
        #[serde(default)]
        store_to: Option<String>,
    },

    /// Concatenate pages in order
    Merge {
        /// Pages to merge
        pages: Vec<String>,
        /// Page receiving the merged value
        store_to: String,
        /// Placed between pages
        #[serde(default)]
        separator: Option<String>,
    },

    // =========================================================================
    // CONTROL FLOW
    // =========================================================================

    /// Jump target
    Label {
        /// Label name, unique within its block
        name: String,
    },

    /// Unconditional jump to a label
    Jump {
        /// Label to jump to
        target: String,
    },

    /// Conditional jump on a path expression
    Branch {
        /// Path like `content.success`, optionally prefixed with `!`
        condition: String,
        /// Target if truthy
        if_true: String,
        /// Target if falsy
        if_false: String,
    },

    /// Enter a registered program at its entry
    Call {
        /// Program to call
        program_id: String,
        /// Bound as `args`, and key by key when a mapping
        #[serde(default)]
        args: Value,
        /// Page receiving the RETURN value, default `{program_id}_result`
        #[serde(default)]
        store_to: Option<String>,
    },

    /// Leave the current call; ends the task when no call is active
    Return {
        /// Value handed back to the caller
        #[serde(default)]
        value: Value,
    },

    /// Run `body` once per element of a snapshot of `over`
    Loop {
        /// Binding name for the current element
        var: String,
        /// Path to the sequence to iterate
        over: String,
        /// Inline block, its own label scope
        #[serde(default)]
        body: Vec<Opcode>,
    },

    /// Finish the task with a result
    Complete {
        /// Final result, page paths are resolved
        #[serde(default)]
        result: Value,
    },

    /// Finish the task with an error
    Fail {
        /// Error message
        error: String,
    },

    /// Give other tasks a turn
    Yield,

    /// No operation
    Nop,

    // =========================================================================
    // STACK
    // =========================================================================

    /// Push a literal value
    Push {
        /// Value to push, taken literally
        value: Value,
    },

    /// Push the content of a page
    PushPage {
        /// Page to push
        page_id: String,
    },

    /// Discard the top value
    Pop,

    /// Pop the top value into a page
    PopTo {
        /// Page receiving the value
        store_to: String,
    },

    /// Duplicate the top value
    Dup,

    /// Swap the top two values
    Swap,

    /// Copy the top value into a page, leaving it on the stack
    Peek {
        /// Page receiving the value
        store_to: String,
    },

    /// Copy the value at `depth` (0 = top) into a page
    PeekAt {
        depth: usize,
        store_to: String,
    },

    /// Push a copy of the value at depth `n` (0 = top)
    DupN { n: usize },

    /// Swap the top with the value `n` below it; `SWAP_N 1` is SWAP
    SwapN { n: usize },

    /// Move the top value down among the top `n` values
    Rot { n: usize },

    /// Discard the top `n` values
    Drop {
        #[serde(default = "default_one")]
        n: usize,
    },

    /// Write the stack depth to a page
    Depth { store_to: String },

    /// Empty the stack
    Clear,

    // =========================================================================
    // REGISTERS
    // =========================================================================

    /// Set a run-wide register
    SetReg {
        /// Register to set
        reg: Register,
        /// New value, page paths are resolved
        value: Value,
    },

    /// Copy a register into a page
    GetReg {
        /// Register to read
        reg: Register,
        /// Page receiving the value
        store_to: String,
    },

    // =========================================================================
    // TOOLS - calls to the tool unit
    // =========================================================================

    /// Read a file
    ReadFile {
        /// File path
        path: String,
        /// Page receiving `{success, ...}`
        store_to: String,
    },

    /// Write a file
    WriteFile {
        /// File path
        path: String,
        /// Content to write
        content: String,
        /// Page receiving `{success, ...}`
        #[serde(default)]
        store_to: Option<String>,
    },

    /// List a directory
    ListDir {
        /// Directory path
        path: String,
        /// Page receiving `{success, ...}`
        store_to: String,
    },

    /// Run a shell command
    Exec {
        /// Command line
        command: String,
        /// Page receiving `{success, stdout, stderr, exit_code}`
        store_to: String,
        /// Overrides the configured call timeout
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Search files for a pattern
    Grep {
        /// Text to look for
        pattern: String,
        /// File or directory
        path: String,
        /// Page receiving `{success, matches, count}`
        store_to: String,
    },

    // =========================================================================
    // DEBUG
    // =========================================================================

    /// Append a message to the trace
    Log {
        /// Severity
        #[serde(default)]
        level: LogLevel,
        /// Message text
        message: String,
    },

    /// Snapshot pages, registers and task states
    Checkpoint {
        /// Name, replaces an older checkpoint of the same name
        name: String,
    },

    /// Restore a checkpoint
    Rollback {
        /// Checkpoint to restore
        name: String,
    },

    /// Fail the task if a condition is falsy
    Assert {
        /// Path expression, optionally prefixed with `!`
        condition: String,
        /// Failure message
        #[serde(default)]
        message: String,
    },

    // =========================================================================
    // PARALLEL
    // =========================================================================

    /// Start a child task running one opcode or a registered program
    Spawn {
        /// Single opcode for the child
        #[serde(default)]
        opcode: Option<Box<Opcode>>,
        /// Registered program for the child
        #[serde(default)]
        program_id: Option<String>,
        /// Bound in the child, key by key when a mapping
        #[serde(default)]
        args: Value,
        /// Explicit task id
        #[serde(default)]
        id: Option<String>,
        /// Page receiving the task id; pushed when absent
        #[serde(default)]
        store_to: Option<String>,
    },

    /// Wait for tasks and collect their outcomes
    Join {
        /// Task ids, or paths resolving to task ids
        tasks: Vec<String>,
        /// Page receiving `{task_id: {success, value|error}}`
        store_to: String,
    },

    /// Run branches as child tasks and join them in declaration order
    Parallel {
        /// Branches to run
        branches: Vec<Branch>,
        /// Page receiving `{branch: {success, value|error}}`
        store_to: String,
    },
}

/// Slice of a page read by partial page operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Start offset (0-indexed)
    pub start: usize,
    /// End offset (exclusive)
    pub end: usize,
}

/// Parameters forwarded to the compute unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferParams {
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
}

impl InferParams {
    /// Only the fields that are set
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(t) = self.temperature {
            map.insert("temperature".to_string(), Value::from(t));
        }
        if let Some(m) = self.max_tokens {
            map.insert("max_tokens".to_string(), Value::from(m));
        }
        if let Some(model) = &self.model {
            map.insert("model".to_string(), Value::from(model.clone()));
        }
        map
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Run-wide registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Register {
    /// Current goal
    Goal,
    /// Current focus (file, function, ...)
    Focus,
    /// Last thought
    Thought,
    /// Free-form flags
    Flags,
}

impl Register {
    pub const ALL: [Register; 4] = [Register::Goal, Register::Focus, Register::Thought, Register::Flags];

    pub fn as_str(&self) -> &'static str {
        match self {
            Register::Goal => "goal",
            Register::Focus => "focus",
            Register::Thought => "thought",
            Register::Flags => "flags",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == name)
    }
}

/// One PARALLEL branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Key in the joined result, defaults to `branch_{i}`
    #[serde(default)]
    pub name: Option<String>,
    /// Sub-program for the branch
    pub code: Vec<Opcode>,
}

impl Opcode {
    /// Decode one opcode record, reporting its position on failure
    pub fn from_value(value: Value, position: usize) -> Result<Self> {
        let name = value
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("<missing op>")
            .to_string();
        serde_json::from_value(value).map_err(|e| {
            error::malformed_at(position, format!("{} at position {}: {}", name, position, e))
                .with_context("opcode", name)
        })
    }

    /// Page IDs this opcode reads from
    pub fn reads_pages(&self) -> Vec<&str> {
        match self {
            Opcode::Load { page_id, .. } => vec![page_id.as_str()],
            Opcode::LoadPage { page_id, .. } => vec![page_id.as_str()],
            Opcode::Copy { src, .. } => vec![src.as_str()],
            Opcode::Infer { context, .. }
            | Opcode::Plan { context, .. }
            | Opcode::Reflect { context, .. }
            | Opcode::Inject { context, .. }
            | Opcode::InferBatch { context, .. } => context.iter().map(|s| s.as_str()).collect(),
            Opcode::Summarize { pages, .. } => pages.iter().map(|s| s.as_str()).collect(),
            Opcode::Chunk { source, .. } => vec![source.as_str()],
            Opcode::Merge { pages, .. } => pages.iter().map(|s| s.as_str()).collect(),
            Opcode::PushPage { page_id } => vec![page_id.as_str()],
            Opcode::Branch { condition, .. } | Opcode::Assert { condition, .. } => {
                path_root(condition.trim_start_matches('!')).into_iter().collect()
            }
            Opcode::Loop { over, .. } => path_root(over).into_iter().collect(),
            Opcode::Complete { result: value }
            | Opcode::Return { value }
            | Opcode::SetReg { value, .. }
            | Opcode::Call { args: value, .. }
            | Opcode::Spawn { args: value, .. } => {
                let mut roots = Vec::new();
                value_roots(value, &mut roots);
                roots
            }
            Opcode::ReadFile { path, .. } | Opcode::ListDir { path, .. } => {
                path_root(path).into_iter().collect()
            }
            Opcode::WriteFile { path, content, .. } => {
                path_root(path).into_iter().chain(path_root(content)).collect()
            }
            Opcode::Exec { command, .. } => path_root(command).into_iter().collect(),
            Opcode::Grep { pattern, path, .. } => {
                path_root(pattern).into_iter().chain(path_root(path)).collect()
            }
            _ => vec![],
        }
    }

    /// Page IDs this opcode writes to
    pub fn writes_pages(&self) -> Vec<&str> {
        match self {
            Opcode::Load { store_to, .. } => store_to.as_deref().into_iter().collect(),
            Opcode::LoadPage { page_id, store_to } => {
                let mut pages = vec![page_id.as_str()];
                pages.extend(store_to.as_deref());
                pages
            }
            Opcode::Store { page_id, .. } => vec![page_id.as_str()],
            Opcode::Alloc { store_to, .. } => store_to.as_deref().into_iter().collect(),
            Opcode::Free { page_id } => vec![page_id.as_str()],
            Opcode::Copy { dst, .. } => vec![dst.as_str()],
            Opcode::Infer { store_to, .. }
            | Opcode::Plan { store_to, .. }
            | Opcode::Reflect { store_to, .. }
            | Opcode::Summarize { store_to, .. }
            | Opcode::Merge { store_to, .. }
            | Opcode::PopTo { store_to }
            | Opcode::Peek { store_to }
            | Opcode::PeekAt { store_to, .. }
            | Opcode::Depth { store_to }
            | Opcode::GetReg { store_to, .. }
            | Opcode::ReadFile { store_to, .. }
            | Opcode::ListDir { store_to, .. }
            | Opcode::Exec { store_to, .. }
            | Opcode::Grep { store_to, .. }
            | Opcode::Join { store_to, .. }
            | Opcode::Parallel { store_to, .. } => vec![store_to.as_str()],
            Opcode::Inject { store_to, .. }
            | Opcode::WriteFile { store_to, .. }
            | Opcode::Chunk { store_to, .. }
            | Opcode::Spawn { store_to, .. } => store_to.as_deref().into_iter().collect(),
            Opcode::InferBatch { store_combined, .. } => store_combined.as_deref().into_iter().collect(),
            _ => vec![],
        }
    }

    /// Every page this opcode may touch, including generated batch pages
    pub fn touched_pages(&self) -> Vec<String> {
        let mut pages: Vec<String> = self
            .reads_pages()
            .into_iter()
            .chain(self.writes_pages())
            .map(str::to_string)
            .collect();
        if let Opcode::InferBatch { prompts, store_prefix, .. } = self {
            pages.extend((0..prompts.len()).map(|i| format!("{}_{}", store_prefix, i)));
        }
        pages
    }

    /// Labels this opcode may jump to
    pub fn jump_targets(&self) -> Vec<&str> {
        match self {
            Opcode::Jump { target } => vec![target.as_str()],
            Opcode::Branch { if_true, if_false, .. } => vec![if_true.as_str(), if_false.as_str()],
            _ => vec![],
        }
    }

    /// Parameter checks serde cannot express
    pub fn validate(&self) -> Result<()> {
        let name = self.name();
        for page in self.reads_pages().into_iter().chain(self.writes_pages()) {
            if page.trim().is_empty() {
                return Err(error::malformed_opcode(name, "page id must not be empty"));
            }
        }

        match self {
            Opcode::Chunk { chunk_size: 0, .. } => {
                Err(error::malformed_opcode(name, "chunk_size must be positive"))
            }
            Opcode::InferBatch { prompts, store_prefix, .. } => {
                if prompts.is_empty() {
                    return Err(error::malformed_opcode(name, "prompts must not be empty"));
                }
                if store_prefix.is_empty() {
                    return Err(error::malformed_opcode(name, "store_prefix must not be empty"));
                }
                Ok(())
            }
            Opcode::Loop { var, body, .. } => {
                if var.is_empty() {
                    return Err(error::malformed_opcode(name, "var must not be empty"));
                }
                validate_block(body)
            }
            Opcode::Spawn { opcode, program_id, .. } => match (opcode, program_id) {
                (Some(op), None) => {
                    if !op.jump_targets().is_empty() || matches!(**op, Opcode::Label { .. }) {
                        return Err(error::malformed_opcode(
                            name,
                            "a spawned opcode cannot use labels",
                        ));
                    }
                    op.validate()
                }
                (None, Some(_)) => Ok(()),
                _ => Err(error::malformed_opcode(
                    name,
                    "exactly one of opcode or program_id is required",
                )),
            },
            Opcode::SwapN { n: 0 } => Err(error::malformed_opcode(name, "n must be positive")),
            Opcode::Join { tasks, .. } if tasks.is_empty() => {
                Err(error::malformed_opcode(name, "tasks must not be empty"))
            }
            Opcode::Parallel { branches, .. } => {
                if branches.is_empty() {
                    return Err(error::malformed_opcode(name, "branches must not be empty"));
                }
                let mut seen = HashSet::new();
                for (i, branch) in branches.iter().enumerate() {
                    if !seen.insert(branch.key(i)) {
                        return Err(error::malformed_opcode(
                            name,
                            format!("duplicate branch name '{}'", branch.key(i)),
                        ));
                    }
                    validate_block(&branch.code)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Opcode name as it appears in program records
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Load { .. } => "LOAD",
            Opcode::LoadPage { .. } => "LOAD_PAGE",
            Opcode::Store { .. } => "STORE",
            Opcode::Alloc { .. } => "ALLOC",
            Opcode::Free { .. } => "FREE",
            Opcode::Copy { .. } => "COPY",
            Opcode::Infer { .. } => "INFER",
            Opcode::Plan { .. } => "PLAN",
            Opcode::Reflect { .. } => "REFLECT",
            Opcode::Inject { .. } => "INJECT",
            Opcode::InferBatch { .. } => "INFER_BATCH",
            Opcode::Summarize { .. } => "SUMMARIZE",
            Opcode::Chunk { .. } => "CHUNK",
            Opcode::Merge { .. } => "MERGE",
            Opcode::Label { .. } => "LABEL",
            Opcode::Jump { .. } => "JUMP",
            Opcode::Branch { .. } => "BRANCH",
            Opcode::Call { .. } => "CALL",
            Opcode::Return { .. } => "RETURN",
            Opcode::Loop { .. } => "LOOP",
            Opcode::Complete { .. } => "COMPLETE",
            Opcode::Fail { .. } => "FAIL",
            Opcode::Yield => "YIELD",
            Opcode::Nop => "NOP",
            Opcode::Push { .. } => "PUSH",
            Opcode::PushPage { .. } => "PUSH_PAGE",
            Opcode::Pop => "POP",
            Opcode::PopTo { .. } => "POP_TO",
            Opcode::Dup => "DUP",
            Opcode::Swap => "SWAP",
            Opcode::Peek { .. } => "PEEK",
            Opcode::PeekAt { .. } => "PEEK_AT",
            Opcode::DupN { .. } => "DUP_N",
            Opcode::SwapN { .. } => "SWAP_N",
            Opcode::Rot { .. } => "ROT",
            Opcode::Drop { .. } => "DROP",
            Opcode::Depth { .. } => "DEPTH",
            Opcode::Clear => "CLEAR",
            Opcode::SetReg { .. } => "SET_REG",
            Opcode::GetReg { .. } => "GET_REG",
            Opcode::ReadFile { .. } => "READ_FILE",
            Opcode::WriteFile { .. } => "WRITE_FILE",
            Opcode::ListDir { .. } => "LIST_DIR",
            Opcode::Exec { .. } => "EXEC",
            Opcode::Grep { .. } => "GREP",
            Opcode::Log { .. } => "LOG",
            Opcode::Checkpoint { .. } => "CHECKPOINT",
            Opcode::Rollback { .. } => "ROLLBACK",
            Opcode::Assert { .. } => "ASSERT",
            Opcode::Spawn { .. } => "SPAWN",
            Opcode::Join { .. } => "JOIN",
            Opcode::Parallel { .. } => "PARALLEL",
        }
    }

    /// Operand summary for traces and listings
    pub fn summary(&self) -> String {
        use value::{brief, truncate};

        let ctx = |context: &[String]| {
            if context.is_empty() {
                String::new()
            } else {
                format!(" [{}]", context.join(", "))
            }
        };
        let target = |store_to: &Option<String>| {
            store_to.as_ref().map(|s| format!(" → {}", s)).unwrap_or_default()
        };

        match self {
            Opcode::Load { page_id, store_to, .. } => format!("{}{}", page_id, target(store_to)),
            Opcode::LoadPage { page_id, store_to } => format!("{}{}", page_id, target(store_to)),
            Opcode::Store { page_id, data } => format!("{} = {}", page_id, brief(data)),
            Opcode::Alloc { label, store_to, .. } => {
                format!("{}{}", label.clone().unwrap_or_default(), target(store_to))
            }
            Opcode::Free { page_id } => page_id.clone(),
            Opcode::Copy { src, dst, .. } => format!("{} → {}", src, dst),
            Opcode::Infer { prompt, context, store_to, .. } => {
                format!("\"{}\"{} → {}", truncate(prompt, 25), ctx(context), store_to)
            }
            Opcode::Plan { goal, context, store_to } => {
                format!("\"{}\"{} → {}", truncate(goal, 25), ctx(context), store_to)
            }
            Opcode::Reflect { question, include_trace, store_to, .. } => {
                let trace = if *include_trace { " +trace" } else { "" };
                format!("\"{}\"{} → {}", truncate(question, 25), trace, store_to)
            }
            Opcode::Inject { goal, store_to, .. } => {
                format!("\"{}\"{}", truncate(goal, 25), target(store_to))
            }
            Opcode::InferBatch { prompts, store_prefix, .. } => {
                format!("{} prompts → {}_*", prompts.len(), store_prefix)
            }
            Opcode::Summarize { pages, store_to, .. } => format!("[{}] → {}", pages.join(", "), store_to),
            Opcode::Chunk { source, chunk_size, .. } => format!("{} / {}", source, chunk_size),
            Opcode::Merge { pages, store_to, .. } => format!("[{}] → {}", pages.join(", "), store_to),
            Opcode::Label { name } => format!(":{}", name),
            Opcode::Jump { target } => format!("→ {}", target),
            Opcode::Branch { condition, if_true, if_false } => {
                format!("{} ? {} : {}", truncate(condition, 15), if_true, if_false)
            }
            Opcode::Call { program_id, store_to, .. } => format!("{}{}", program_id, target(store_to)),
            Opcode::Return { value } => brief(value),
            Opcode::Loop { var, over, body } => format!("{} in {} ({} ops)", var, over, body.len()),
            Opcode::Complete { result } => brief(result),
            Opcode::Fail { error } => format!("\"{}\"", truncate(error, 40)),
            Opcode::Push { value } => brief(value),
            Opcode::PushPage { page_id } => page_id.clone(),
            Opcode::PopTo { store_to } | Opcode::Peek { store_to } | Opcode::Depth { store_to } => {
                format!("→ {}", store_to)
            }
            Opcode::PeekAt { depth, store_to } => format!("{} → {}", depth, store_to),
            Opcode::DupN { n } | Opcode::SwapN { n } | Opcode::Rot { n } | Opcode::Drop { n } => n.to_string(),
            Opcode::SetReg { reg, value } => format!("{} = {}", reg.as_str(), brief(value)),
            Opcode::GetReg { reg, store_to } => format!("{} → {}", reg.as_str(), store_to),
            Opcode::ReadFile { path, store_to } | Opcode::ListDir { path, store_to } => {
                format!("{} → {}", path, store_to)
            }
            Opcode::WriteFile { path, store_to, .. } => format!("{}{}", path, target(store_to)),
            Opcode::Exec { command, store_to, .. } => format!("`{}` → {}", truncate(command, 30), store_to),
            Opcode::Grep { pattern, path, store_to } => format!("\"{}\" in {} → {}", pattern, path, store_to),
            Opcode::Log { level, message } => format!("[{:?}] \"{}\"", level, truncate(message, 30)),
            Opcode::Checkpoint { name } | Opcode::Rollback { name } => name.clone(),
            Opcode::Assert { condition, .. } => truncate(condition, 40),
            Opcode::Spawn { opcode, program_id, .. } => match (opcode, program_id) {
                (Some(op), _) => op.name().to_string(),
                (None, Some(program_id)) => program_id.clone(),
                (None, None) => String::new(),
            },
            Opcode::Join { tasks, store_to } => format!("[{}] → {}", tasks.join(", "), store_to),
            Opcode::Parallel { branches, store_to } => format!("{} branches → {}", branches.len(), store_to),
            Opcode::Yield
            | Opcode::Nop
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::Swap
            | Opcode::Clear => String::new(),
        }
    }
}

impl Branch {
    /// Result key of the branch at `index`
    pub fn key(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("branch_{}", index))
    }
}

fn default_one() -> usize {
    1
}

fn path_root(expr: &str) -> Option<&str> {
    value::parse_path(expr).map(|(root, _)| root)
}

/// Roots of every string leaf that parses as a path
fn value_roots<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::String(s) => out.extend(path_root(s)),
        Value::Array(items) => items.iter().for_each(|v| value_roots(v, out)),
        Value::Object(map) => map.values().for_each(|v| value_roots(v, out)),
        _ => {}
    }
}

/// Check a block of opcodes as one label scope: unique labels, known jump
/// targets, valid parameters.
pub fn validate_block(ops: &[Opcode]) -> Result<()> {
    let mut labels = HashSet::new();
    for (i, op) in ops.iter().enumerate() {
        if let Opcode::Label { name } = op {
            if !labels.insert(name.as_str()) {
                return Err(error::malformed_at(i, format!("duplicate label '{}'", name))
                    .with_context("label", name.clone()));
            }
        }
    }
    for (i, op) in ops.iter().enumerate() {
        op.validate().map_err(|e| e.with_context("position", i.to_string()))?;
        for target in op.jump_targets() {
            if !labels.contains(target) {
                return Err(error::malformed_at(
                    i,
                    format!("{} targets unknown label '{}'", op.name(), target),
                )
                .with_context("label", target));
            }
        }
    }
    Ok(())
}

/// Program descriptor accepted for submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Unique program identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Description of what this program does
    #[serde(default)]
    pub description: Option<String>,
    /// The opcodes that make up this program
    pub code: Vec<Opcode>,
    /// Entry point label (defaults to label `entry`, then the first opcode)
    #[serde(default)]
    pub entry: Option<String>,
}

impl Program {
    /// Create a new program
    pub fn new(id: impl Into<String>, name: impl Into<String>, code: Vec<Opcode>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            code,
            entry: None,
        }
    }

    /// Parse and validate a JSON program descriptor
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| error::parse_error(format!("program is not valid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Decode a descriptor opcode by opcode, then validate it
    pub fn from_value(value: Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct Descriptor {
            id: String,
            name: String,
            #[serde(default)]
            description: Option<String>,
            code: Vec<Value>,
            #[serde(default)]
            entry: Option<String>,
        }

        let descriptor: Descriptor = serde_json::from_value(value)
            .map_err(|e| error::malformed_opcode("PROGRAM", format!("invalid descriptor: {}", e)))?;
        let code = descriptor
            .code
            .into_iter()
            .enumerate()
            .map(|(i, v)| Opcode::from_value(v, i))
            .collect::<Result<Vec<_>>>()?;

        let program = Program {
            id: descriptor.id,
            name: descriptor.name,
            description: descriptor.description,
            code,
            entry: descriptor.entry,
        };
        program.validate()?;
        Ok(program)
    }

    /// Schema and label checks; run before anything executes
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(error::malformed_opcode("PROGRAM", "program id must not be empty"));
        }
        validate_block(&self.code).map_err(|e| e.with_context("program", self.id.clone()))?;
        if let Some(entry) = &self.entry {
            let found = self
                .code
                .iter()
                .any(|op| matches!(op, Opcode::Label { name } if name == entry));
            if !found {
                return Err(error::invalid_label(entry.clone()).with_context("program", self.id.clone()));
            }
        }
        Ok(())
    }

    /// Numbered listing of the program
    pub fn listing(&self) -> String {
        let mut out = format!("--- {} ---\nID: {}\n", self.name, self.id);
        if let Some(desc) = &self.description {
            out.push_str(&format!("{}\n", desc));
        }
        if let Some(entry) = &self.entry {
            out.push_str(&format!("Entry: {}\n", entry));
        }
        out.push_str(&format!("Opcodes: {}\n\n", self.code.len()));
        list_block(&mut out, &self.code, 0);
        out
    }

    /// Pretty print the program to stdout
    pub fn pretty_print(&self) {
        println!("{}", self.listing());
    }
}

fn list_block(out: &mut String, ops: &[Opcode], depth: usize) {
    let pad = "    ".repeat(depth);
    for (i, op) in ops.iter().enumerate() {
        // Labels at column 0, instructions indented
        let indent = if matches!(op, Opcode::Label { .. }) { "" } else { "    " };
        let summary = op.summary();
        if summary.is_empty() {
            out.push_str(&format!("{}{:3} | {}{}\n", pad, i, indent, op.name()));
        } else {
            out.push_str(&format!("{}{:3} | {}{} {}\n", pad, i, indent, op.name(), summary));
        }
        match op {
            Opcode::Loop { body, .. } => list_block(out, body, depth + 1),
            Opcode::Parallel { branches, .. } => {
                for (b, branch) in branches.iter().enumerate() {
                    out.push_str(&format!("{}      | {}:\n", pad, branch.key(b)));
                    list_block(out, &branch.code, depth + 1);
                }
            }
            _ => {}
        }
    }
}

/// Decode an INJECT payload into opcodes.
///
/// Accepts a sequence of opcode records, a mapping `{"code": [...]}`, or a
/// string holding either (markdown code fences are stripped).
pub fn parse_injection(payload: &Value) -> Result<Vec<Opcode>> {
    match payload {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Opcode::from_value(v.clone(), i).map_err(|e| {
                    error::invalid_injection(format!("element {}: {}", i, e.message()))
                })
            })
            .collect(),
        Value::Object(map) => match map.get("code") {
            Some(code) if code.is_array() => parse_injection(code),
            _ => Err(error::invalid_injection("mapping payload needs a 'code' sequence")),
        },
        Value::String(text) => {
            let parsed: Value = serde_json::from_str(strip_fences(text))
                .map_err(|e| error::invalid_injection(format!("payload is not JSON: {}", e)))?;
            if parsed.is_string() {
                return Err(error::invalid_injection("payload is a bare string"));
            }
            parse_injection(&parsed)
        }
        other => Err(error::invalid_injection(format!(
            "expected opcode sequence, got {}",
            value::type_name(other)
        ))),
    }
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the opening fence
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().trim_end_matches("```").trim()
}
