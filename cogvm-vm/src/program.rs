//! # Code blocks
//!
//! A `CodeBlock` is the addressable instruction array a task executes: a
//! registered program, a loop body, a parallel branch or a spawned opcode,
//! together with its label table.

use crate::error::{self, Result};
use crate::opcode::{Opcode, Program};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct CodeBlock {
    program_id: String,
    ops: Vec<Opcode>,
    labels: HashMap<String, usize>,
    entry: usize,
}

impl CodeBlock {
    /// Build a block and its label table. Duplicate labels are rejected.
    pub fn new(program_id: impl Into<String>, ops: Vec<Opcode>) -> Result<Self> {
        let labels = index_labels(&ops)?;
        let entry = labels.get("entry").copied().unwrap_or(0);
        Ok(Self {
            program_id: program_id.into(),
            ops,
            labels,
            entry,
        })
    }

    /// Block for a validated program, honoring its `entry` label
    pub fn from_program(program: &Program) -> Result<Self> {
        let mut block = Self::new(program.id.clone(), program.code.clone())?;
        if let Some(entry) = &program.entry {
            block.entry = block.label(entry)?;
        }
        Ok(block)
    }

    /// Block running one opcode, then completing with the first page it writes
    pub fn single(program_id: impl Into<String>, op: Opcode) -> Result<Self> {
        let result = op
            .writes_pages()
            .first()
            .map(|page| Value::String(page.to_string()))
            .unwrap_or(Value::Null);
        Self::new(program_id, vec![op, Opcode::Complete { result }])
    }

    pub fn program_id(&self) -> &str {
        &self.program_id
    }

    pub fn get(&self, pc: usize) -> Option<&Opcode> {
        self.ops.get(pc)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Opcode] {
        &self.ops
    }

    /// Where execution starts
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Index of a label in this block
    pub fn label(&self, name: &str) -> Result<usize> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| error::invalid_label(name).with_context("program", self.program_id.clone()))
    }

    /// Insert a validated block at `at`, shifting labels at or after it.
    ///
    /// The inserted opcodes may only jump to labels of the combined block.
    /// Nothing changes unless every check passes.
    pub fn splice(&mut self, at: usize, ops: Vec<Opcode>) -> Result<usize> {
        let at = at.min(self.ops.len());
        let count = ops.len();

        let incoming = index_labels(&ops).map_err(|e| error::invalid_injection(e.message()))?;
        if let Some(name) = incoming.keys().find(|name| self.labels.contains_key(*name)) {
            return Err(error::invalid_injection(format!("label '{}' already defined", name)));
        }

        let mut labels: HashMap<String, usize> = self
            .labels
            .iter()
            .map(|(name, &pos)| (name.clone(), if pos >= at { pos + count } else { pos }))
            .collect();
        labels.extend(incoming.into_iter().map(|(name, pos)| (name, pos + at)));

        for (i, op) in ops.iter().enumerate() {
            op.validate()
                .map_err(|e| error::invalid_injection(format!("element {}: {}", i, e.message())))?;
            if let Some(target) = op.jump_targets().into_iter().find(|t| !labels.contains_key(*t)) {
                return Err(error::invalid_injection(format!(
                    "element {}: unknown label '{}'",
                    i, target
                )));
            }
        }

        let tail = self.ops.split_off(at);
        self.ops.extend(ops);
        self.ops.extend(tail);
        self.labels = labels;
        if self.entry >= at {
            self.entry += count;
        }
        Ok(count)
    }
}

fn index_labels(ops: &[Opcode]) -> Result<HashMap<String, usize>> {
    let mut labels = HashMap::new();
    for (i, op) in ops.iter().enumerate() {
        if let Opcode::Label { name } = op {
            if labels.insert(name.clone(), i).is_some() {
                return Err(error::malformed_at(i, format!("duplicate label '{}'", name)));
            }
        }
    }
    Ok(labels)
}
