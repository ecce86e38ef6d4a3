//! # Call stack
//!
//! Frames record where to resume and which bindings are visible. A CALL
//! frame also remembers where RETURN should store its value; a LOOP frame
//! carries the snapshot it iterates.

use crate::error::{self, Result};
use crate::program::CodeBlock;
use serde_json::{Map, Value};

/// What pushed the frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    /// CALL; RETURN writes its value to `store_to`
    Call { store_to: String },
    /// One LOOP iteration over `items[index]`
    Loop {
        var: String,
        items: Vec<Value>,
        index: usize,
    },
}

/// One call-stack entry
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Caller pc to resume at
    pub return_pc: usize,
    /// Loop variable or call arguments
    pub bindings: Map<String, Value>,
    pub caller_program_id: String,
    /// The block that was running before this frame was entered
    pub(crate) caller_code: CodeBlock,
}

impl Frame {
    /// Frame for entering a called program with `args`
    pub fn call(caller_code: CodeBlock, return_pc: usize, args: Value, store_to: String) -> Self {
        let mut bindings = Map::new();
        if let Value::Object(map) = &args {
            bindings.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        bindings.insert("args".to_string(), args);
        Self {
            kind: FrameKind::Call { store_to },
            return_pc,
            bindings,
            caller_program_id: caller_code.program_id().to_string(),
            caller_code,
        }
    }

    /// Fresh frame for iteration `index`; `None` once the snapshot is spent
    pub fn iteration(
        caller_code: CodeBlock,
        return_pc: usize,
        var: String,
        items: Vec<Value>,
        index: usize,
    ) -> Option<Self> {
        let item = items.get(index)?.clone();
        let mut bindings = Map::new();
        bindings.insert(var.clone(), item);
        Some(Self {
            kind: FrameKind::Loop { var, items, index },
            return_pc,
            bindings,
            caller_program_id: caller_code.program_id().to_string(),
            caller_code,
        })
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, FrameKind::Call { .. })
    }
}

/// Bounded stack of frames
#[derive(Debug, Clone, PartialEq)]
pub struct CallStack {
    frames: Vec<Frame>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Fails if one more frame would exceed the limit
    pub fn ensure_room(&self) -> Result<()> {
        if self.frames.len() >= self.max_depth {
            return Err(error::call_depth_exceeded(self.max_depth));
        }
        Ok(())
    }

    pub fn push(&mut self, frame: Frame) -> Result<()> {
        self.ensure_room()?;
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Frames bottom to top
    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }

    /// Innermost binding of `name`, not looking past the nearest CALL frame.
    ///
    /// Returns `Err(())` when a CALL frame was crossed without a match, so
    /// the caller knows outer scopes are hidden.
    pub(crate) fn binding(&self, name: &str) -> std::result::Result<Option<&Value>, ()> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.bindings.get(name) {
                return Ok(Some(value));
            }
            if frame.is_call() {
                return Err(());
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::opcode::Opcode;
    use serde_json::json;

    fn block(id: &str) -> CodeBlock {
        CodeBlock::new(id, vec![Opcode::Nop]).unwrap()
    }

    #[test]
    fn test_call_frame_binds_args() {
        let frame = Frame::call(block("main"), 3, json!({"x": 1}), "lib_result".to_string());
        assert_eq!(frame.bindings.get("x"), Some(&json!(1)));
        assert_eq!(frame.bindings.get("args"), Some(&json!({"x": 1})));
        assert_eq!(frame.caller_program_id, "main");
        assert_eq!(frame.return_pc, 3);
    }

    #[test]
    fn test_iteration_frames() {
        let items = vec![json!("a"), json!("b")];
        let frame = Frame::iteration(block("main"), 1, "x".to_string(), items.clone(), 1).unwrap();
        assert_eq!(frame.bindings.get("x"), Some(&json!("b")));
        assert!(Frame::iteration(block("main"), 1, "x".to_string(), items, 2).is_none());
    }

    #[test]
    fn test_depth_limit() {
        let mut stack = CallStack::new(1);
        stack.push(Frame::call(block("a"), 0, json!(null), "r".to_string())).unwrap();
        let err = stack
            .push(Frame::call(block("b"), 0, json!(null), "r".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallDepthExceeded);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_binding_scope_stops_at_call() {
        let mut stack = CallStack::new(8);
        let outer = Frame::iteration(block("main"), 1, "item".to_string(), vec![json!(1)], 0).unwrap();
        stack.push(outer).unwrap();
        assert_eq!(stack.binding("item"), Ok(Some(&json!(1))));

        stack.push(Frame::call(block("main"), 2, json!({"y": 2}), "r".to_string())).unwrap();
        assert_eq!(stack.binding("y"), Ok(Some(&json!(2))));
        assert_eq!(stack.binding("item"), Err(()));

        let inner = Frame::iteration(block("lib"), 0, "z".to_string(), vec![json!(3)], 0).unwrap();
        stack.push(inner).unwrap();
        assert_eq!(stack.binding("z"), Ok(Some(&json!(3))));
        assert_eq!(stack.binding("y"), Ok(Some(&json!(2))));
    }
}
