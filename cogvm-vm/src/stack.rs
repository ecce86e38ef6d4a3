//! # Operand stack
//!
//! A bounded LIFO of values, one per task. Underflow and overflow are
//! errors that fail the owning task.

use crate::config::DEFAULT_MAX_STACK;
use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum stack depth
pub const MAX_STACK_SIZE: usize = DEFAULT_MAX_STACK;

/// Operand stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    data: Vec<Value>,
    limit: usize,
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

impl Stack {
    /// Create a new empty stack
    pub fn new() -> Self {
        Self::with_limit(MAX_STACK_SIZE)
    }

    /// Create a stack holding at most `limit` values
    pub fn with_limit(limit: usize) -> Self {
        Stack {
            data: Vec::with_capacity(limit.min(32)),
            limit,
        }
    }

    /// Current stack size
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if stack is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Push a value onto the stack
    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.data.len() >= self.limit {
            return Err(error::stack_overflow(self.limit));
        }
        self.data.push(value);
        Ok(())
    }

    /// Pop a value from the stack
    pub fn pop(&mut self) -> Result<Value> {
        self.data.pop().ok_or_else(|| error::stack_underflow(1, 0))
    }

    /// Peek at the top value without removing it
    pub fn peek(&self) -> Result<&Value> {
        self.data.last().ok_or_else(|| error::stack_underflow(1, 0))
    }

    /// Duplicate the top value
    pub fn dup(&mut self) -> Result<()> {
        let value = self.peek()?.clone();
        self.push(value)
    }

    /// Value at `depth`, 0 being the top
    pub fn peek_at(&self, depth: usize) -> Result<&Value> {
        let len = self.data.len();
        if depth >= len {
            return Err(error::stack_underflow(depth + 1, len));
        }
        Ok(&self.data[len - 1 - depth])
    }

    /// Push a copy of the value at `depth`
    pub fn dup_n(&mut self, depth: usize) -> Result<()> {
        let value = self.peek_at(depth)?.clone();
        self.push(value)
    }

    /// Swap top two values
    pub fn swap(&mut self) -> Result<()> {
        self.swap_n(1)
    }

    /// Swap the top with the value `n` below it. `swap_n(1)` is SWAP.
    pub fn swap_n(&mut self, n: usize) -> Result<()> {
        let len = self.data.len();
        if n == 0 {
            return Err(error::malformed_opcode("SWAP_N", "n must be positive"));
        }
        if len <= n {
            return Err(error::stack_underflow(n + 1, len));
        }
        self.data.swap(len - 1, len - 1 - n);
        Ok(())
    }

    /// Move the top value down to position `n` among the top `n` values.
    /// `rot(3)` on `[a, b, c]` gives `[c, a, b]`.
    pub fn rot(&mut self, n: usize) -> Result<()> {
        let len = self.data.len();
        if n > len {
            return Err(error::stack_underflow(n, len));
        }
        if n > 1 {
            self.data[len - n..].rotate_right(1);
        }
        Ok(())
    }

    /// Discard the top `n` values
    pub fn drop_n(&mut self, n: usize) -> Result<()> {
        let len = self.data.len();
        if n > len {
            return Err(error::stack_underflow(n, len));
        }
        self.data.truncate(len - n);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_push_pop() {
        let mut stack = Stack::new();
        stack.push(json!(1)).unwrap();
        stack.push(json!("hello")).unwrap();
        stack.push(json!({"key": "value"})).unwrap();

        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop().unwrap(), json!({"key": "value"}));
        assert_eq!(stack.pop().unwrap(), json!("hello"));
        assert_eq!(stack.pop().unwrap(), json!(1));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_dup() {
        let mut stack = Stack::new();
        stack.push(json!(42)).unwrap();
        stack.dup().unwrap();

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop().unwrap(), json!(42));
        assert_eq!(stack.pop().unwrap(), json!(42));
    }

    #[test]
    fn test_swap() {
        let mut stack = Stack::new();
        stack.push(json!(1)).unwrap();
        stack.push(json!(2)).unwrap();
        stack.swap().unwrap();

        assert_eq!(stack.pop().unwrap(), json!(1));
        assert_eq!(stack.pop().unwrap(), json!(2));
    }

    #[test]
    fn test_deep_access() {
        let mut stack = Stack::new();
        for v in ["a", "b", "c"] {
            stack.push(json!(v)).unwrap();
        }
        assert_eq!(stack.peek_at(0).unwrap(), &json!("c"));
        assert_eq!(stack.peek_at(2).unwrap(), &json!("a"));

        stack.dup_n(2).unwrap();
        assert_eq!(stack.pop().unwrap(), json!("a"));

        stack.swap_n(2).unwrap();
        assert_eq!(stack.peek().unwrap(), &json!("a"));
        assert_eq!(stack.peek_at(2).unwrap(), &json!("c"));
    }

    #[test]
    fn test_rot_drop_clear() {
        let mut stack = Stack::new();
        for v in ["a", "b", "c"] {
            stack.push(json!(v)).unwrap();
        }
        stack.rot(3).unwrap();
        assert_eq!(stack.peek_at(2).unwrap(), &json!("c"));
        assert_eq!(stack.peek_at(1).unwrap(), &json!("a"));
        assert_eq!(stack.peek().unwrap(), &json!("b"));

        stack.rot(0).unwrap();
        assert_eq!(stack.len(), 3);

        stack.drop_n(2).unwrap();
        assert_eq!(stack.len(), 1);
        stack.clear();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_deep_underflow() {
        let mut stack = Stack::new();
        stack.push(json!(1)).unwrap();
        stack.push(json!(2)).unwrap();

        let err = stack.peek_at(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StackUnderflow);
        assert_eq!(err.message(), "needed 3 stack values, found 2");
        assert!(stack.dup_n(5).is_err_and(|e| e.kind() == ErrorKind::StackUnderflow));
        assert!(stack.swap_n(2).is_err_and(|e| e.kind() == ErrorKind::StackUnderflow));
        assert!(stack.swap_n(0).is_err_and(|e| e.kind() == ErrorKind::MalformedOpcode));
        assert!(stack.rot(3).is_err_and(|e| e.kind() == ErrorKind::StackUnderflow));
        assert!(stack.drop_n(3).is_err_and(|e| e.kind() == ErrorKind::StackUnderflow));
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_underflow() {
        let mut stack = Stack::new();
        assert!(stack.pop().is_err_and(|e| e.kind() == ErrorKind::StackUnderflow));
        assert!(stack.dup().is_err_and(|e| e.kind() == ErrorKind::StackUnderflow));

        stack.push(json!(1)).unwrap();
        let err = stack.swap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StackUnderflow);
        assert_eq!(err.message(), "needed 2 stack values, found 1");
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_overflow() {
        let mut stack = Stack::new();
        for i in 0..MAX_STACK_SIZE {
            stack.push(json!(i)).unwrap();
        }
        assert!(stack.push(json!(999)).is_err_and(|e| e.kind() == ErrorKind::StackOverflow));
        assert_eq!(stack.len(), MAX_STACK_SIZE);
    }

    #[test]
    fn test_custom_limit() {
        let mut stack = Stack::with_limit(1);
        stack.push(json!(1)).unwrap();
        assert!(stack.dup().is_err_and(|e| e.kind() == ErrorKind::StackOverflow));
    }
}
