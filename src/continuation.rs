//! First-class continuations.
//!
//! A continuation is the operand stack and control stack at a moment of
//! evaluation. Both are persistent stacks, so capture costs two reference
//! counts and restoring hands the task its old stacks back wholesale.

use std::sync::Arc;

use crate::cell::Cell;
use crate::evaluator::{Frame, Registers};
use crate::stack::Stack;

pub struct Continuation {
    dump: Stack<Cell>,
    stack: Stack<Frame>,
}

impl Continuation {
    pub fn capture(registers: &Registers) -> Arc<Continuation> {
        Arc::new(Continuation {
            dump: registers.dump.clone(),
            stack: registers.stack.clone(),
        })
    }

    /// Built from explicit stacks, for escapes that resume below the
    /// current frame.
    pub fn from_parts(dump: Stack<Cell>, stack: Stack<Frame>) -> Arc<Continuation> {
        Arc::new(Continuation { dump, stack })
    }

    /// Replaces the operand and control stacks, discarding whatever was in
    /// progress.
    pub fn restore(&self, registers: &mut Registers) {
        tracing::trace!(depth = self.stack.len(), "restoring continuation");
        registers.dump = self.dump.clone();
        registers.stack = self.stack.clone();
    }
}
