//! Persistent stack shared between registers and continuations.
//!
//! Pushing and popping never disturb other handles to the same stack, so a
//! continuation can keep a snapshot of the operand or control stack for the
//! cost of a reference count.

use std::sync::Arc;

struct Node<T> {
    value: T,
    next: Option<Arc<Node<T>>>,
}

pub struct Stack<T> {
    head: Option<Arc<Node<T>>>,
    len: usize,
}

impl<T> Clone for Stack<T> {
    fn clone(&self) -> Self {
        Stack {
            head: self.head.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Stack { head: None, len: 0 }
    }
}

impl<T: Clone> Stack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push(&mut self, value: T) {
        let next = self.head.take();
        self.head = Some(Arc::new(Node { value, next }));
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        let node = self.head.take()?;
        self.len -= 1;
        match Arc::try_unwrap(node) {
            Ok(node) => {
                self.head = node.next;
                Some(node.value)
            }
            Err(shared) => {
                self.head = shared.next.clone();
                Some(shared.value.clone())
            }
        }
    }

    pub fn peek(&self) -> Option<&T> {
        self.head.as_ref().map(|node| &node.value)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.as_deref(),
        }
    }

    /// The part of the stack beneath the first element matching `found`,
    /// searching from the top.
    pub fn below(&self, found: impl Fn(&T) -> bool) -> Option<Stack<T>> {
        let mut node = self.head.as_ref();
        let mut len = self.len;
        while let Some(current) = node {
            len -= 1;
            if found(&current.value) {
                return Some(Stack {
                    head: current.next.clone(),
                    len,
                });
            }
            node = current.next.as_ref();
        }
        None
    }

    /// Whether both handles share the same top node.
    pub fn same(&self, other: &Stack<T>) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

pub struct Iter<'a, T> {
    next: Option<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(&node.value)
    }
}

impl<T> Drop for Stack<T> {
    // Unlink uniquely owned nodes one at a time so that long stacks do not
    // recurse on drop.
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let mut stack = Stack::new();
        for n in 0..5 {
            stack.push(n);
        }
        assert_eq!(stack.len(), 5);
        assert_eq!(stack.peek(), Some(&4));
        let popped: Vec<_> = std::iter::from_fn(|| stack.pop()).collect();
        assert_eq!(popped, vec![4, 3, 2, 1, 0]);
        assert!(stack.is_empty());
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_snapshots_are_independent() {
        let mut stack = Stack::new();
        stack.push("a");
        stack.push("b");
        let snapshot = stack.clone();
        assert!(snapshot.same(&stack));

        stack.pop();
        stack.push("c");
        assert!(!snapshot.same(&stack));
        assert_eq!(snapshot.iter().copied().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(stack.iter().copied().collect::<Vec<_>>(), vec!["c", "a"]);
    }

    #[test]
    fn test_below() {
        let mut stack = Stack::new();
        for n in [1, 2, 3, 4] {
            stack.push(n);
        }
        let rest = stack.below(|n| *n == 3).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest.iter().copied().collect::<Vec<_>>(), vec![2, 1]);
        assert!(stack.below(|n| *n == 9).is_none());
    }

    #[test]
    fn test_long_stack_drop() {
        let mut stack = Stack::new();
        for n in 0..200_000 {
            stack.push(n);
        }
        drop(stack);
    }
}
