//! Printable handles for opaque values.
//!
//! Scopes, closures, continuations, tasks and conduits have no textual form
//! of their own. They print as `%tag token%`, and the reader turns that text
//! back into the live value for as long as it is still reachable. The table
//! holds weak references only.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};

use crate::cell::Cell;
use crate::closure::Binding;
use crate::conduit::Conduit;
use crate::continuation::Continuation;
use crate::scope::Scope;
use crate::task::Task;

enum WeakCell {
    Scope(Weak<Scope>),
    Object(Weak<Scope>),
    Binding(Weak<Binding>),
    Continuation(Weak<Continuation>),
    Task(Weak<Task>),
    Conduit(Weak<dyn Conduit>),
}

impl WeakCell {
    fn of(cell: &Cell) -> Option<WeakCell> {
        Some(match cell {
            Cell::Scope(scope) => WeakCell::Scope(Arc::downgrade(scope)),
            Cell::Object(scope) => WeakCell::Object(Arc::downgrade(scope)),
            Cell::Binding(binding) => WeakCell::Binding(Arc::downgrade(binding)),
            Cell::Continuation(k) => WeakCell::Continuation(Arc::downgrade(k)),
            Cell::Task(task) => WeakCell::Task(Arc::downgrade(task)),
            Cell::Conduit(conduit) => WeakCell::Conduit(Arc::downgrade(conduit)),
            _ => return None,
        })
    }

    fn upgrade(&self) -> Option<Cell> {
        Some(match self {
            WeakCell::Scope(scope) => Cell::Scope(scope.upgrade()?),
            WeakCell::Object(scope) => Cell::Object(scope.upgrade()?),
            WeakCell::Binding(binding) => Cell::Binding(binding.upgrade()?),
            WeakCell::Continuation(k) => Cell::Continuation(k.upgrade()?),
            WeakCell::Task(task) => Cell::Task(task.upgrade()?),
            WeakCell::Conduit(conduit) => Cell::Conduit(conduit.upgrade()?),
        })
    }
}

fn address(cell: &Cell) -> Option<usize> {
    let ptr = match cell {
        Cell::Scope(scope) | Cell::Object(scope) => Arc::as_ptr(scope).cast::<()>(),
        Cell::Binding(binding) => Arc::as_ptr(binding).cast::<()>(),
        Cell::Continuation(k) => Arc::as_ptr(k).cast::<()>(),
        Cell::Task(task) => Arc::as_ptr(task).cast::<()>(),
        Cell::Conduit(conduit) => Arc::as_ptr(conduit).cast::<()>(),
        _ => return None,
    };
    Some(ptr as usize)
}

#[derive(Default)]
struct Table {
    next: u64,
    tokens: HashMap<(&'static str, usize), u64>,
    cells: HashMap<u64, WeakCell>,
}

impl Table {
    fn prune(&mut self) {
        self.cells.retain(|_, weak| weak.upgrade().is_some());
        let cells = &self.cells;
        self.tokens.retain(|_, token| cells.contains_key(token));
    }
}

static TABLE: LazyLock<Mutex<Table>> = LazyLock::new(Mutex::default);

/// Token naming an opaque cell. The same live value always gets the same
/// token; atoms and pairs have none.
pub fn token(cell: &Cell) -> Option<u64> {
    let key = (cell.tag(), address(cell)?);
    let mut table = TABLE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(&token) = table.tokens.get(&key)
        && table
            .cells
            .get(&token)
            .and_then(WeakCell::upgrade)
            .is_some_and(|live| live.is(cell))
    {
        return Some(token);
    }
    if table.cells.len().is_power_of_two() {
        table.prune();
    }
    table.next += 1;
    let token = table.next;
    table.tokens.insert(key, token);
    table.cells.insert(token, WeakCell::of(cell)?);
    Some(token)
}

/// The live value behind a printed handle.
pub fn deref(tag: &str, token: u64) -> Option<Cell> {
    let table = TABLE.lock().unwrap_or_else(PoisonError::into_inner);
    let cell = table.cells.get(&token)?.upgrade()?;
    (cell.tag() == tag).then_some(cell)
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_stable_and_dereferenceable() {
        let scope = Cell::Scope(Scope::new(None));
        let first = token(&scope).unwrap();
        assert_eq!(token(&scope), Some(first));
        assert!(deref("scope", first).unwrap().is(&scope));
        assert!(deref("object", first).is_none());
        assert!(token(&Cell::integer(3)).is_none());
    }

    #[test]
    fn test_dead_values_do_not_resolve() {
        let scope = Cell::Object(Scope::new(None));
        let token = token(&scope).unwrap();
        drop(scope);
        assert!(deref("object", token).is_none());
    }

    #[test]
    fn test_printed_form_round_trips() {
        let scope = Cell::Scope(Scope::new(None));
        let text = scope.to_string();
        let inner = text.trim_matches('%');
        let (tag, number) = inner.split_once(' ').unwrap();
        assert!(deref(tag, number.parse().unwrap()).unwrap().is(&scope));
    }
}
