//! Environments and scopes.
//!
//! An [`Env`] is one table of name to [`Reference`], read-through chained to
//! an optional parent. A [`Scope`] layers a private `Env` over a public one
//! and links to the lexically enclosing scope. Dynamic variables live in a
//! separate chain of plain `Env` frames owned by the evaluator.
//!
//! Tables are individually locked so that tasks sharing a scope never corrupt
//! it, but nothing orders their updates; scripts coordinate through conduits.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::Error;
use crate::cell::Cell;

/// A cell as it is kept outside the scope that stored it.
fn owned(value: Cell) -> Cell {
    match value {
        Cell::Binding(binding) => Cell::Binding(binding.owned()),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Variable,
    /// Rejects rebinding.
    Constant,
    /// A variable that is also passed to external commands.
    Exported,
}

/// A mutable box holding one cell.
pub struct Reference {
    value: RwLock<Cell>,
    kind: RefKind,
}

impl Reference {
    pub fn new(value: Cell, kind: RefKind) -> Arc<Reference> {
        Arc::new(Reference {
            value: RwLock::new(value),
            kind,
        })
    }

    pub fn variable(value: Cell) -> Arc<Reference> {
        Self::new(value, RefKind::Variable)
    }

    pub fn constant(value: Cell) -> Arc<Reference> {
        Self::new(value, RefKind::Constant)
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn get(&self) -> Cell {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, value: Cell) -> Result<(), Error> {
        if self.kind == RefKind::Constant {
            return Err(Error::runtime("can't rebind a constant"));
        }
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
        Ok(())
    }
}

/// A single table layer.
#[derive(Default)]
pub struct Env {
    table: RwLock<HashMap<Arc<str>, Arc<Reference>>>,
    parent: Option<Arc<Env>>,
}

impl Env {
    pub fn new(parent: Option<Arc<Env>>) -> Arc<Env> {
        Arc::new(Env {
            table: RwLock::default(),
            parent,
        })
    }

    pub fn parent(&self) -> Option<&Arc<Env>> {
        self.parent.as_ref()
    }

    pub fn insert(&self, key: &str, reference: Arc<Reference>) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Arc::from(key), reference);
    }

    pub fn define(&self, key: &str, value: Cell) {
        self.insert(key, Reference::variable(value));
    }

    /// Looks in this layer only.
    pub fn own(&self, key: &str) -> Option<Arc<Reference>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Looks in this layer, then through its parents.
    pub fn access(&self, key: &str) -> Option<Arc<Reference>> {
        let mut env = Some(self);
        while let Some(current) = env {
            if let Some(reference) = current.own(key) {
                return Some(reference);
            }
            env = current.parent.as_deref();
        }
        None
    }

    pub fn remove(&self, key: &str) -> bool {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Keys defined in this layer, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|key| key.to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Same parent, fresh references holding the same cells.
    pub fn copy(&self) -> Arc<Env> {
        let table = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, reference)| {
                let value = owned(reference.get());
                (key.clone(), Reference::new(value, reference.kind()))
            })
            .collect();
        Arc::new(Env {
            table: RwLock::new(table),
            parent: self.parent.clone(),
        })
    }

    /// Exported variables visible from this frame, nearest definition first
    /// wins. Keys are returned without their `$` prefix.
    pub fn exported(&self) -> Vec<(String, String)> {
        let mut seen: HashMap<Arc<str>, String> = HashMap::new();
        let mut env = Some(self);
        while let Some(current) = env {
            let table = current.table.read().unwrap_or_else(PoisonError::into_inner);
            for (key, reference) in table.iter() {
                if reference.kind() == RefKind::Exported && !seen.contains_key(key) {
                    seen.insert(key.clone(), reference.get().raw());
                }
            }
            env = current.parent.as_deref();
        }
        let mut vars: Vec<_> = seen
            .into_iter()
            .map(|(key, value)| (key.trim_start_matches('$').to_string(), value))
            .collect();
        vars.sort();
        vars
    }
}

/// A lexical context: private definitions over public ones, linked to the
/// enclosing context.
pub struct Scope {
    private: Arc<Env>,
    public: Arc<Env>,
    prev: Option<Arc<Scope>>,
}

impl Scope {
    pub fn new(prev: Option<Arc<Scope>>) -> Arc<Scope> {
        Arc::new(Scope {
            private: Env::new(None),
            public: Env::new(None),
            prev,
        })
    }

    /// A scope whose layers read through to `parent`'s layers, sharing its
    /// enclosing context.
    pub fn inherit(parent: &Scope) -> Arc<Scope> {
        Arc::new(Scope {
            private: Env::new(Some(parent.private.clone())),
            public: Env::new(Some(parent.public.clone())),
            prev: parent.prev.clone(),
        })
    }

    pub fn prev(&self) -> Option<&Arc<Scope>> {
        self.prev.as_ref()
    }

    /// `value` as this scope keeps it. A binding pointing back at this scope
    /// holds it weakly.
    fn held(&self, value: Cell) -> Cell {
        match value {
            Cell::Binding(binding) => Cell::Binding(binding.stored_in(self)),
            other => other,
        }
    }

    pub fn define(&self, key: &str, value: Cell) {
        self.private.define(key, self.held(value));
    }

    pub fn public(&self, key: &str, value: Cell) {
        self.public.define(key, self.held(value));
    }

    pub fn constant(&self, key: &str, value: Cell) {
        self.public.insert(key, Reference::constant(self.held(value)));
    }

    /// Rebinds `key` in the nearest scope defining it. `None` when no scope
    /// on the chain does.
    pub fn assign(&self, key: &str, value: Cell) -> Option<Result<(), Error>> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(reference) = current.access_own(key) {
                return Some(reference.set(current.held(value)));
            }
            scope = current.prev.as_deref();
        }
        None
    }

    /// Private, then public, then the enclosing contexts.
    pub fn access(&self, key: &str) -> Option<Arc<Reference>> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(reference) = current.access_own(key) {
                return Some(reference);
            }
            scope = current.prev.as_deref();
        }
        None
    }

    /// Private then public, without the enclosing contexts.
    pub fn access_own(&self, key: &str) -> Option<Arc<Reference>> {
        self.private
            .access(key)
            .or_else(|| self.public.access(key))
    }

    /// What an outside observer of an object may see.
    pub fn access_public(&self, key: &str) -> Option<Arc<Reference>> {
        self.public.access(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.private.remove(key) || self.public.remove(key)
    }

    /// Everything defined directly in this scope, private names first.
    pub fn bindings(&self) -> Vec<(String, Cell)> {
        let mut bindings = Vec::new();
        for layer in [&self.private, &self.public] {
            for key in layer.keys() {
                if let Some(reference) = layer.own(&key) {
                    bindings.push((key, owned(reference.get())));
                }
            }
        }
        bindings
    }

    pub fn copy(&self) -> Arc<Scope> {
        Arc::new(Scope {
            private: self.private.copy(),
            public: self.public.copy(),
            prev: self.prev.clone(),
        })
    }
}
