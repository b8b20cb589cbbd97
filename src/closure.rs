//! Closures and bindings.
//!
//! A [`Closure`] is deferred code: an applier, a body, formal parameters and
//! the scope it was defined in. Its [`Flavor`] decides how the evaluator
//! prepares arguments before calling the applier. A [`Binding`] pairs a
//! closure with the receiver it was looked up through, or declares it
//! receiver-less.
//!
//! A closure only points weakly at its defining scope; the bindings that
//! carry it keep the scope alive. A binding stored in the very scope it
//! points at would make a cycle, so it is stored with weak anchors instead
//! and gets strong ones back whenever it is looked up through that scope.

use std::fmt;
use std::ptr;
use std::sync::{Arc, Weak};

use crate::Error;
use crate::cell::Cell;
use crate::continuation::Continuation;
use crate::evaluator::Machine;
use crate::scope::{Env, Scope};

/// How the evaluator treats the arguments of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Arguments are evaluated in a simple context and glob/tilde expanded.
    Builtin,
    /// Arguments are evaluated.
    Method,
    /// Arguments are passed unevaluated.
    Syntax,
}

/// Number of arguments an applier accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Range(usize, usize),
    Any,
}

impl Arity {
    pub fn validate(&self, got: usize) -> Result<(), Error> {
        match *self {
            Arity::Exact(n) if got != n => Err(Error::arity(n.to_string(), got)),
            Arity::AtLeast(n) if got < n => Err(Error::arity(format!("at least {n}"), got)),
            Arity::Range(min, max) if got < min || got > max => {
                Err(Error::arity(format!("{min} to {max}"), got))
            }
            _ => Ok(()),
        }
    }

    /// Arity implied by a formal parameter list such as `(a b . rest)`.
    pub fn of_params(params: &Cell) -> Result<Arity, Error> {
        let mut count = 0;
        let mut cursor = params.clone();
        while cursor.is_cons() {
            if cursor.head().as_symbol().is_none() {
                return Err(Error::syntax(format!("bad parameter list {params}")));
            }
            count += 1;
            cursor = cursor.tail();
        }
        match cursor {
            Cell::Symbol(_) => Ok(Arity::AtLeast(count)),
            _ if cursor.is_null() => Ok(Arity::Exact(count)),
            _ => Err(Error::syntax(format!("bad parameter list {params}"))),
        }
    }
}

/// Native implementation of a closure.
#[derive(Clone, Copy)]
pub enum Applier {
    /// A value computed from evaluated arguments.
    Function(fn(&[Cell]) -> Result<Cell, Error>),
    /// Code that drives the machine itself. Returns `true` when it has
    /// rearranged the control stack and the current frame must stay.
    Machine(fn(&mut Machine, &Binding, Cell) -> Result<bool, Error>),
}

pub struct Closure {
    applier: Applier,
    body: Cell,
    params: Cell,
    label: Option<Cell>,
    scope: Option<Weak<Scope>>,
    flavor: Flavor,
    arity: Arity,
    name: Option<Arc<str>>,
    handler: Option<Handler>,
}

/// Context captured by a `catch` handler.
pub struct Handler {
    /// Where control goes once the handler body finishes.
    pub escape: Arc<Continuation>,
    /// Dynamic frame the handler body runs under.
    pub frame: Arc<Env>,
}

impl Closure {
    /// A closure implemented in Rust.
    pub fn native(name: &str, flavor: Flavor, arity: Arity, applier: Applier) -> Closure {
        Closure {
            applier,
            body: Cell::null(),
            params: Cell::null(),
            label: None,
            scope: None,
            flavor,
            arity,
            name: Some(Arc::from(name)),
            handler: None,
        }
    }

    /// A closure written in the language.
    pub fn user(
        flavor: Flavor,
        params: Cell,
        label: Option<Cell>,
        body: Cell,
        scope: Arc<Scope>,
        applier: Applier,
    ) -> Result<Closure, Error> {
        let arity = Arity::of_params(&params)?;
        Ok(Closure {
            applier,
            body,
            params,
            label,
            scope: Some(Arc::downgrade(&scope)),
            flavor,
            arity,
            name: None,
            handler: None,
        })
    }

    pub fn with_handler(mut self, handler: Handler) -> Closure {
        self.handler = Some(handler);
        self
    }

    pub fn applier(&self) -> Applier {
        self.applier
    }

    pub fn body(&self) -> &Cell {
        &self.body
    }

    pub fn params(&self) -> &Cell {
        &self.params
    }

    pub fn label(&self) -> Option<&Cell> {
        self.label.as_ref()
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .field("params", &self.params)
            .finish()
    }
}

/// A scope held by a binding.
#[derive(Clone)]
enum Anchor {
    Strong(Arc<Scope>),
    Weak(Weak<Scope>),
}

impl Anchor {
    fn get(&self) -> Option<Arc<Scope>> {
        match self {
            Anchor::Strong(scope) => Some(scope.clone()),
            Anchor::Weak(scope) => scope.upgrade(),
        }
    }

    fn points_at(&self, scope: &Scope) -> bool {
        let target = match self {
            Anchor::Strong(held) => Arc::as_ptr(held),
            Anchor::Weak(held) => held.as_ptr(),
        };
        ptr::eq(target, scope)
    }

    fn is_weak(&self) -> bool {
        matches!(self, Anchor::Weak(_))
    }

    fn weakened_at(&self, scope: &Scope) -> Anchor {
        match self {
            Anchor::Strong(held) if self.points_at(scope) => Anchor::Weak(Arc::downgrade(held)),
            other => other.clone(),
        }
    }

    /// `None` once the scope is gone.
    fn strengthened(&self) -> Option<Anchor> {
        self.get().map(Anchor::Strong)
    }
}

/// A closure together with the receiver it acts on.
pub struct Binding {
    closure: Arc<Closure>,
    /// The closure's defining scope.
    home: Option<Anchor>,
    receiver: Option<Anchor>,
    bound: bool,
}

impl Binding {
    fn build(closure: Arc<Closure>, receiver: Option<Arc<Scope>>, bound: bool) -> Arc<Binding> {
        let home = closure
            .scope
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Anchor::Strong);
        Arc::new(Binding {
            closure,
            home,
            receiver: receiver.map(Anchor::Strong),
            bound,
        })
    }

    pub fn bound(closure: Arc<Closure>, receiver: Arc<Scope>) -> Arc<Binding> {
        Self::build(closure, Some(receiver), true)
    }

    pub fn unbound(closure: Arc<Closure>) -> Arc<Binding> {
        Self::build(closure, None, false)
    }

    pub fn closure(&self) -> &Arc<Closure> {
        &self.closure
    }

    pub fn receiver(&self) -> Option<Arc<Scope>> {
        self.receiver.as_ref().and_then(Anchor::get)
    }

    /// The scope the closure was defined in.
    pub fn scope(&self) -> Option<Arc<Scope>> {
        self.home.as_ref().and_then(Anchor::get)
    }

    fn is_weak(&self) -> bool {
        self.home.iter().chain(&self.receiver).any(Anchor::is_weak)
    }

    /// The same binding aimed at `receiver`. Unbound bindings and bindings
    /// already aimed there come back unchanged unless they were stored
    /// weakly, in which case they get strong anchors again.
    pub fn bind(self: &Arc<Self>, receiver: &Arc<Scope>) -> Arc<Binding> {
        let unchanged = self
            .receiver
            .as_ref()
            .is_some_and(|current| current.points_at(receiver));
        if (!self.bound || unchanged) && !self.is_weak() {
            return self.clone();
        }
        let receiver = if self.bound {
            Some(Anchor::Strong(receiver.clone()))
        } else {
            self.receiver.as_ref().and_then(Anchor::strengthened)
        };
        Arc::new(Binding {
            closure: self.closure.clone(),
            home: self.home.as_ref().and_then(Anchor::strengthened),
            receiver,
            bound: self.bound,
        })
    }

    /// The form in which this binding is kept inside `scope`: anchors
    /// pointing at `scope` itself become weak.
    pub fn stored_in(self: &Arc<Self>, scope: &Scope) -> Arc<Binding> {
        let strong_at = |anchor: &Option<Anchor>| {
            anchor
                .as_ref()
                .is_some_and(|anchor| !anchor.is_weak() && anchor.points_at(scope))
        };
        if !strong_at(&self.home) && !strong_at(&self.receiver) {
            return self.clone();
        }
        Arc::new(Binding {
            closure: self.closure.clone(),
            home: self.home.as_ref().map(|anchor| anchor.weakened_at(scope)),
            receiver: self.receiver.as_ref().map(|anchor| anchor.weakened_at(scope)),
            bound: self.bound,
        })
    }

    /// A copy holding its scopes strongly, for use outside the scope that
    /// stored it.
    pub fn owned(self: &Arc<Self>) -> Arc<Binding> {
        if !self.is_weak() {
            return self.clone();
        }
        Arc::new(Binding {
            closure: self.closure.clone(),
            home: self.home.as_ref().and_then(Anchor::strengthened),
            receiver: self.receiver.as_ref().and_then(Anchor::strengthened),
            bound: self.bound,
        })
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn noop(_: &[Cell]) -> Result<Cell, Error> {
        Ok(Cell::null())
    }

    fn params(text: &[&str]) -> Cell {
        Cell::list(text.iter().map(|name| Cell::symbol(name)).collect::<Vec<_>>())
    }

    #[test]
    fn test_arity_validation() {
        let cases = vec![
            (Arity::Exact(2), 2, true),
            (Arity::Exact(2), 1, false),
            (Arity::AtLeast(1), 0, false),
            (Arity::AtLeast(1), 5, true),
            (Arity::Range(1, 2), 3, false),
            (Arity::Range(1, 2), 2, true),
            (Arity::Any, 0, true),
        ];
        for (arity, got, ok) in cases {
            assert_eq!(arity.validate(got).is_ok(), ok, "{arity:?} with {got}");
        }
        let message = Arity::AtLeast(2).validate(1).unwrap_err().to_string();
        assert_eq!(message, "expected at least 2 arguments, got 1");
    }

    #[test]
    fn test_arity_of_params() {
        assert_eq!(Arity::of_params(&Cell::null()).unwrap(), Arity::Exact(0));
        assert_eq!(Arity::of_params(&params(&["a", "b"])).unwrap(), Arity::Exact(2));
        let rest = Cell::cons(Cell::symbol("a"), Cell::symbol("rest"));
        assert_eq!(Arity::of_params(&rest).unwrap(), Arity::AtLeast(1));
        assert_eq!(Arity::of_params(&Cell::symbol("all")).unwrap(), Arity::AtLeast(0));
        let bad = Cell::list(vec![Cell::string("a")]);
        assert!(matches!(Arity::of_params(&bad), Err(Error::Syntax(_))));
    }

    #[test]
    fn test_rebinding() {
        let applier = Applier::Function(noop);
        let closure = Arc::new(Closure::native("noop", Flavor::Method, Arity::Any, applier));
        let first = Scope::new(None);
        let second = Scope::new(None);

        let bound = Binding::bound(closure.clone(), first.clone());
        assert!(Arc::ptr_eq(&bound.bind(&first), &bound));
        let rebound = bound.bind(&second);
        assert!(!Arc::ptr_eq(&rebound, &bound));
        assert!(Arc::ptr_eq(&rebound.receiver().unwrap(), &second));

        let unbound = Binding::unbound(closure);
        assert!(Arc::ptr_eq(&unbound.bind(&second), &unbound));
        assert!(unbound.receiver().is_none());
    }

    fn method_in(scope: &Arc<Scope>) -> Arc<Binding> {
        let closure = Closure::user(
            Flavor::Method,
            Cell::null(),
            None,
            Cell::null(),
            scope.clone(),
            Applier::Function(noop),
        )
        .unwrap();
        Binding::bound(Arc::new(closure), scope.clone())
    }

    #[test]
    fn test_method_stored_in_its_own_scope_is_freed() {
        let scope = Scope::new(None);
        scope.define("m", Cell::Binding(method_in(&scope)));
        let watch = Arc::downgrade(&scope);
        drop(scope);
        assert!(watch.upgrade().is_none());
    }

    #[test]
    fn test_stored_binding_is_strong_again_when_read() {
        let scope = Scope::new(None);
        scope.define("m", Cell::Binding(method_in(&scope)));
        let Cell::Binding(stored) = scope.access("m").unwrap().get() else {
            panic!("not a binding");
        };
        let read = stored.bind(&scope);
        let watch = Arc::downgrade(&scope);
        drop(stored);
        drop(scope);
        // The binding read out keeps its defining scope alive.
        assert!(watch.upgrade().is_some());
        assert!(Arc::ptr_eq(&read.scope().unwrap(), &watch.upgrade().unwrap()));
        assert!(Arc::ptr_eq(&read.receiver().unwrap(), &read.scope().unwrap()));
        drop(read);
        assert!(watch.upgrade().is_none());
    }

    #[test]
    fn test_binding_kept_elsewhere_stays_strong() {
        let home = Scope::new(None);
        let elsewhere = Scope::new(None);
        let binding = method_in(&home);
        assert!(Arc::ptr_eq(&binding.stored_in(&elsewhere), &binding));
        assert!(!Arc::ptr_eq(&binding.stored_in(&home), &binding));
    }
}
