//! Native closures installed into every interpreter.
//!
//! The catalogue is one registry of [`BuiltinOp`] values, built once. Each
//! entry names the closure, its [`Flavor`], its arity, its applier and where
//! the interpreter installs it:
//!
//! ```text
//! (add 1 2 3)            ; method, lexical root
//! (echo *.txt)           ; builtin: arguments are glob expanded
//! (if test a else b)     ; syntax: arguments arrive unevaluated
//! (path::split "/")      ; string member
//! (throw "kind" "why")   ; dynamic root, shadowed by `catch`
//! ```
//!
//! ## Functions vs Machine appliers
//!
//! - **Functions** compute a value from evaluated arguments and never touch
//!   the machine.
//! - **Machine appliers** drive the register machine themselves. All syntax
//!   is implemented this way, as is anything that needs the dynamic frame,
//!   the running task or the receiver.
//!
//! Arity is checked by the evaluator before any applier runs.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::Error;
use crate::cell::Cell;
use crate::closure::{Applier, Arity, Binding, Closure, Flavor};
use crate::conduit::Channel;
use crate::evaluator::{Machine, forms};
use crate::number;
use crate::scope::{Env, Scope};
use crate::DEFAULT_CHANNEL_CAPACITY;

/// Where the interpreter installs a native.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Root lexical scope, as a constant.
    Lexical,
    /// Root dynamic frame, where dynamic definitions can shadow it.
    Dynamic,
    /// Members of every string.
    Strings,
}

/// Definition of a native closure
#[derive(Clone, Copy)]
pub struct BuiltinOp {
    pub name: &'static str,
    pub flavor: Flavor,
    pub arity: Arity,
    pub applier: Applier,
    /// Whether calls see the scope the closure was reached through.
    pub bound: bool,
    pub placement: Placement,
}

impl std::fmt::Debug for BuiltinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinOp")
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .field("arity", &self.arity)
            .field("placement", &self.placement)
            .finish()
    }
}

impl BuiltinOp {
    fn closure(&self) -> Arc<Closure> {
        Arc::new(Closure::native(self.name, self.flavor, self.arity, self.applier))
    }
}

fn status(n: u8) -> Result<Cell, Error> {
    Ok(Cell::status(n))
}

//
// Arithmetic and ordering
//

fn builtin_add(args: &[Cell]) -> Result<Cell, Error> {
    args.iter()
        .try_fold(Cell::integer(0), |total, arg| number::add(&total, arg))
}

fn builtin_mul(args: &[Cell]) -> Result<Cell, Error> {
    args.iter()
        .try_fold(Cell::integer(1), |total, arg| number::multiply(&total, arg))
}

fn builtin_sub(args: &[Cell]) -> Result<Cell, Error> {
    match args {
        [only] => number::negate(only),
        [first, rest @ ..] => rest
            .iter()
            .try_fold(first.clone(), |total, arg| number::subtract(&total, arg)),
        [] => Err(Error::arity("at least 1", 0)),
    }
}

fn builtin_div(args: &[Cell]) -> Result<Cell, Error> {
    match args {
        [only] => number::reciprocal(only),
        [first, rest @ ..] => rest
            .iter()
            .try_fold(first.clone(), |total, arg| number::divide(&total, arg)),
        [] => Err(Error::arity("at least 1", 0)),
    }
}

fn builtin_mod(args: &[Cell]) -> Result<Cell, Error> {
    number::modulo(&args[0], &args[1])
}

/// True when every adjacent pair of arguments satisfies `test`.
fn chain(args: &[Cell], test: fn(Ordering) -> bool) -> Result<Cell, Error> {
    for pair in args.windows(2) {
        if !test(number::compare(&pair[0], &pair[1])?) {
            return Ok(Cell::boolean(false));
        }
    }
    Ok(Cell::boolean(true))
}

fn builtin_lt(args: &[Cell]) -> Result<Cell, Error> {
    chain(args, Ordering::is_lt)
}

fn builtin_le(args: &[Cell]) -> Result<Cell, Error> {
    chain(args, Ordering::is_le)
}

fn builtin_gt(args: &[Cell]) -> Result<Cell, Error> {
    chain(args, Ordering::is_gt)
}

fn builtin_ge(args: &[Cell]) -> Result<Cell, Error> {
    chain(args, Ordering::is_ge)
}

fn builtin_eq(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(args.windows(2).all(|pair| pair[0].equal(&pair[1]))))
}

fn builtin_ne(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(!args[0].equal(&args[1])))
}

fn builtin_is(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(args[0].is(&args[1])))
}

fn builtin_not(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(!args[0].truthy()))
}

//
// Conversions
//

fn builtin_integer(args: &[Cell]) -> Result<Cell, Error> {
    let whole = number::truncate(&args[0])?;
    Ok(Cell::integer(number::expect_i64(&whole)?))
}

fn builtin_float(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::float(number::to_float(&args[0])?))
}

fn builtin_rational(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::rational(number::expect_rational(&args[0])?))
}

fn builtin_status(args: &[Cell]) -> Result<Cell, Error> {
    let n = number::expect_i64(&args[0])?;
    let n = u8::try_from(n).map_err(|_| Error::runtime(format!("status {n} out of range")))?;
    status(n)
}

fn builtin_string(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::string(&args[0].raw()))
}

fn builtin_symbol(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::symbol(&args[0].raw()))
}

//
// Lists
//

fn builtin_cons(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::cons(args[0].clone(), args[1].clone()))
}

fn builtin_car(args: &[Cell]) -> Result<Cell, Error> {
    args[0].car()
}

fn builtin_cdr(args: &[Cell]) -> Result<Cell, Error> {
    args[0].cdr()
}

fn builtin_set_car(args: &[Cell]) -> Result<Cell, Error> {
    args[0].set_car(args[1].clone())?;
    Ok(args[1].clone())
}

fn builtin_set_cdr(args: &[Cell]) -> Result<Cell, Error> {
    args[0].set_cdr(args[1].clone())?;
    Ok(args[1].clone())
}

fn builtin_list(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::list(args.to_vec()))
}

fn builtin_reverse(args: &[Cell]) -> Result<Cell, Error> {
    Ok(args[0].reverse())
}

fn count(n: usize) -> Cell {
    Cell::integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn builtin_length(args: &[Cell]) -> Result<Cell, Error> {
    match &args[0] {
        Cell::Pair(_) => Ok(count(args[0].length())),
        Cell::String(text) | Cell::Symbol(text) => Ok(count(text.chars().count())),
        other => Err(Error::type_error(format!("{other} has no length"))),
    }
}

/// Copies every list but the last, which becomes the shared tail.
fn builtin_append(args: &[Cell]) -> Result<Cell, Error> {
    let Some((last, init)) = args.split_last() else {
        return Ok(Cell::null());
    };
    let mut items = Vec::new();
    for list in init {
        if !list.is_pair() {
            return Err(Error::type_error(format!("append: {list} is not a list")));
        }
        items.extend(list.iter());
    }
    Ok(items
        .into_iter()
        .rev()
        .fold(last.clone(), |tail, item| Cell::cons(item, tail)))
}

fn builtin_is_null(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(args[0].is_null()))
}

fn builtin_is_pair(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(args[0].is_cons()))
}

fn builtin_is_atom(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(args[0].is_atom()))
}

fn builtin_is_string(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(matches!(args[0], Cell::String(_))))
}

fn builtin_is_symbol(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::boolean(matches!(args[0], Cell::Symbol(_))))
}

fn builtin_is_number(args: &[Cell]) -> Result<Cell, Error> {
    let numeric = !matches!(args[0], Cell::Boolean(_)) && number::to_rational(&args[0]).is_some();
    Ok(Cell::boolean(numeric))
}

//
// Objects
//

fn scope_of(cell: &Cell) -> Result<&Arc<Scope>, Error> {
    match cell {
        Cell::Scope(scope) | Cell::Object(scope) => Ok(scope),
        other => Err(Error::type_error(format!("expected object, got {other}"))),
    }
}

fn builtin_child(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::Object(Scope::inherit(scope_of(&args[0])?)))
}

fn builtin_clone(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::Object(scope_of(&args[0])?.copy()))
}

fn builtin_expose(args: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::Object(scope_of(&args[0])?.clone()))
}

//
// Strings. The receiver is the scope the string's `self` lives in.
//

fn string_method(
    machine: &mut Machine,
    binding: &Binding,
    method: impl FnOnce(&str) -> Result<Cell, Error>,
) -> Result<bool, Error> {
    let text = binding
        .receiver()
        .and_then(|scope| scope.access("self"))
        .map(|reference| reference.get().raw())
        .ok_or_else(|| Error::type_error("string method called without a string"))?;
    machine.registers.push(method(&text)?);
    Ok(false)
}

fn string_length(machine: &mut Machine, binding: &Binding, _: Cell) -> Result<bool, Error> {
    string_method(machine, binding, |text| Ok(count(text.chars().count())))
}

fn string_upper(machine: &mut Machine, binding: &Binding, _: Cell) -> Result<bool, Error> {
    string_method(machine, binding, |text| Ok(Cell::string(&text.to_uppercase())))
}

fn string_lower(machine: &mut Machine, binding: &Binding, _: Cell) -> Result<bool, Error> {
    string_method(machine, binding, |text| Ok(Cell::string(&text.to_lowercase())))
}

fn string_trim(machine: &mut Machine, binding: &Binding, _: Cell) -> Result<bool, Error> {
    string_method(machine, binding, |text| Ok(Cell::string(text.trim())))
}

fn string_contains(machine: &mut Machine, binding: &Binding, args: Cell) -> Result<bool, Error> {
    let needle = args.head().raw();
    string_method(machine, binding, |text| Ok(Cell::boolean(text.contains(&needle))))
}

/// Splits on the given separator, or on whitespace.
fn string_split(machine: &mut Machine, binding: &Binding, args: Cell) -> Result<bool, Error> {
    let separator = args.is_cons().then(|| args.head().raw());
    string_method(machine, binding, |text| {
        let parts: Vec<Cell> = match &separator {
            Some(separator) if !separator.is_empty() => {
                text.split(separator.as_str()).map(Cell::string).collect()
            }
            _ => text.split_whitespace().map(Cell::string).collect(),
        };
        Ok(Cell::list(parts))
    })
}

/// Joins a list using the receiver as separator.
fn string_join(machine: &mut Machine, binding: &Binding, args: Cell) -> Result<bool, Error> {
    let items = args.head();
    string_method(machine, binding, |separator| {
        let parts: Vec<String> = items.iter().map(|item| item.raw()).collect();
        Ok(Cell::string(&parts.join(separator)))
    })
}

//
// Tasks, errors and exit
//

fn builtin_wait(machine: &mut Machine, _: &Binding, args: Cell) -> Result<bool, Error> {
    let task = machine.task().clone();
    let outcomes = if args.is_null() {
        task.wait_children()
    } else {
        let mut outcomes = Vec::new();
        for arg in args.iter() {
            let child = arg.as_task()?.clone();
            outcomes.push(child.wait());
            task.forget(&child);
        }
        outcomes
    };
    let value = match outcomes.into_iter().last() {
        None => Cell::status(0),
        Some(Ok(value)) => value,
        Some(Err(error)) => Cell::status(error.status()),
    };
    machine.registers.push(value);
    Ok(false)
}

fn builtin_suspend(args: &[Cell]) -> Result<Cell, Error> {
    args[0].as_task()?.suspend();
    status(0)
}

fn builtin_resume(args: &[Cell]) -> Result<Cell, Error> {
    args[0].as_task()?.resume();
    status(0)
}

fn builtin_stop(args: &[Cell]) -> Result<Cell, Error> {
    args[0].as_task()?.stop();
    status(0)
}

fn builtin_self_task(machine: &mut Machine, _: &Binding, _: Cell) -> Result<bool, Error> {
    machine.registers.push(Cell::Task(machine.task().clone()));
    Ok(false)
}

/// Default `throw`: reached only when no `catch` is in effect.
fn builtin_throw(args: &[Cell]) -> Result<Cell, Error> {
    Err(Error::Thrown {
        kind: args[0].raw(),
        message: args.get(1).map(Cell::raw).unwrap_or_default(),
    })
}

fn builtin_exit(args: &[Cell]) -> Result<Cell, Error> {
    let code = match args.first() {
        Some(code) => number::expect_i64(code)?,
        None => 0,
    };
    Err(Error::Exit(u8::try_from(code & 0xff).unwrap_or(u8::MAX)))
}

//
// Conduits
//

fn builtin_channel(args: &[Cell]) -> Result<Cell, Error> {
    let capacity = match args.first() {
        Some(size) => usize::try_from(number::expect_i64(size)?)
            .map_err(|_| Error::runtime(format!("bad channel capacity {size}")))?,
        None => DEFAULT_CHANNEL_CAPACITY,
    };
    Ok(Cell::Conduit(Channel::new(capacity)))
}

fn builtin_read(args: &[Cell]) -> Result<Cell, Error> {
    args[0].as_conduit()?.read()
}

fn builtin_readline(args: &[Cell]) -> Result<Cell, Error> {
    args[0].as_conduit()?.read_line()
}

fn builtin_write(args: &[Cell]) -> Result<Cell, Error> {
    let conduit = args[0].as_conduit()?;
    for value in &args[1..] {
        conduit.write(value.clone())?;
    }
    status(0)
}

fn builtin_close(args: &[Cell]) -> Result<Cell, Error> {
    args[0].as_conduit()?.close();
    status(0)
}

//
// Shell builtins
//

/// Writes its arguments as one line to the dynamic `_stdout_`.
fn builtin_echo(machine: &mut Machine, _: &Binding, args: Cell) -> Result<bool, Error> {
    let line = args.iter().map(|arg| arg.raw()).collect::<Vec<_>>().join(" ");
    let out = machine
        .resolve("_stdout_")
        .map(|reference| reference.get())
        .ok_or_else(|| Error::Undefined("_stdout_".to_string()))?;
    out.as_conduit()?.write(Cell::string(&line))?;
    machine.registers.push(Cell::status(0));
    Ok(false)
}

fn builtin_cd(args: &[Cell]) -> Result<Cell, Error> {
    let target = match args.first() {
        Some(dir) => dir.raw(),
        None => dirs::home_dir()
            .ok_or_else(|| Error::runtime("cd: no home directory"))?
            .display()
            .to_string(),
    };
    std::env::set_current_dir(&target).map_err(|e| Error::Io(format!("cd: {target}: {e}")))?;
    status(0)
}

fn builtin_pwd(_: &[Cell]) -> Result<Cell, Error> {
    Ok(Cell::string(&std::env::current_dir()?.display().to_string()))
}

/// Global registry of native closures.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    use Applier::{Function, Machine as Driver};
    use Flavor::{Builtin, Method, Syntax};
    use Placement::{Dynamic, Lexical, Strings};

    fn op(name: &'static str, flavor: Flavor, arity: Arity, applier: Applier) -> BuiltinOp {
        BuiltinOp {
            name,
            flavor,
            arity,
            applier,
            bound: false,
            placement: Lexical,
        }
    }

    fn string(
    name: &'static str,
    arity: Arity,
    applier: fn(&mut Machine, &Binding, Cell) -> Result<bool, Error>,
) -> BuiltinOp {
        BuiltinOp {
            bound: true,
            placement: Strings,
            ..op(name, Method, arity, Driver(applier))
        }
    }

    fn syntax(
    name: &'static str,
    applier: fn(&mut Machine, &Binding, Cell) -> Result<bool, Error>,
) -> BuiltinOp {
        op(name, Syntax, Arity::Any, Driver(applier))
    }

    vec![
        // Arithmetic and ordering
        op("add", Method, Arity::Any, Function(builtin_add)),
        op("sub", Method, Arity::AtLeast(1), Function(builtin_sub)),
        op("mul", Method, Arity::Any, Function(builtin_mul)),
        op("div", Method, Arity::AtLeast(1), Function(builtin_div)),
        op("mod", Method, Arity::Exact(2), Function(builtin_mod)),
        op("eq", Method, Arity::AtLeast(2), Function(builtin_eq)),
        op("ne", Method, Arity::Exact(2), Function(builtin_ne)),
        op("is", Method, Arity::Exact(2), Function(builtin_is)),
        op("lt", Method, Arity::AtLeast(2), Function(builtin_lt)),
        op("le", Method, Arity::AtLeast(2), Function(builtin_le)),
        op("gt", Method, Arity::AtLeast(2), Function(builtin_gt)),
        op("ge", Method, Arity::AtLeast(2), Function(builtin_ge)),
        op("not", Method, Arity::Exact(1), Function(builtin_not)),
        // Conversions
        op("integer", Method, Arity::Exact(1), Function(builtin_integer)),
        op("float", Method, Arity::Exact(1), Function(builtin_float)),
        op("rational", Method, Arity::Exact(1), Function(builtin_rational)),
        op("status", Method, Arity::Exact(1), Function(builtin_status)),
        op("string", Method, Arity::Exact(1), Function(builtin_string)),
        op("symbol", Method, Arity::Exact(1), Function(builtin_symbol)),
        // Lists
        op("cons", Method, Arity::Exact(2), Function(builtin_cons)),
        op("car", Method, Arity::Exact(1), Function(builtin_car)),
        op("cdr", Method, Arity::Exact(1), Function(builtin_cdr)),
        op("set-car", Method, Arity::Exact(2), Function(builtin_set_car)),
        op("set-cdr", Method, Arity::Exact(2), Function(builtin_set_cdr)),
        op("list", Method, Arity::Any, Function(builtin_list)),
        op("reverse", Method, Arity::Exact(1), Function(builtin_reverse)),
        op("length", Method, Arity::Exact(1), Function(builtin_length)),
        op("append", Method, Arity::Any, Function(builtin_append)),
        op("is-null", Method, Arity::Exact(1), Function(builtin_is_null)),
        op("is-pair", Method, Arity::Exact(1), Function(builtin_is_pair)),
        op("is-atom", Method, Arity::Exact(1), Function(builtin_is_atom)),
        op("is-string", Method, Arity::Exact(1), Function(builtin_is_string)),
        op("is-symbol", Method, Arity::Exact(1), Function(builtin_is_symbol)),
        op("is-number", Method, Arity::Exact(1), Function(builtin_is_number)),
        // Objects
        op("child", Method, Arity::Exact(1), Function(builtin_child)),
        op("clone", Method, Arity::Exact(1), Function(builtin_clone)),
        op("expose", Method, Arity::Exact(1), Function(builtin_expose)),
        BuiltinOp {
            bound: true,
            ..op("eval", Method, Arity::Exact(1), Driver(forms::eval))
        },
        // Strings
        string("length", Arity::Exact(0), string_length),
        string("split", Arity::Range(0, 1), string_split),
        string("join", Arity::Exact(1), string_join),
        string("upper", Arity::Exact(0), string_upper),
        string("lower", Arity::Exact(0), string_lower),
        string("trim", Arity::Exact(0), string_trim),
        string("contains", Arity::Exact(1), string_contains),
        // Syntax
        syntax("block", forms::block),
        syntax("quote", forms::quote),
        syntax("if", forms::if_),
        syntax("while", forms::while_),
        syntax("define", forms::define),
        syntax("public", forms::public),
        syntax("dynamic", forms::dynamic),
        syntax("setenv", forms::setenv),
        syntax("set", forms::set),
        syntax("method", forms::method),
        syntax("syntax", forms::syntax),
        syntax("builtin", forms::builtin),
        syntax("object", forms::object),
        syntax("catch", forms::catch),
        syntax("spawn", forms::spawn),
        // Tasks, errors and exit
        op("wait", Method, Arity::Any, Driver(builtin_wait)),
        op("suspend", Method, Arity::Exact(1), Function(builtin_suspend)),
        op("resume", Method, Arity::Exact(1), Function(builtin_resume)),
        op("stop", Method, Arity::Exact(1), Function(builtin_stop)),
        op("self-task", Method, Arity::Exact(0), Driver(builtin_self_task)),
        BuiltinOp {
            placement: Dynamic,
            ..op("throw", Method, Arity::Range(1, 2), Function(builtin_throw))
        },
        op("fatal", Method, Arity::Any, Driver(forms::fatal)),
        op("exit", Method, Arity::Range(0, 1), Function(builtin_exit)),
        // Conduits
        op("channel", Method, Arity::Range(0, 1), Function(builtin_channel)),
        op("read", Method, Arity::Exact(1), Function(builtin_read)),
        op("readline", Method, Arity::Exact(1), Function(builtin_readline)),
        op("write", Method, Arity::AtLeast(2), Function(builtin_write)),
        op("close", Method, Arity::Exact(1), Function(builtin_close)),
        // Shell builtins
        op("echo", Builtin, Arity::Any, Driver(builtin_echo)),
        op("cd", Builtin, Arity::Range(0, 1), Function(builtin_cd)),
        op("pwd", Builtin, Arity::Exact(0), Function(builtin_pwd)),
    ]
});

/// Lexical-root natives by name
static BUILTIN_INDEX: LazyLock<HashMap<&'static str, &'static BuiltinOp>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    ops.iter()
        .filter(|op| op.placement != Placement::Strings)
        .map(|op| (op.name, op))
        .collect()
});

pub fn builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Finds a native by name. String members are not included.
pub fn find_op(name: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_INDEX.get(name).copied()
}

/// Installs every native into the given root scopes.
pub fn install(root: &Arc<Scope>, dynamic: &Env, strings: &Arc<Scope>) {
    for op in builtin_ops() {
        let closure = op.closure();
        let target = match op.placement {
            Placement::Lexical => root,
            Placement::Strings => strings,
            Placement::Dynamic => {
                dynamic.define(op.name, Cell::Binding(Binding::unbound(closure)));
                continue;
            }
        };
        let binding = if op.bound {
            Binding::bound(closure, target.clone())
        } else {
            Binding::unbound(closure)
        };
        target.constant(op.name, Cell::Binding(binding));
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn sym(name: &str) -> Cell {
        Cell::symbol(name)
    }

    fn call_builtin(name: &str, args: &[Cell]) -> Result<Cell, Error> {
        let op = find_op(name).unwrap();
        op.arity.validate(args.len())?;
        match op.applier {
            Applier::Function(function) => function(args),
            Applier::Machine(_) => panic!("{name} drives the machine"),
        }
    }

    #[test]
    fn test_registry() {
        let add = find_op("add").unwrap();
        assert_eq!(add.flavor, Flavor::Method);
        assert_eq!(add.placement, Placement::Lexical);
        assert_eq!(find_op("if").unwrap().flavor, Flavor::Syntax);
        assert_eq!(find_op("echo").unwrap().flavor, Flavor::Builtin);
        assert_eq!(find_op("throw").unwrap().placement, Placement::Dynamic);
        assert!(find_op("eval").unwrap().bound);
        assert!(find_op("upper").is_none());
        assert!(find_op("unknown").is_none());

        let names: Vec<_> = builtin_ops().iter().map(|op| (op.name, op.placement)).collect();
        let mut unique = names.clone();
        unique.sort_by_key(|(name, placement)| (*name, *placement as u8));
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn test_install() {
        let root = Scope::new(None);
        let dynamic = Env::new(None);
        let strings = Scope::new(None);
        install(&root, &dynamic, &strings);

        assert!(root.access_public("add").is_some());
        assert!(root.access("throw").is_none());
        assert!(dynamic.access("throw").is_some());
        assert!(strings.access("upper").is_some());
        assert!(root.access("upper").is_none());

        let eval = root.access("eval").unwrap().get();
        let Cell::Binding(binding) = eval else { panic!("eval is not a binding") };
        assert!(Arc::ptr_eq(&binding.receiver().unwrap(), &root));
        assert!(root.access("add").unwrap().set(Cell::null()).is_err());
    }

    /// Macro to create test cases, invoking natives via the registry.
    macro_rules! test {
        ($name:expr, $args:expr, $expected:expr) => {
            ($name, call_builtin($name, $args), $expected)
        };
    }

    #[test]
    fn test_builtin_function_implementations() {
        type TestCase = (&'static str, Result<Cell, Error>, Option<&'static str>);

        let list = Cell::list(vec![Cell::integer(1), Cell::integer(2), Cell::integer(3)]);
        let pair = Cell::cons(Cell::integer(1), Cell::integer(2));

        let test_cases: Vec<TestCase> = vec![
            // Arithmetic
            test!("add", &[], Some("0")),
            test!("add", &[sym("1"), sym("2"), Cell::integer(3)], Some("6")),
            test!("add", &[sym("1/2"), sym("1/3")], Some("5/6")),
            test!("sub", &[Cell::integer(5)], Some("-5")),
            test!("sub", &[Cell::integer(10), sym("3"), sym("2")], Some("5")),
            test!("mul", &[sym("2"), sym("3"), sym("4")], Some("24")),
            test!("div", &[sym("1"), sym("4")], Some("1/4")),
            test!("div", &[sym("4")], Some("1/4")),
            test!("div", &[sym("1"), sym("0")], None),
            test!("mod", &[sym("17"), sym("5")], Some("2")),
            test!("add", &[sym("one"), sym("2")], None),
            // Ordering
            test!("lt", &[sym("1"), sym("2"), sym("3")], Some("#t")),
            test!("lt", &[sym("1"), sym("3"), sym("2")], Some("#f")),
            test!("le", &[sym("2"), sym("2")], Some("#t")),
            test!("gt", &[sym("b"), sym("a")], Some("#t")),
            test!("ge", &[Cell::string("10"), Cell::string("9")], Some("#f")),
            test!("eq", &[sym("2"), Cell::integer(2), sym("4/2")], Some("#t")),
            test!(
                "eq",
                &[list.clone(), Cell::list(vec![sym("1"), sym("2"), sym("3")])],
                Some("#t")
            ),
            test!("ne", &[sym("a"), sym("b")], Some("#t")),
            test!("is", &[list.clone(), list.clone()], Some("#t")),
            test!("not", &[Cell::status(1)], Some("#t")),
            test!("not", &[Cell::string("")], Some("#t")),
            test!("not", &[list.clone()], Some("#f")),
            // Conversions
            test!("integer", &[sym("7/2")], Some("3")),
            test!("integer", &[sym("-7/2")], Some("-3")),
            test!("float", &[sym("1/4")], Some("0.25")),
            test!("rational", &[sym("0.75")], Some("3/4")),
            test!("status", &[sym("3")], Some("3")),
            test!("status", &[sym("300")], None),
            test!("string", &[list.clone()], Some("\"(1 2 3)\"")),
            test!("symbol", &[Cell::string("abc")], Some("abc")),
            // Lists
            test!("cons", &[sym("a"), Cell::null()], Some("(a)")),
            test!("car", &[list.clone()], Some("1")),
            test!("cdr", &[pair.clone()], Some("2")),
            test!("car", &[sym("atom")], None),
            test!("list", &[], Some("()")),
            test!("reverse", &[list.clone()], Some("(3 2 1)")),
            test!("length", &[list.clone()], Some("3")),
            test!("length", &[Cell::string("héllo")], Some("5")),
            test!("length", &[Cell::integer(3)], None),
            test!("append", &[list.clone(), list.clone()], Some("(1 2 3 1 2 3)")),
            test!("append", &[list.clone(), sym("x")], Some("(1 2 3 . x)")),
            test!("append", &[], Some("()")),
            test!("append", &[sym("x"), list.clone()], None),
            test!("is-null", &[Cell::null()], Some("#t")),
            test!("is-pair", &[Cell::null()], Some("#f")),
            test!("is-pair", &[pair.clone()], Some("#t")),
            test!("is-atom", &[sym("x")], Some("#t")),
            test!("is-string", &[Cell::string("x")], Some("#t")),
            test!("is-symbol", &[Cell::string("x")], Some("#f")),
            test!("is-number", &[sym("12")], Some("#t")),
            test!("is-number", &[Cell::boolean(true)], Some("#f")),
            // Errors and exit
            test!("exit", &[sym("3")], None),
            test!("throw", &[Cell::string("k"), Cell::string("m")], None),
            // Arity
            test!("cons", &[sym("a")], None),
            test!("not", &[], None),
        ];

        for (name, result, expected) in test_cases {
            match expected {
                Some(text) => assert_eq!(
                    result.as_ref().map(ToString::to_string).map_err(ToString::to_string),
                    Ok(text.to_string()),
                    "{name}"
                ),
                None => assert!(result.is_err(), "{name} should fail, got {result:?}"),
            }
        }
    }

    #[test]
    fn test_set_car_mutates_in_place() {
        let list = Cell::list(vec![sym("a"), sym("b")]);
        call_builtin("set-car", &[list.clone(), sym("z")]).unwrap();
        call_builtin("set-cdr", &[list.clone(), Cell::null()]).unwrap();
        assert_eq!(list.to_string(), "(z)");
        assert!(call_builtin("set-car", &[Cell::null(), sym("z")]).is_err());
    }

    #[test]
    fn test_exit_and_throw_errors() {
        assert!(matches!(call_builtin("exit", &[]), Err(Error::Exit(0))));
        assert!(matches!(call_builtin("exit", &[sym("258")]), Err(Error::Exit(2))));
        let Err(Error::Thrown { kind, message }) = call_builtin("throw", &[Cell::string("io")])
        else {
            panic!("expected thrown error");
        };
        assert_eq!((kind.as_str(), message.as_str()), ("io", ""));
    }

    #[test]
    fn test_channel_natives() {
        let channel = call_builtin("channel", &[sym("2")]).unwrap();
        call_builtin("write", &[channel.clone(), sym("a"), Cell::string("b")]).unwrap();
        call_builtin("close", &[channel.clone()]).unwrap();
        assert_eq!(call_builtin("read", &[channel.clone()]).unwrap().to_string(), "a");
        assert_eq!(call_builtin("readline", &[channel.clone()]).unwrap().raw(), "b");
        assert!(call_builtin("read", &[channel]).unwrap().is_null());
        assert!(call_builtin("read", &[sym("x")]).is_err());
    }

    #[test]
    fn test_objects() {
        let scope = Scope::new(None);
        scope.public("a", Cell::integer(1));
        let object = Cell::Object(scope.clone());
        let copy = call_builtin("clone", &[object.clone()]).unwrap();
        let child = call_builtin("child", &[object.clone()]).unwrap();
        scope.public("a", Cell::integer(2));
        let read = |cell: &Cell| {
            let reference = scope_of(cell).unwrap().access_public("a").unwrap();
            reference.get().to_string()
        };
        assert_eq!(read(&copy), "1");
        assert_eq!(read(&child), "2");
        let exposed = call_builtin("expose", &[Cell::Scope(scope.clone())]).unwrap();
        assert!(matches!(exposed, Cell::Object(_)));
        assert!(call_builtin("clone", &[sym("x")]).is_err());
    }
}
