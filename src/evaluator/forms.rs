//! Native syntax.
//!
//! Each form receives its arguments unevaluated in the code register and
//! rearranges the control stack to evaluate what it needs. Forms that finish
//! immediately push their value and return `false`.

use std::sync::Arc;

use super::*;
use crate::closure::{Closure, Handler};

pub(crate) fn block(machine: &mut Machine, _: &Binding, _: Cell) -> Result<bool, Error> {
    let registers = &mut machine.registers;
    registers.replace_states(&[SAVE_LEXICAL | SAVE_DYNAMIC, EVAL_BLOCK])?;
    registers.lexical = Scope::new(Some(registers.lexical.clone()));
    registers.open_frame();
    registers.push(Cell::null());
    Ok(true)
}

pub(crate) fn quote(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    machine.registers.push(code.head());
    Ok(false)
}

pub(crate) fn if_(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    if !code.is_cons() {
        return Err(Error::syntax("if: missing test"));
    }
    let registers = &mut machine.registers;
    registers.push(Cell::null());
    registers.replace_states(&[EXEC_IF, SAVE_CDR_CODE, EVAL_ELEMENT])?;
    registers.code = code.head();
    Ok(true)
}

pub(crate) fn while_(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    if !code.is_cons() {
        return Err(Error::syntax("while: missing test"));
    }
    machine.registers.push(Cell::null());
    machine.registers.replace_states(&[EXEC_WHILE_TEST])?;
    Ok(true)
}

pub(crate) fn define(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    definition(machine, code, EXEC_DEFINE)
}

pub(crate) fn public(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    definition(machine, code, EXEC_PUBLIC)
}

pub(crate) fn dynamic(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    definition(machine, code, EXEC_DYNAMIC)
}

pub(crate) fn setenv(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    definition(machine, code, EXEC_SETENV)
}

/// `NAME = EXPR`, or `NAME as PARAMS BODY...` for a method.
fn definition(machine: &mut Machine, code: Cell, state: Tag) -> Result<bool, Error> {
    let target = code.head();
    let name = target
        .as_symbol()
        .ok_or_else(|| Error::syntax(format!("can't define {target}")))?;
    machine.check_target(name)?;

    let rest = code.tail();
    let operator = rest.head();
    if operator.is_symbol("=") {
        let value = rest.tail();
        if !value.is_cons() || value.tail().is_cons() {
            return Err(Error::syntax(format!("expected one value after '{name} ='")));
        }
        let registers = &mut machine.registers;
        registers.replace_states(&[state, SAVE_CAR_CODE, EVAL_ELEMENT])?;
        registers.code = value.head();
        Ok(true)
    } else if operator.is_symbol("as") && state != EXEC_SETENV {
        let shorthand = rest.tail();
        let lexical = machine.registers.lexical.clone();
        let closure = Closure::user(
            Flavor::Method,
            shorthand.head(),
            None,
            shorthand.tail(),
            lexical.clone(),
            Applier::Machine(apply),
        )?;
        let registers = &mut machine.registers;
        registers.push(Cell::Binding(Binding::bound(Arc::new(closure), lexical)));
        registers.replace_states(&[state, SAVE_CAR_CODE])?;
        Ok(true)
    } else {
        Err(Error::syntax(format!("expected '=' after {name}")))
    }
}

/// `NAME = EXPR` or `(OBJECT . MEMBER) = EXPR`.
pub(crate) fn set(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    let target = code.head();
    let rest = code.tail();
    if !rest.head().is_symbol("=") || !rest.tail().is_cons() {
        return Err(Error::syntax(format!("expected '=' after {target}")));
    }
    let expr = rest.tail().head();

    if target.is_cons() && !target.tail().is_pair() {
        let registers = &mut machine.registers;
        registers.replace_states(&[EXEC_SET])?;
        registers.save_code(target.clone());
        registers.new_states(&[EVAL_ELEMENT])?;
        registers.save_code(expr);
        registers.new_states(&[EVAL_ELEMENT])?;
        registers.code = target.head();
        return Ok(true);
    }

    let name = target
        .as_symbol()
        .ok_or_else(|| Error::syntax(format!("can't set {target}")))?;
    machine.check_target(name)?;
    let registers = &mut machine.registers;
    registers.replace_states(&[EXEC_SET, SAVE_CAR_CODE, EVAL_ELEMENT])?;
    registers.code = expr;
    Ok(true)
}

pub(crate) fn method(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    closure_form(machine, code, Flavor::Method)
}

pub(crate) fn syntax(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    closure_form(machine, code, Flavor::Syntax)
}

pub(crate) fn builtin(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    closure_form(machine, code, Flavor::Builtin)
}

/// `PARAMS [LABEL] = BODY...`. Only syntax takes a label: the name its body
/// uses for the caller's scope.
fn closure_form(machine: &mut Machine, code: Cell, flavor: Flavor) -> Result<bool, Error> {
    let params = code.head();
    let mut rest = code.tail();
    let mut label = None;
    let labelled = !rest.head().is_symbol("=") && rest.head().as_symbol().is_some();
    if flavor == Flavor::Syntax && labelled {
        label = Some(rest.head());
        rest = rest.tail();
    }
    if !rest.head().is_symbol("=") {
        return Err(Error::syntax(format!("expected '=' after {params}")));
    }
    let lexical = machine.registers.lexical.clone();
    let closure = Closure::user(
        flavor,
        params,
        label,
        rest.tail(),
        lexical.clone(),
        Applier::Machine(apply),
    )?;
    machine
        .registers
        .push(Cell::Binding(Binding::bound(Arc::new(closure), lexical)));
    Ok(false)
}

pub(crate) fn object(machine: &mut Machine, _: &Binding, _: Cell) -> Result<bool, Error> {
    let registers = &mut machine.registers;
    registers.replace_states(&[SAVE_LEXICAL | SAVE_DYNAMIC, EXEC_OBJECT, EVAL_BLOCK])?;
    registers.lexical = Scope::new(Some(registers.lexical.clone()));
    registers.open_frame();
    registers.push(Cell::null());
    Ok(true)
}

pub(crate) fn spawn(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    let task = machine.spawn(code)?;
    machine.registers.push(Cell::Task(task));
    Ok(false)
}

/// `catch NAME BODY...` installs a `throw` handler in the dynamic frame of
/// the enclosing block. Every block opens a frame of its own, so the handler
/// lives exactly as long as the block. When an error is routed to it,
/// control leaves the block and the block's value becomes the value of
/// `BODY`, evaluated with `NAME` bound to an object exposing `kind` and
/// `message`.
pub(crate) fn catch(machine: &mut Machine, _: &Binding, code: Cell) -> Result<bool, Error> {
    let name = code.head();
    if name.as_symbol().is_none() {
        return Err(Error::syntax(format!("catch: bad name {name}")));
    }
    let registers = &machine.registers;
    let below = registers
        .stack
        .below(|frame| matches!(frame, Frame::Tag(EVAL_BLOCK)))
        .ok_or_else(|| Error::syntax("catch outside of a block"))?;
    let escape = Continuation::from_parts(registers.dump.clone(), below);
    let frame = registers
        .dynamic
        .parent()
        .cloned()
        .unwrap_or_else(|| registers.dynamic.clone());

    let params = Cell::list(vec![Cell::symbol("kind"), Cell::symbol("message")]);
    let closure = Closure::user(
        Flavor::Method,
        params,
        Some(name),
        code.tail(),
        registers.lexical.clone(),
        Applier::Machine(handle),
    )?
    .with_handler(Handler { escape, frame });

    machine
        .registers
        .dynamic
        .define("throw", Cell::Binding(Binding::unbound(Arc::new(closure))));
    machine.registers.push(Cell::null());
    Ok(false)
}

fn handle(machine: &mut Machine, binding: &Binding, args: Cell) -> Result<bool, Error> {
    let closure = binding.closure().clone();
    let (Some(handler), Some(scope)) = (closure.handler(), binding.scope()) else {
        return Err(Error::internal("handler without catch context"));
    };
    let kind = args.head();
    let message = args.tail().head();
    let exception = Scope::new(None);
    exception.public("kind", kind.clone());
    exception.public("message", message.clone());

    let registers = &mut machine.registers;
    handler.escape.restore(registers);
    registers.lexical = scope.clone();
    registers.dynamic = handler.frame.clone();
    registers.new_states(&[SAVE_LEXICAL | SAVE_DYNAMIC, EVAL_BLOCK])?;

    let local = Scope::new(Some(scope.clone()));
    if let Some(name) = closure.label().and_then(Cell::as_symbol) {
        local.define(name, Cell::Object(exception));
    }
    local.define("kind", kind);
    local.define("message", message);
    registers.lexical = local;
    registers.dynamic = Env::new(Some(handler.frame.clone()));
    registers.code = closure.body().clone();
    registers.push(Cell::null());
    Ok(true)
}

/// Evaluates a form in the receiver's scope.
pub(crate) fn eval(machine: &mut Machine, binding: &Binding, args: Cell) -> Result<bool, Error> {
    let registers = &mut machine.registers;
    registers.replace_states(&[SAVE_LEXICAL, EVAL_ELEMENT])?;
    if let Some(receiver) = binding.receiver() {
        registers.lexical = receiver;
    }
    registers.code = args.head();
    Ok(true)
}

pub(crate) fn fatal(machine: &mut Machine, _: &Binding, args: Cell) -> Result<bool, Error> {
    let message = args.iter().map(|arg| arg.raw()).collect::<Vec<_>>().join(" ");
    machine.registers.push(Cell::string(&message));
    machine.registers.replace_states(&[FATAL])?;
    Ok(true)
}

#[cfg(all(test, feature = "reader"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use crate::interpreter::Interpreter;

    fn eval(source: &str) -> String {
        let mut interpreter = Interpreter::new();
        interpreter.eval_str(source).unwrap().to_string()
    }

    #[test]
    fn test_block_scopes_definitions() {
        assert_eq!(eval("(define x = 1) (block (define x = 2) x)"), "2");
        assert_eq!(eval("(define x = 1) (block (define x = 2)) x"), "1");
        assert_eq!(eval("(block)"), "()");
    }

    #[test]
    fn test_definition_shapes() {
        assert_eq!(eval("(define sq as (n) (mul n n)) (sq 7)"), "49");
        assert_eq!(eval("(define f = (method (a . rest) = rest)) (f 1 2 3)"), "(2 3)");
        let mut interpreter = Interpreter::new();
        assert!(matches!(
            interpreter.eval_str("(define x 1)"),
            Err(crate::Error::Syntax(_))
        ));
    }

    #[test]
    fn test_syntax_label_sees_caller() {
        let source = "
            (define unless = (syntax (test . body) caller =
                (if (caller::eval test) () else (caller::eval (cons block body)))))
            (define n = 5)
            (unless (lt n 3) (add n 1))";
        assert_eq!(eval(source), "6");
    }

    #[test]
    fn test_catch_names_exception() {
        let source = r#"
            (define f as ()
                (catch e (list e::kind e::message))
                (throw "oops" "went wrong")
                never)
            (f)"#;
        assert_eq!(eval(source), r#"("oops" "went wrong")"#);
    }
}
