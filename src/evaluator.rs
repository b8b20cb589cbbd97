//! The register machine.
//!
//! Evaluation never recurses on the host stack. Every pending phase lives on
//! the control stack as a [`Frame::Tag`]:
//!
//! - tags below [`SAVE_MAX`] are *save masks*; the frames directly beneath
//!   hold the registers named by the mask, and reaching the mask restores them
//! - tags at or above [`SAVE_MAX`] are *pseudo-states* naming an evaluation
//!   phase, dispatched by [`Machine::run`]
//!
//! Because all of a task's progress is on its stacks, a task can stop between
//! any two ticks and resume later by re-entering the loop, and a continuation
//! is nothing more than a copy of the two stacks.

use std::sync::{Arc, LazyLock};

use smallvec::SmallVec;
use tracing::{debug, instrument, trace};

use crate::Error;
use crate::cell::Cell;
use crate::closure::{Applier, Binding, Flavor};
use crate::continuation::Continuation;
use crate::expand;
use crate::interpreter::Runtime;
use crate::number;
use crate::process;
use crate::scope::{Env, RefKind, Reference, Scope};
use crate::stack::Stack;
use crate::task::Task;

pub(crate) mod forms;

pub type Tag = u32;

pub const SAVE_CAR_CODE: Tag = 1;
pub const SAVE_CDR_CODE: Tag = 2;
pub const SAVE_CODE: Tag = SAVE_CAR_CODE | SAVE_CDR_CODE;
pub const SAVE_DUMP: Tag = 4;
pub const SAVE_DYNAMIC: Tag = 8;
pub const SAVE_LEXICAL: Tag = 16;
pub const SAVE_MAX: Tag = 32;

pub const CHANGE_CONTEXT: Tag = SAVE_MAX;
pub const EVAL_ARGUMENTS: Tag = SAVE_MAX + 1;
pub const EVAL_ARGUMENTS_BUILTIN: Tag = SAVE_MAX + 2;
pub const EVAL_BLOCK: Tag = SAVE_MAX + 3;
pub const EVAL_COMMAND: Tag = SAVE_MAX + 4;
pub const EVAL_ELEMENT: Tag = SAVE_MAX + 5;
pub const EVAL_ELEMENT_BUILTIN: Tag = SAVE_MAX + 6;
pub const EVAL_MEMBER: Tag = SAVE_MAX + 7;
pub const EXEC_BUILTIN: Tag = SAVE_MAX + 8;
pub const EXEC_COMMAND: Tag = SAVE_MAX + 9;
pub const EXEC_DEFINE: Tag = SAVE_MAX + 10;
pub const EXEC_DYNAMIC: Tag = SAVE_MAX + 11;
pub const EXEC_IF: Tag = SAVE_MAX + 12;
pub const EXEC_METHOD: Tag = SAVE_MAX + 13;
pub const EXEC_OBJECT: Tag = SAVE_MAX + 14;
pub const EXEC_PUBLIC: Tag = SAVE_MAX + 15;
pub const EXEC_SET: Tag = SAVE_MAX + 16;
pub const EXEC_SETENV: Tag = SAVE_MAX + 17;
pub const EXEC_SPLICE: Tag = SAVE_MAX + 18;
pub const EXEC_SYNTAX: Tag = SAVE_MAX + 19;
pub const EXEC_WHILE_BODY: Tag = SAVE_MAX + 20;
pub const EXEC_WHILE_TEST: Tag = SAVE_MAX + 21;
pub const FATAL: Tag = SAVE_MAX + 22;
pub const RETURN: Tag = SAVE_MAX + 23;

/// Separates a call's evaluated arguments from what lies beneath them on the
/// operand stack. Recognized by identity.
static MARKER: LazyLock<Cell> = LazyLock::new(|| Cell::cons(Cell::null(), Cell::null()));

pub fn state_name(tag: Tag) -> &'static str {
    match tag {
        CHANGE_CONTEXT => "change-context",
        EVAL_ARGUMENTS => "eval-arguments",
        EVAL_ARGUMENTS_BUILTIN => "eval-arguments-builtin",
        EVAL_BLOCK => "eval-block",
        EVAL_COMMAND => "eval-command",
        EVAL_ELEMENT => "eval-element",
        EVAL_ELEMENT_BUILTIN => "eval-element-builtin",
        EVAL_MEMBER => "eval-member",
        EXEC_BUILTIN => "exec-builtin",
        EXEC_COMMAND => "exec-command",
        EXEC_DEFINE => "exec-define",
        EXEC_DYNAMIC => "exec-dynamic",
        EXEC_IF => "exec-if",
        EXEC_METHOD => "exec-method",
        EXEC_OBJECT => "exec-object",
        EXEC_PUBLIC => "exec-public",
        EXEC_SET => "exec-set",
        EXEC_SETENV => "exec-setenv",
        EXEC_SPLICE => "exec-splice",
        EXEC_SYNTAX => "exec-syntax",
        EXEC_WHILE_BODY => "exec-while-body",
        EXEC_WHILE_TEST => "exec-while-test",
        FATAL => "fatal",
        RETURN => "return",
        tag if tag < SAVE_MAX => "restore",
        _ => "unknown",
    }
}

/// What a conditional phase continues with when its test succeeds. The
/// clause runs as a block with a dynamic frame of its own.
fn consequent(tag: Tag) -> &'static [Tag] {
    match tag {
        EXEC_WHILE_BODY => &[EXEC_WHILE_TEST, SAVE_CODE, SAVE_DYNAMIC, EVAL_BLOCK],
        _ => &[SAVE_DYNAMIC, EVAL_BLOCK],
    }
}

/// One control stack entry.
#[derive(Clone)]
pub enum Frame {
    Tag(Tag),
    Code(Cell),
    Dump(Stack<Cell>),
    Dynamic(Arc<Env>),
    Lexical(Arc<Scope>),
}

/// The register set of one task.
#[derive(Clone)]
pub struct Registers {
    pub code: Cell,
    /// Operand stack.
    pub dump: Stack<Cell>,
    /// Control stack.
    pub stack: Stack<Frame>,
    pub lexical: Arc<Scope>,
    pub dynamic: Arc<Env>,
}

fn corrupt(expected: &str) -> Error {
    Error::internal(format!("control stack corrupted: expected saved {expected}"))
}

impl Registers {
    pub fn new(lexical: Arc<Scope>, dynamic: Arc<Env>) -> Self {
        Registers {
            code: Cell::null(),
            dump: Stack::new(),
            stack: Stack::new(),
            lexical,
            dynamic,
        }
    }

    pub fn push(&mut self, value: Cell) {
        self.dump.push(value);
    }

    pub fn pop(&mut self) -> Result<Cell, Error> {
        self.dump
            .pop()
            .ok_or_else(|| Error::internal("operand stack underflow"))
    }

    pub fn peek(&self) -> Result<Cell, Error> {
        self.dump
            .peek()
            .cloned()
            .ok_or_else(|| Error::internal("operand stack underflow"))
    }

    /// The tag on top of the control stack, if any.
    pub fn top(&self) -> Result<Option<Tag>, Error> {
        match self.stack.peek() {
            None => Ok(None),
            Some(Frame::Tag(tag)) => Ok(Some(*tag)),
            Some(_) => Err(Error::internal("saved register on top of control stack")),
        }
    }

    /// Pushes pseudo-states as they are and save masks together with the
    /// registers they name.
    pub fn new_states(&mut self, tags: &[Tag]) -> Result<(), Error> {
        for &tag in tags {
            if tag >= SAVE_MAX {
                self.stack.push(Frame::Tag(tag));
            } else {
                self.save_state(tag)?;
            }
        }
        Ok(())
    }

    fn save_state(&mut self, mask: Tag) -> Result<(), Error> {
        let mut saved = 0;
        if mask & SAVE_CODE != 0 {
            let code = match mask & SAVE_CODE {
                SAVE_CAR_CODE => self.code.car()?,
                SAVE_CDR_CODE => self.code.cdr()?,
                _ => self.code.clone(),
            };
            self.stack.push(Frame::Code(code));
            saved |= SAVE_CODE;
        }
        if mask & SAVE_DUMP != 0 {
            self.stack.push(Frame::Dump(self.dump.clone()));
            saved |= SAVE_DUMP;
        }
        if mask & SAVE_DYNAMIC != 0 {
            self.stack.push(Frame::Dynamic(self.dynamic.clone()));
            saved |= SAVE_DYNAMIC;
        }
        if mask & SAVE_LEXICAL != 0 {
            self.stack.push(Frame::Lexical(self.lexical.clone()));
            saved |= SAVE_LEXICAL;
        }
        self.stack.push(Frame::Tag(saved));
        Ok(())
    }

    /// Pushes `code` as the value a following code restore will produce.
    pub fn save_code(&mut self, code: Cell) {
        self.stack.push(Frame::Code(code));
        self.stack.push(Frame::Tag(SAVE_CODE));
    }

    pub fn restore_state(&mut self) -> Result<(), Error> {
        let mask = match self.stack.pop() {
            Some(Frame::Tag(mask)) if mask < SAVE_MAX => mask,
            _ => return Err(corrupt("mask")),
        };
        if mask & SAVE_LEXICAL != 0 {
            match self.stack.pop() {
                Some(Frame::Lexical(scope)) => self.lexical = scope,
                _ => return Err(corrupt("lexical scope")),
            }
        }
        if mask & SAVE_DYNAMIC != 0 {
            match self.stack.pop() {
                Some(Frame::Dynamic(env)) => self.dynamic = env,
                _ => return Err(corrupt("dynamic frame")),
            }
        }
        if mask & SAVE_DUMP != 0 {
            match self.stack.pop() {
                Some(Frame::Dump(dump)) => self.dump = dump,
                _ => return Err(corrupt("operand stack")),
            }
        }
        if mask & SAVE_CODE != 0 {
            match self.stack.pop() {
                Some(Frame::Code(code)) => self.code = code,
                _ => return Err(corrupt("code")),
            }
        }
        Ok(())
    }

    /// Pops exactly one frame, consuming the registers a mask recorded.
    pub fn remove_state(&mut self) -> Result<(), Error> {
        match self.stack.peek() {
            Some(Frame::Tag(tag)) if *tag < SAVE_MAX => self.restore_state(),
            Some(Frame::Tag(_)) => {
                self.stack.pop();
                Ok(())
            }
            _ => Err(Error::internal("no state to remove")),
        }
    }

    /// Finishes the current phase and continues as `tags`.
    pub fn replace_states(&mut self, tags: &[Tag]) -> Result<(), Error> {
        self.remove_state()?;
        self.new_states(tags)
    }

    /// Starts a dynamic frame for the block about to run. The enclosing
    /// frame must already be saved beneath it.
    pub fn open_frame(&mut self) {
        self.dynamic = Env::new(Some(self.dynamic.clone()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// An ordinary element.
    Element,
    /// An argument of a builtin: only atoms and pairs replace the symbol.
    Simple,
    /// A command head: unresolved names are external commands.
    Head,
}

/// A task's register set together with the collaborators it needs to run.
pub struct Machine {
    pub registers: Registers,
    task: Arc<Task>,
    runtime: Arc<Runtime>,
}

impl Machine {
    pub(crate) fn new(registers: Registers, task: Arc<Task>, runtime: Arc<Runtime>) -> Self {
        Machine {
            registers,
            task,
            runtime,
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn strict(&self) -> bool {
        self.task.strict()
    }

    /// Evaluates one top-level form as a block of its own, in a fresh
    /// dynamic frame. On failure every register is put back the way it was.
    pub fn evaluate(&mut self, form: Cell) -> Result<Cell, Error> {
        let saved = self.registers.clone();
        let result = self.start(form).and_then(|()| self.run());
        self.registers = saved;
        result
    }

    fn start(&mut self, form: Cell) -> Result<(), Error> {
        let registers = &mut self.registers;
        registers.dump = Stack::new();
        registers.stack = Stack::new();
        registers.code = Cell::list(vec![form]);
        registers.push(Cell::null());
        registers.new_states(&[SAVE_DYNAMIC, EVAL_BLOCK])?;
        registers.open_frame();
        Ok(())
    }

    /// Runs until the control stack is empty, returning the value left on the
    /// operand stack.
    #[instrument(level = "trace", skip(self), fields(task = self.task.id()))]
    pub fn run(&mut self) -> Result<Cell, Error> {
        loop {
            if !self.task.checkpoint() {
                self.registers.stack = Stack::new();
                return Err(Error::Terminated);
            }
            let Some(tag) = self.registers.top()? else {
                break;
            };
            trace!(state = state_name(tag), "tick");
            if let Err(error) = self.step(tag) {
                self.throw(error)?;
            }
        }
        Ok(self.registers.dump.peek().cloned().unwrap_or_else(Cell::null))
    }

    fn step(&mut self, tag: Tag) -> Result<(), Error> {
        if tag < SAVE_MAX {
            return self.registers.restore_state();
        }
        match tag {
            CHANGE_CONTEXT => self.change_context(),
            EVAL_ARGUMENTS => self.eval_arguments(EVAL_ARGUMENTS, EVAL_ELEMENT),
            EVAL_ARGUMENTS_BUILTIN => {
                self.eval_arguments(EVAL_ARGUMENTS_BUILTIN, EVAL_ELEMENT_BUILTIN)
            }
            EVAL_BLOCK => self.eval_block(),
            EVAL_COMMAND => self.eval_command(),
            EVAL_ELEMENT => self.eval_element(Lookup::Element),
            EVAL_ELEMENT_BUILTIN => self.eval_element(Lookup::Simple),
            EVAL_MEMBER => self.eval_member(),
            EXEC_BUILTIN => self.exec_applicative(true),
            EXEC_METHOD => self.exec_applicative(false),
            EXEC_SYNTAX => self.exec_syntax(),
            EXEC_COMMAND => self.exec_command(),
            EXEC_DEFINE | EXEC_PUBLIC | EXEC_DYNAMIC | EXEC_SETENV => self.exec_define(tag),
            EXEC_SET => self.exec_set(),
            EXEC_SPLICE => self.exec_splice(),
            EXEC_IF | EXEC_WHILE_BODY => self.exec_conditional(tag),
            EXEC_WHILE_TEST => self.exec_while_test(),
            EXEC_OBJECT => self.exec_object(),
            FATAL => self.exec_fatal(),
            RETURN => self.exec_return(),
            unknown => Err(Error::CommandNotFound(format!("state {unknown}"))),
        }
    }

    /// Routes a catchable error to the nearest user `throw` handler by
    /// rewriting the code register into a call of `throw`. Errors with no
    /// handler in reach are handed back to abort the run.
    fn throw(&mut self, error: Error) -> Result<(), Error> {
        if !error.is_catchable() {
            return Err(error);
        }
        let handled = self.registers.dynamic.access("throw").is_some_and(|reference| {
            matches!(
                reference.get(),
                Cell::Binding(binding) if binding.closure().handler().is_some()
            )
        });
        if !handled {
            return Err(error);
        }
        debug!(kind = error.kind(), %error, "routing error to handler");
        let message = match &error {
            Error::Thrown { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let call = Cell::list(vec![
            Cell::symbol("throw"),
            Cell::string(error.kind()),
            Cell::string(&message),
        ]);
        self.registers.code = Cell::list(vec![call]);
        self.registers.push(Cell::null());
        self.registers.new_states(&[EVAL_BLOCK])
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Reference>> {
        self.registers
            .lexical
            .access(name)
            .or_else(|| self.registers.dynamic.access(name))
    }

    fn rebind(&self, value: Cell) -> Cell {
        match value {
            Cell::Binding(binding) => Cell::Binding(binding.bind(&self.registers.lexical)),
            other => other,
        }
    }

    fn lookup(&mut self, symbol: &Cell, mode: Lookup) -> Result<(), Error> {
        let Some(name) = symbol.as_symbol() else {
            self.registers.push(symbol.clone());
            return Ok(());
        };
        let Some(reference) = self.resolve(name) else {
            if mode == Lookup::Head || number::is_numeric(name) || !self.strict() {
                self.registers.push(symbol.clone());
                return Ok(());
            }
            return Err(Error::Undefined(name.to_string()));
        };
        let value = reference.get();
        if mode == Lookup::Simple && !value.is_simple() {
            self.registers.push(symbol.clone());
            return Ok(());
        }
        let value = self.rebind(value);
        self.registers.push(value);
        Ok(())
    }

    pub(crate) fn check_target(&self, name: &str) -> Result<(), Error> {
        if self.strict() && number::is_numeric(name) {
            return Err(Error::syntax(format!("can't bind the number {name}")));
        }
        Ok(())
    }

    fn context_of(&self, target: &Cell) -> Result<Arc<Scope>, Error> {
        match target {
            Cell::Scope(scope) | Cell::Object(scope) => Ok(scope.clone()),
            Cell::String(_) | Cell::Symbol(_) => {
                let scope = Scope::new(Some(self.runtime.strings.clone()));
                scope.define("self", target.clone());
                Ok(scope)
            }
            other => Err(Error::type_error(format!("{other} has no members"))),
        }
    }

    fn change_context(&mut self) -> Result<(), Error> {
        let target = self.registers.peek()?;
        self.registers.lexical = self.context_of(&target)?;
        self.registers.remove_state()
    }

    fn eval_member(&mut self) -> Result<(), Error> {
        let target = self.registers.pop()?;
        let code = self.registers.code.clone();
        let key = code
            .as_symbol()
            .ok_or_else(|| Error::syntax(format!("bad member name {code}")))?;
        let lexical = &self.registers.lexical;
        let reference = match target {
            Cell::Object(_) => lexical.access_public(key),
            _ => lexical.access(key),
        };
        let reference = reference.ok_or_else(|| Error::Undefined(format!("{target}::{key}")))?;
        let value = self.rebind(reference.get());
        self.registers.push(value);
        self.registers.remove_state()
    }

    fn eval_block(&mut self) -> Result<(), Error> {
        let code = self.registers.code.clone();
        if !code.is_cons() || code.head().is_symbol("else") {
            return self.registers.remove_state();
        }
        self.registers.pop()?;
        self.registers
            .replace_states(&[EVAL_BLOCK, SAVE_CDR_CODE, EVAL_ELEMENT])?;
        self.registers.code = code.head();
        Ok(())
    }

    fn eval_element(&mut self, mode: Lookup) -> Result<(), Error> {
        let code = self.registers.code.clone();
        match &code {
            Cell::Pair(_) if code.is_null() => {
                self.registers.push(code);
                self.registers.remove_state()
            }
            Cell::Pair(_) => {
                let tail = code.tail();
                if !tail.is_pair() {
                    self.registers.replace_states(&[
                        SAVE_LEXICAL,
                        EVAL_MEMBER,
                        SAVE_CDR_CODE,
                        CHANGE_CONTEXT,
                        EVAL_ELEMENT,
                    ])?;
                    self.registers.code = code.head();
                } else if code.head().is_symbol("splice") {
                    self.registers.replace_states(&[EXEC_SPLICE, EVAL_ELEMENT])?;
                    self.registers.code = tail.head();
                } else {
                    self.registers.replace_states(&[EVAL_COMMAND])?;
                }
                Ok(())
            }
            Cell::Symbol(_) => {
                self.lookup(&code, mode)?;
                self.registers.remove_state()
            }
            _ => {
                self.registers.push(code);
                self.registers.remove_state()
            }
        }
    }

    fn eval_command(&mut self) -> Result<(), Error> {
        let code = self.registers.code.clone();
        let head = code.car()?;
        if head.as_symbol().is_some() {
            self.lookup(&head, Lookup::Head)?;
            self.registers.replace_states(&[EXEC_COMMAND])?;
            self.registers.code = code.tail();
        } else {
            self.registers
                .replace_states(&[EXEC_COMMAND, SAVE_CDR_CODE, EVAL_ELEMENT])?;
            self.registers.code = head;
        }
        Ok(())
    }

    fn exec_command(&mut self) -> Result<(), Error> {
        let head = self.registers.pop()?;
        let (exec, arguments) = match &head {
            Cell::Binding(binding) => match binding.closure().flavor() {
                Flavor::Builtin => (EXEC_BUILTIN, EVAL_ARGUMENTS_BUILTIN),
                Flavor::Method => (EXEC_METHOD, EVAL_ARGUMENTS),
                Flavor::Syntax => {
                    self.registers.push(head);
                    return self.registers.replace_states(&[EXEC_SYNTAX]);
                }
            },
            Cell::Continuation(_) => (EXEC_METHOD, EVAL_ARGUMENTS),
            Cell::Symbol(_) | Cell::String(_) => (EXEC_BUILTIN, EVAL_ARGUMENTS_BUILTIN),
            other => return Err(Error::runtime(format!("can't execute {other}"))),
        };
        self.registers.push(head);
        self.registers.push(MARKER.clone());
        self.registers.replace_states(&[exec, arguments])
    }

    fn eval_arguments(&mut self, state: Tag, element: Tag) -> Result<(), Error> {
        let code = self.registers.code.clone();
        if !code.is_cons() {
            return self.registers.remove_state();
        }
        self.registers
            .replace_states(&[state, SAVE_CDR_CODE, element])?;
        self.registers.code = code.head();
        Ok(())
    }

    /// Pops evaluated arguments down to the call marker.
    fn arguments(&mut self) -> Result<Cell, Error> {
        let mut args: SmallVec<[Cell; 8]> = SmallVec::new();
        loop {
            let value = self.registers.pop()?;
            if value.is(&MARKER) {
                break;
            }
            args.push(value);
        }
        args.reverse();
        Ok(Cell::list(args))
    }

    fn exec_applicative(&mut self, builtin: bool) -> Result<(), Error> {
        let args = self.arguments()?;
        let target = self.registers.pop()?;
        let args = if builtin { expand::expand(&args)? } else { args };
        self.registers.code = args.clone();
        match target {
            Cell::Binding(binding) => self.invoke(&binding, args),
            Cell::Continuation(_) => {
                self.registers.push(target);
                self.registers.replace_states(&[RETURN])
            }
            Cell::Symbol(_) | Cell::String(_) => {
                let status = self.external(&target, &args)?;
                self.registers.push(status);
                self.registers.remove_state()
            }
            other => Err(Error::runtime(format!("can't execute {other}"))),
        }
    }

    fn exec_syntax(&mut self) -> Result<(), Error> {
        let Cell::Binding(binding) = self.registers.pop()? else {
            return Err(Error::internal("syntax without a binding"));
        };
        let code = self.registers.code.clone();
        self.invoke(&binding, code)
    }

    fn invoke(&mut self, binding: &Arc<Binding>, args: Cell) -> Result<(), Error> {
        let closure = binding.closure().clone();
        closure.arity().validate(args.length())?;
        let more = match closure.applier() {
            Applier::Function(function) => {
                let values: SmallVec<[Cell; 8]> = args.iter().collect();
                self.registers.push(function(&values)?);
                false
            }
            Applier::Machine(applier) => applier(self, binding, args)?,
        };
        if !more {
            self.registers.remove_state()?;
        }
        Ok(())
    }

    fn external(&mut self, name: &Cell, args: &Cell) -> Result<Cell, Error> {
        let name = name.raw();
        let search = self
            .resolve("$PATH")
            .map(|reference| reference.get().raw())
            .or_else(|| std::env::var("PATH").ok());
        let path = process::search(&name, search.as_deref())
            .ok_or_else(|| Error::CommandNotFound(name.clone()))?;
        let argv: Vec<String> = args.iter().map(|arg| arg.raw()).collect();
        let attributes = process::Attributes {
            env: self.registers.dynamic.exported(),
            job: self.task.job().clone(),
            foreground: self.runtime.interactive && !self.task.is_background(),
        };
        let status = self.runtime.processes.execute(&path, &argv, &attributes)?;
        Ok(Cell::status(status))
    }

    fn exec_define(&mut self, tag: Tag) -> Result<(), Error> {
        let value = self.registers.pop()?;
        let code = self.registers.code.clone();
        let name = code
            .as_symbol()
            .ok_or_else(|| Error::syntax(format!("can't define {code}")))?;
        match tag {
            EXEC_DEFINE => self.registers.lexical.define(name, value.clone()),
            EXEC_PUBLIC => self.registers.lexical.public(name, value.clone()),
            EXEC_DYNAMIC => self.registers.dynamic.define(name, value.clone()),
            _ => {
                let key = format!("${}", name.trim_start_matches('$'));
                let text = Cell::string(&value.raw());
                self.registers
                    .dynamic
                    .insert(&key, Reference::new(text, RefKind::Exported));
            }
        }
        self.registers.push(value);
        self.registers.remove_state()
    }

    fn exec_set(&mut self) -> Result<(), Error> {
        let value = self.registers.pop()?;
        let target = self.registers.code.clone();
        if target.is_cons() {
            let object = self.registers.pop()?;
            let member = target.tail();
            let key = member
                .as_symbol()
                .ok_or_else(|| Error::syntax(format!("bad member name {member}")))?;
            let reference = match &object {
                Cell::Object(scope) => scope.access_public(key),
                Cell::Scope(scope) => scope.access(key),
                other => return Err(Error::type_error(format!("{other} has no members"))),
            };
            reference
                .ok_or_else(|| Error::Undefined(format!("{object}::{key}")))?
                .set(value.clone())?;
        } else {
            let key = target
                .as_symbol()
                .ok_or_else(|| Error::syntax(format!("can't set {target}")))?;
            match self.registers.lexical.assign(key, value.clone()) {
                Some(result) => result?,
                None => match self.registers.dynamic.access(key) {
                    Some(reference) => reference.set(value.clone())?,
                    None => self.registers.lexical.define(key, value.clone()),
                },
            }
        }
        self.registers.push(value);
        self.registers.remove_state()
    }

    fn exec_splice(&mut self) -> Result<(), Error> {
        let value = self.registers.pop()?;
        if value.is_pair() {
            for item in value.iter() {
                self.registers.push(item);
            }
        } else {
            self.registers.push(value);
        }
        self.registers.remove_state()
    }

    fn exec_conditional(&mut self, tag: Tag) -> Result<(), Error> {
        let test = self.registers.pop()?;
        if test.truthy() {
            self.registers.replace_states(consequent(tag))?;
            self.registers.open_frame();
            if tag == EXEC_WHILE_BODY {
                self.registers.code = self.registers.code.tail();
            }
            return Ok(());
        }
        if tag == EXEC_WHILE_BODY {
            return self.registers.remove_state();
        }

        // The skipped clause is a single atom or a run of commands. The
        // first atom after it must be `else`.
        let mut cursor = self.registers.code.clone();
        let mut skipped_atom = false;
        if cursor.is_cons() && !cursor.head().is_pair() && !cursor.head().is_symbol("else") {
            skipped_atom = true;
            cursor = cursor.tail();
        } else {
            while cursor.is_cons() && cursor.head().is_pair() {
                cursor = cursor.tail();
            }
        }
        if cursor.is_cons() {
            if !cursor.head().is_symbol("else") {
                return Err(Error::syntax(format!("expected 'else', found {}", cursor.head())));
            }
            let rest = cursor.tail();
            self.registers.code = if rest.head().is_symbol("if") {
                Cell::list(vec![rest])
            } else {
                rest
            };
            self.registers.replace_states(&[SAVE_DYNAMIC, EVAL_BLOCK])?;
            self.registers.open_frame();
            return Ok(());
        }
        if skipped_atom {
            return Err(Error::syntax("expected 'else'"));
        }
        self.registers.remove_state()
    }

    fn exec_while_test(&mut self) -> Result<(), Error> {
        let code = self.registers.code.clone();
        if !code.is_cons() {
            return Err(Error::syntax("while: missing test"));
        }
        self.registers
            .replace_states(&[EXEC_WHILE_BODY, SAVE_CODE, EVAL_ELEMENT])?;
        self.registers.code = code.head();
        Ok(())
    }

    fn exec_object(&mut self) -> Result<(), Error> {
        self.registers.pop()?;
        let object = Cell::Object(self.registers.lexical.clone());
        self.registers.push(object);
        self.registers.remove_state()
    }

    fn exec_fatal(&mut self) -> Result<(), Error> {
        let message = self.registers.pop()?;
        Err(Error::Fatal(message.raw()))
    }

    fn exec_return(&mut self) -> Result<(), Error> {
        let Cell::Continuation(continuation) = self.registers.pop()? else {
            return Err(Error::internal("return without a continuation"));
        };
        let args = self.registers.code.clone();
        let value = match args.length() {
            0 => Cell::null(),
            1 => args.head(),
            _ => args,
        };
        continuation.restore(&mut self.registers);
        self.registers.push(value);
        Ok(())
    }

    /// Starts `body` as a child task sharing this task's scopes and job.
    ///
    /// The child's dynamic chain starts below a frame that puts the default
    /// `throw` back, so handlers installed by this task never run on the
    /// child's stacks.
    pub(crate) fn spawn(&self, body: Cell) -> Result<Arc<Task>, Error> {
        let child = Task::child(&self.task);
        let boundary = Env::new(Some(self.registers.dynamic.clone()));
        if let Some(throw) = &self.runtime.throw {
            boundary.define("throw", throw.clone());
        }
        let mut registers = Registers::new(
            Scope::new(Some(self.registers.lexical.clone())),
            Env::new(Some(boundary)),
        );
        registers.code = body;
        registers.push(Cell::null());
        registers.new_states(&[EVAL_BLOCK])?;
        let mut machine = Machine::new(registers, child.clone(), self.runtime.clone());
        child.start(move || machine.run())?;
        Ok(child)
    }
}

/// Calls a closure written in the language.
///
/// The caller's lexical and dynamic registers are saved beneath a fresh
/// continuation that the body sees as `return`.
pub(crate) fn apply(machine: &mut Machine, binding: &Binding, args: Cell) -> Result<bool, Error> {
    let closure = binding.closure().clone();
    let caller = machine.registers.lexical.clone();
    let registers = &mut machine.registers;

    registers.replace_states(&[SAVE_DYNAMIC | SAVE_LEXICAL])?;
    let escape = Continuation::capture(registers);
    registers.new_states(&[EVAL_BLOCK])?;

    let scope = Scope::new(binding.scope());
    scope.public("return", Cell::Continuation(escape));
    if let Some(receiver) = binding.receiver() {
        scope.public("self", Cell::Scope(receiver));
    }
    if closure.flavor() == Flavor::Syntax
        && let Some(label) = closure.label().and_then(Cell::as_symbol)
    {
        scope.public(label, Cell::Scope(caller));
    }
    bind_params(&scope, closure.params(), args)?;

    registers.lexical = scope;
    registers.open_frame();
    registers.code = closure.body().clone();
    registers.push(Cell::null());
    Ok(true)
}

fn bind_params(scope: &Scope, params: &Cell, args: Cell) -> Result<(), Error> {
    let mut params = params.clone();
    let mut args = args;
    while params.is_cons() {
        let param = params.head();
        let name = param
            .as_symbol()
            .ok_or_else(|| Error::syntax(format!("bad parameter {param}")))?;
        scope.define(name, args.head());
        params = params.tail();
        args = args.tail();
    }
    if let Some(rest) = params.as_symbol() {
        scope.define(rest, args);
    }
    Ok(())
}
