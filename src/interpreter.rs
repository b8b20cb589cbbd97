//! Interpreter setup and the public evaluation entry points.
//!
//! An [`Interpreter`] owns the root task and its register machine. The
//! lexical chain it builds looks like this:
//!
//! ```text
//!   user global  ->  natives (constants: builtins, true, false)
//! ```
//!
//! and the root dynamic frame carries the process environment (as exported
//! `$NAME` variables), the three standard streams and the default `throw`.

use std::sync::Arc;

use tracing::debug;

use crate::cell::Cell;
use crate::conduit::Stream;
use crate::evaluator::{Machine, Registers};
use crate::process::{Processes, System};
use crate::scope::{Env, RefKind, Reference, Scope};
use crate::task::{Task, Worker};
use crate::{DEFAULT_QUEUE_CAPACITY, Error, builtinops};

/// Interpreter options, normally filled in from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reject unresolved names and numeric binding targets.
    pub strict: bool,
    /// Input queue size of tasks created by [`Interpreter::worker`].
    pub queue_capacity: usize,
    /// Published as `_0_`.
    pub script_name: String,
    /// Published as `_args_`.
    pub args: Vec<String>,
    /// Foreground commands get the controlling terminal. Only set this when
    /// terminal job-control signals are ignored.
    pub interactive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            strict: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            script_name: "cellsh".to_string(),
            args: Vec::new(),
            interactive: false,
        }
    }
}

/// State shared by every machine of one interpreter.
pub(crate) struct Runtime {
    pub(crate) processes: Arc<dyn Processes>,
    /// Methods available on symbols and strings.
    pub(crate) strings: Arc<Scope>,
    /// The root frame's `throw`, which reports errors instead of handling them.
    pub(crate) throw: Option<Cell>,
    pub(crate) interactive: bool,
}

pub struct Interpreter {
    machine: Machine,
    config: Config,
    global: Arc<Scope>,
    root_env: Arc<Env>,
    runtime: Arc<Runtime>,
    /// Process group that owned the terminal when the interpreter started.
    terminal: Option<i32>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_processes(config, Arc::new(System))
    }

    /// An interpreter whose external commands and job signals go through
    /// `processes`.
    pub fn with_processes(config: Config, processes: Arc<dyn Processes>) -> Self {
        let natives = Scope::new(None);
        natives.constant("true", Cell::boolean(true));
        natives.constant("false", Cell::boolean(false));
        let strings = Scope::new(None);
        let root_env = Env::new(None);
        builtinops::install(&natives, &root_env, &strings);

        for (key, value) in std::env::vars() {
            root_env.insert(
                &format!("${key}"),
                Reference::new(Cell::string(&value), RefKind::Exported),
            );
        }
        root_env.define("_stdin_", Cell::Conduit(Arc::new(Stream::Stdin)));
        root_env.define("_stdout_", Cell::Conduit(Arc::new(Stream::Stdout)));
        root_env.define("_stderr_", Cell::Conduit(Arc::new(Stream::Stderr)));

        let global = Scope::new(Some(natives));
        global.define("_0_", Cell::string(&config.script_name));
        global.define(
            "_args_",
            Cell::list(config.args.iter().map(|arg| Cell::string(arg)).collect::<Vec<_>>()),
        );

        let terminal = config.interactive.then(|| processes.foreground()).flatten();
        let runtime = Arc::new(Runtime {
            processes: processes.clone(),
            strings,
            throw: root_env.own("throw").map(|reference| reference.get()),
            interactive: config.interactive,
        });
        let task = Task::new(config.strict, processes);
        debug!(task = task.id(), strict = config.strict, "interpreter ready");
        let registers = Registers::new(global.clone(), root_env.clone());
        Interpreter {
            machine: Machine::new(registers, task, runtime.clone()),
            config,
            global,
            root_env,
            runtime,
            terminal,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The root task. Job control applied to it reaches everything the
    /// interpreter has spawned.
    pub fn task(&self) -> &Arc<Task> {
        self.machine.task()
    }

    /// The scope top-level definitions land in.
    pub fn root(&self) -> &Arc<Scope> {
        &self.global
    }

    /// Evaluates one form at top level.
    pub fn eval(&mut self, form: Cell) -> Result<Cell, Error> {
        let result = self.machine.evaluate(form);
        self.reclaim_terminal();
        result
    }

    /// Parses `text` and evaluates each form in turn, returning the value of
    /// the last one. Stops at the first error.
    #[cfg(feature = "reader")]
    pub fn eval_str(&mut self, text: &str) -> Result<Cell, Error> {
        let mut value = Cell::null();
        for (form, _) in crate::reader::parse_all(text)? {
            value = self.eval(form)?;
        }
        Ok(value)
    }

    /// Runs a whole script. Failing forms are reported as `name:line:
    /// message` on stderr and the script carries on with the next form;
    /// `exit` and `fatal` end it. Returns the status of the last form.
    #[cfg(feature = "reader")]
    pub fn run_source(&mut self, name: &str, text: &str) -> u8 {
        let mut status = 0;
        let parsed = crate::reader::parse(text, |form, line| match self.eval(form) {
            Ok(value) => {
                status = status_of(&value);
                true
            }
            Err(error) => {
                status = error.status();
                if !matches!(error, Error::Exit(_)) {
                    eprintln!("{name}:{line}: {error}");
                }
                error.is_catchable()
            }
        });
        if let Err(error) = parsed {
            eprintln!("{name}:{}: {error}", error.line);
            status = 1;
        }
        status
    }

    /// A child of the root task that evaluates forms sent to it, sharing
    /// the interpreter's global scope.
    pub fn worker(&self) -> Result<Worker, Error> {
        let task = Task::child(self.machine.task());
        let registers = Registers::new(
            Scope::new(Some(self.global.clone())),
            Env::new(Some(self.root_env.clone())),
        );
        let machine = Machine::new(registers, task, self.runtime.clone());
        Worker::start(machine, self.config.queue_capacity)
    }

    /// Gives the terminal back to the interpreter's own process group after
    /// a foreground command may have taken it.
    fn reclaim_terminal(&self) {
        let Some(group) = self.terminal else {
            return;
        };
        if self.runtime.processes.foreground() != Some(group)
            && let Err(error) = self.runtime.processes.set_foreground(group)
        {
            debug!(%error, "couldn't reclaim the terminal");
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Shell status of a top-level value: statuses as they are, anything else
/// by truthiness.
pub fn status_of(value: &Cell) -> u8 {
    match value {
        Cell::Status(status) => **status,
        other if other.truthy() || other.is_null() => 0,
        _ => 1,
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;
    use crate::process::Attributes;

    /// Records launches instead of running anything.
    #[derive(Default)]
    struct Recorder {
        launched: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl Processes for Recorder {
        fn execute(&self, path: &Path, argv: &[String], _: &Attributes) -> Result<u8, Error> {
            self.launched
                .lock()
                .unwrap()
                .push((path.display().to_string(), argv.to_vec()));
            Ok(0)
        }
        fn terminate(&self, _: u32) -> Result<(), Error> {
            Ok(())
        }
        fn suspend(&self, _: u32) -> Result<(), Error> {
            Ok(())
        }
        fn resume(&self, _: u32) -> Result<(), Error> {
            Ok(())
        }
        fn foreground(&self) -> Option<i32> {
            None
        }
        fn set_foreground(&self, _: i32) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn test_status_of() {
        let cases = [
            (Cell::status(3), 3),
            (Cell::status(0), 0),
            (Cell::boolean(false), 1),
            (Cell::integer(7), 0),
            (Cell::null(), 0),
        ];
        for (value, expected) in cases {
            assert_eq!(status_of(&value), expected, "status of {value}");
        }
    }

    #[test]
    fn test_script_arguments_are_published() {
        let config = Config {
            script_name: "job.csh".to_string(),
            args: vec!["a".to_string(), "b c".to_string()],
            ..Config::default()
        };
        let interpreter = Interpreter::with_config(config);
        let root = interpreter.root();
        assert_eq!(root.access("_0_").unwrap().get().raw(), "job.csh");
        assert_eq!(root.access("_args_").unwrap().get().to_string(), r#"("a" "b c")"#);
        assert!(root.access("add").is_some());
    }

    #[test]
    fn test_root_bindings_are_constant() {
        let interpreter = Interpreter::new();
        let truth = interpreter.root().access("true").unwrap();
        assert!(truth.set(Cell::integer(1)).is_err());
    }

    #[cfg(all(unix, feature = "reader"))]
    #[test]
    fn test_external_commands_go_through_processes() {
        let recorder = Arc::new(Recorder::default());
        let mut interpreter = Interpreter::with_processes(Config::default(), recorder.clone());
        let status = interpreter.eval_str("(/bin/echo hi there)").unwrap();
        assert_eq!(status_of(&status), 0);
        let launched = recorder.launched.lock().unwrap();
        assert_eq!(
            *launched,
            vec![("/bin/echo".to_string(), vec!["hi".to_string(), "there".to_string()])]
        );
    }

    #[cfg(feature = "reader")]
    #[test]
    fn test_run_source_continues_after_errors() {
        let mut interpreter = Interpreter::new();
        let source = "(undefined-thing-here x)\n(define y = 2)\n(status 4)";
        let status = interpreter.run_source("t", source);
        assert_eq!(status, 4);
        assert_eq!(interpreter.root().access("y").unwrap().get().to_string(), "2");
    }

    #[cfg(feature = "reader")]
    #[test]
    fn test_run_source_stops_at_exit() {
        let mut interpreter = Interpreter::new();
        let status = interpreter.run_source("t", "(exit 9)\n(define y = 2)");
        assert_eq!(status, 9);
        assert!(interpreter.root().access("y").is_none());
    }

    #[cfg(feature = "reader")]
    #[test]
    fn test_worker_shares_globals() {
        let mut interpreter = Interpreter::new();
        interpreter.eval_str("(define base = 40)").unwrap();
        let worker = interpreter.worker().unwrap();
        let form = crate::reader::parse_one("(add base 2)").unwrap();
        assert_eq!(worker.eval(form).unwrap().to_string(), "42");
        worker.task().stop();
    }
}
