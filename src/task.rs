//! Tasks, jobs and workers.
//!
//! A [`Task`] is the schedulable unit wrapping one register machine. Tasks
//! form a tree: a script that spawns work tracks its children, and job
//! control applied to a task reaches every live descendant before the task
//! itself.
//!
//! ```text
//!             suspend               stop
//!   Running ----------> Suspended ------> Terminated
//!      ^  <----------       |                 ^
//!      |     resume         |     stop        |
//!      +--------------------+-----------------+
//! ```
//!
//! The machine consults [`Task::checkpoint`] before every tick, which is where
//! a suspended task parks and a terminated task notices it should stop.

use std::io;
use std::process::Child;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::Error;
use crate::cell::Cell;
use crate::evaluator::Machine;
use crate::process::Processes;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Suspended,
    Terminated,
}

#[derive(Debug, Default)]
struct JobState {
    command: String,
    pid: Option<u32>,
}

/// A task's handle on the external processes it runs.
///
/// The process group is shared by a task and every task it spawns, so their
/// commands form one job. The running process and its command text belong
/// to the task alone, and job control only ever signals that process.
#[derive(Debug, Default)]
pub struct Job {
    group: Arc<Mutex<Option<i32>>>,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new() -> Arc<Job> {
        Arc::new(Job::default())
    }

    /// A job in the same process group with no process of its own yet.
    pub fn child(&self) -> Arc<Job> {
        Arc::new(Job {
            group: self.group.clone(),
            state: Mutex::default(),
        })
    }

    /// Process group the job's commands join, once one has started.
    pub fn group(&self) -> Option<i32> {
        *lock(&self.group)
    }

    /// Text of the most recently started command.
    pub fn command(&self) -> String {
        lock(&self.state).command.clone()
    }

    /// The external process currently running, if any.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.state).pid
    }

    /// Starts a process while holding the group lock. `spawn` gets the
    /// group to join, or `None` to lead a new one. The first process of a
    /// job founds its group; when every member of the group has exited the
    /// next process founds a new one.
    pub fn launch(
        &self,
        command: &str,
        mut spawn: impl FnMut(Option<i32>) -> io::Result<Child>,
    ) -> Result<Child, Error> {
        let mut group = lock(&self.group);
        let joined = match *group {
            Some(existing) => spawn(Some(existing)).ok(),
            None => None,
        };
        let child = match joined {
            Some(child) => child,
            None => {
                let child = spawn(None)?;
                *group = i32::try_from(child.id()).ok();
                child
            }
        };
        let mut state = lock(&self.state);
        state.pid = Some(child.id());
        state.command = command.to_string();
        Ok(child)
    }

    /// Forgets `pid` once it has exited.
    pub fn finish(&self, pid: u32) {
        let mut state = lock(&self.state);
        if state.pid == Some(pid) {
            state.pid = None;
        }
    }
}

pub struct Task {
    id: u64,
    strict: bool,
    background: bool,
    job: Arc<Job>,
    processes: Arc<dyn Processes>,
    children: Mutex<Vec<Arc<Task>>>,
    state: Mutex<RunState>,
    gate: Condvar,
    outcome: Mutex<Option<Result<Cell, Error>>>,
    done: Condvar,
}

impl Task {
    /// A root task with a job of its own.
    pub fn new(strict: bool, processes: Arc<dyn Processes>) -> Arc<Task> {
        Self::build(strict, false, Job::new(), processes)
    }

    fn build(
        strict: bool,
        background: bool,
        job: Arc<Job>,
        processes: Arc<dyn Processes>,
    ) -> Arc<Task> {
        Arc::new(Task {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            strict,
            background,
            job,
            processes,
            children: Mutex::default(),
            state: Mutex::new(RunState::Running),
            gate: Condvar::new(),
            outcome: Mutex::default(),
            done: Condvar::new(),
        })
    }

    /// A task tracked by `parent`, sharing its process group and
    /// strictness. Children that have already finished stop being tracked.
    pub fn child(parent: &Arc<Task>) -> Arc<Task> {
        let child = Self::build(
            parent.strict,
            true,
            parent.job.child(),
            parent.processes.clone(),
        );
        let mut children = lock(&parent.children);
        children.retain(|tracked| !tracked.is_done());
        children.push(child.clone());
        child
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Whether this task was spawned rather than driven by the interpreter
    /// itself. Background tasks never own the terminal.
    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn state(&self) -> RunState {
        *lock(&self.state)
    }

    pub fn children(&self) -> Vec<Arc<Task>> {
        lock(&self.children).clone()
    }

    /// Blocks while suspended. Returns `false` once the task is terminated.
    pub fn checkpoint(&self) -> bool {
        let mut state = lock(&self.state);
        while *state == RunState::Suspended {
            state = self.gate.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        *state != RunState::Terminated
    }

    pub fn suspend(&self) {
        for child in self.children() {
            child.suspend();
        }
        let mut state = lock(&self.state);
        if *state == RunState::Running {
            *state = RunState::Suspended;
            debug!(task = self.id, "suspended");
            if let Some(pid) = self.job.pid()
                && let Err(error) = self.processes.suspend(pid)
            {
                debug!(task = self.id, pid, %error, "couldn't stop process");
            }
        }
    }

    pub fn resume(&self) {
        for child in self.children() {
            child.resume();
        }
        let mut state = lock(&self.state);
        if *state == RunState::Suspended {
            *state = RunState::Running;
            debug!(task = self.id, "resumed");
            if let Some(pid) = self.job.pid()
                && let Err(error) = self.processes.resume(pid)
            {
                debug!(task = self.id, pid, %error, "couldn't continue process");
            }
            self.gate.notify_all();
        }
    }

    /// Terminates this task and its descendants. Irreversible.
    pub fn stop(&self) {
        for child in self.children() {
            child.stop();
        }
        let mut state = lock(&self.state);
        if *state != RunState::Terminated {
            *state = RunState::Terminated;
            debug!(task = self.id, "terminated");
            if let Some(pid) = self.job.pid()
                && let Err(error) = self.processes.terminate(pid)
            {
                debug!(task = self.id, pid, %error, "couldn't terminate process");
            }
            self.gate.notify_all();
        }
    }

    /// Runs `work` on a thread of its own and records its outcome.
    pub fn start<F>(self: &Arc<Self>, work: F) -> Result<(), Error>
    where
        F: FnOnce() -> Result<Cell, Error> + Send + 'static,
    {
        let task = self.clone();
        thread::Builder::new()
            .name(format!("task-{}", self.id))
            .spawn(move || task.finish(work()))?;
        Ok(())
    }

    /// Records the outcome and wakes everyone waiting for it.
    pub fn finish(&self, outcome: Result<Cell, Error>) {
        if let Err(error) = &outcome
            && !matches!(error, Error::Terminated | Error::Exit(_))
        {
            warn!(task = self.id, %error, "task failed");
        }
        *lock(&self.outcome) = Some(outcome);
        self.done.notify_all();
    }

    pub fn is_done(&self) -> bool {
        lock(&self.outcome).is_some()
    }

    /// Blocks until the task has finished.
    pub fn wait(&self) -> Result<Cell, Error> {
        let mut outcome = lock(&self.outcome);
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = self.done.wait(outcome).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Waits for every tracked child, dropping each from the tracking set as
    /// it finishes. Children spawned meanwhile are waited for too.
    pub fn wait_children(&self) -> Vec<Result<Cell, Error>> {
        let mut outcomes = Vec::new();
        loop {
            let Some(child) = lock(&self.children).first().cloned() else {
                return outcomes;
            };
            outcomes.push(child.wait());
            self.forget(&child);
        }
    }

    /// Stops tracking `child`.
    pub fn forget(&self, child: &Arc<Task>) {
        lock(&self.children).retain(|tracked| !Arc::ptr_eq(tracked, child));
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// One unit of work for a [`Worker`].
pub struct Request {
    pub form: Cell,
    pub reply: mpsc::Sender<Result<Cell, Error>>,
}

/// A task that evaluates forms taken from a bounded queue, one at a time.
pub struct Worker {
    task: Arc<Task>,
    queue: SyncSender<Request>,
}

impl Worker {
    pub(crate) fn start(mut machine: Machine, capacity: usize) -> Result<Worker, Error> {
        let (queue, requests): (SyncSender<Request>, Receiver<Request>) =
            mpsc::sync_channel(capacity);
        let task = machine.task().clone();
        task.start(move || {
            for request in requests {
                let result = machine.evaluate(request.form);
                let terminated = matches!(result, Err(Error::Terminated));
                let _ = request.reply.send(result);
                if terminated {
                    return Err(Error::Terminated);
                }
            }
            Ok(Cell::null())
        })?;
        Ok(Worker { task, queue })
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Queues `form`, blocking while the queue is full.
    pub fn submit(&self, form: Cell) -> Result<mpsc::Receiver<Result<Cell, Error>>, Error> {
        let (reply, receiver) = mpsc::channel();
        self.queue
            .send(Request { form, reply })
            .map_err(|_| Error::runtime(format!("worker {} has stopped", self.task.id())))?;
        Ok(receiver)
    }

    /// Queues `form` and waits for its value.
    pub fn eval(&self, form: Cell) -> Result<Cell, Error> {
        self.submit(form)?
            .recv()
            .map_err(|_| Error::runtime(format!("worker {} has stopped", self.task.id())))?
    }
}
