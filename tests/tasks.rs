#![cfg(feature = "reader")]
#![expect(clippy::unwrap_used)] // test code OK

use std::thread;
use std::time::{Duration, Instant};

use cellsh::task::{RunState, Task};
use cellsh::{Cell, Interpreter};

fn eval(interpreter: &mut Interpreter, source: &str) -> Cell {
    interpreter.eval_str(source).unwrap()
}

fn task(interpreter: &mut Interpreter, source: &str) -> std::sync::Arc<Task> {
    eval(interpreter, source).as_task().unwrap().clone()
}

/// Polls until `task` has an external process running.
fn running_pid(task: &Task) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(pid) = task.job().pid() {
            return pid;
        }
        assert!(Instant::now() < deadline, "task {} never started its command", task.id());
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_spawn_and_wait() {
    let mut interpreter = Interpreter::new();
    let value = eval(&mut interpreter, "(define t = (spawn (add 20 22))) (wait t)");
    assert_eq!(value.to_string(), "42");
    assert!(interpreter.task().children().is_empty());
}

#[test]
fn test_spawned_task_sees_definitions() {
    let mut interpreter = Interpreter::new();
    let source = "
        (define base = 10)
        (define scale as (n) (mul n base))
        (wait (spawn (scale 4)))";
    assert_eq!(eval(&mut interpreter, source).to_string(), "40");
}

#[test]
fn test_wait_without_arguments_collects_all_children() {
    let mut interpreter = Interpreter::new();
    eval(
        &mut interpreter,
        "(define c = (channel 2)) (spawn (read c)) (spawn (read c))",
    );
    assert_eq!(interpreter.task().children().len(), 2);
    eval(&mut interpreter, "(write c 1) (write c 2) (wait)");
    assert!(interpreter.task().children().is_empty());
}

#[test]
fn test_finished_children_are_not_kept() {
    let mut interpreter = Interpreter::new();
    let first = task(&mut interpreter, "(spawn (add 1 1))");
    first.wait().unwrap();
    eval(&mut interpreter, "(define c = (channel 1)) (define t = (spawn (read c)))");
    assert_eq!(interpreter.task().children().len(), 1);
    eval(&mut interpreter, "(write c 1) (wait t)");
}

#[test]
fn test_parent_handlers_stay_out_of_spawned_tasks() {
    let mut interpreter = Interpreter::new();
    let source = r#"
        (set hits = 0)
        (define f as ()
            (catch e "handled")
            (define t = (spawn (div 1 0)))
            (list (wait t) "parent-done"))
        (block (define r = (f)) (set hits = (add hits 1)) r)"#;
    assert_eq!(eval(&mut interpreter, source).to_string(), r#"(1 "parent-done")"#);
    assert_eq!(eval(&mut interpreter, "hits").to_string(), "1");
}

#[test]
fn test_spawned_task_catches_its_own_errors() {
    let mut interpreter = Interpreter::new();
    let value = eval(&mut interpreter, "(wait (spawn (catch e e::kind) (div 1 0)))");
    assert_eq!(value.raw(), "runtime");
}

#[test]
fn test_failed_task_reports_status() {
    let mut interpreter = Interpreter::new();
    let value = eval(&mut interpreter, "(wait (spawn (exit 7)))");
    assert_eq!(value.to_string(), "7");
}

#[test]
fn test_channel_between_tasks() {
    let mut interpreter = Interpreter::new();
    let source = "
        (define c = (channel 1))
        (define producer = (spawn
            (set i = 0)
            (while (lt i 3) (write c i) (set i = (add i 1)))
            (close c)))
        (set total = 0)
        (set item = (read c))
        (while (not (is-null item))
            (set total = (add total item))
            (set item = (read c)))
        (wait producer)
        total";
    assert_eq!(eval(&mut interpreter, source).to_string(), "3");
}

#[test]
fn test_suspend_resume_stop() {
    let mut interpreter = Interpreter::new();
    let task = eval(&mut interpreter, "(define t = (spawn (while #t (block)))) t");
    let task = task.as_task().unwrap().clone();
    assert_eq!(task.state(), RunState::Running);

    eval(&mut interpreter, "(suspend t)");
    assert_eq!(task.state(), RunState::Suspended);
    eval(&mut interpreter, "(resume t)");
    assert_eq!(task.state(), RunState::Running);

    let status = eval(&mut interpreter, "(stop t) (wait t)");
    assert_eq!(status.to_string(), "143");
    assert_eq!(task.state(), RunState::Terminated);
}

#[cfg(unix)]
#[test]
fn test_stop_reaches_only_the_stopped_task_process() {
    let mut interpreter = Interpreter::new();
    let slow = task(&mut interpreter, "(define slow = (spawn (sleep 5))) slow");
    let quick = task(&mut interpreter, "(define quick = (spawn (sleep 1))) quick");
    let slow_pid = running_pid(&slow);
    let quick_pid = running_pid(&quick);
    assert_ne!(slow_pid, quick_pid);
    assert_eq!(slow.job().group(), quick.job().group());

    let started = Instant::now();
    eval(&mut interpreter, "(stop slow)");
    assert_eq!(eval(&mut interpreter, "(wait slow)").to_string(), "143");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(eval(&mut interpreter, "(wait quick)").to_string(), "0");
}

#[test]
fn test_stopping_the_root_reaches_spawned_tasks() {
    let mut interpreter = Interpreter::new();
    let task = eval(&mut interpreter, "(spawn (while #t (block)))");
    let task = task.as_task().unwrap().clone();
    interpreter.task().stop();
    assert!(matches!(task.wait(), Err(cellsh::Error::Terminated)));
}

#[test]
fn test_worker_queue() {
    let mut interpreter = Interpreter::new();
    eval(&mut interpreter, "(define double as (n) (mul n 2))");
    let worker = interpreter.worker().unwrap();
    let replies: Vec<_> = (1..=3)
        .map(|n| {
            let form = cellsh::reader::parse_one(&format!("(double {n})")).unwrap();
            worker.submit(form).unwrap()
        })
        .collect();
    let values: Vec<String> = replies
        .into_iter()
        .map(|reply| reply.recv().unwrap().unwrap().to_string())
        .collect();
    assert_eq!(values, vec!["2", "4", "6"]);
}
