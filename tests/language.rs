#![cfg(feature = "reader")]
#![expect(clippy::unwrap_used)] // test code OK

use cellsh::{Cell, Config, Interpreter};

/// Expected outcome of running a source snippet in a fresh interpreter.
enum Expect {
    /// Canonical text of the value.
    Text(&'static str),
    /// Raw text of the value (strings unquoted).
    Raw(&'static str),
    /// Fails with an error whose kind is as given.
    Kind(&'static str),
}

use Expect::{Kind, Raw, Text};

fn run(interpreter: &mut Interpreter, source: &str, expected: &Expect) {
    let result = interpreter.eval_str(source);
    match (expected, result) {
        (Text(text), Ok(value)) => assert_eq!(value.to_string(), *text, "source: {source}"),
        (Raw(text), Ok(value)) => assert_eq!(value.raw(), *text, "source: {source}"),
        (Kind(kind), Err(error)) => assert_eq!(error.kind(), *kind, "source: {source}: {error}"),
        (_, Ok(value)) => panic!("{source}: expected an error, got {value}"),
        (_, Err(error)) => panic!("{source}: unexpected error {error}"),
    }
}

fn run_table(cases: &[(&str, Expect)]) {
    for (source, expected) in cases {
        run(&mut Interpreter::new(), source, expected);
    }
}

#[test]
fn test_definitions_and_calls() {
    run_table(&[
        ("(set x = 3) (add x 4)", Text("7")),
        ("(define f as (a) (add a 1)) (f 5)", Text("6")),
        ("(define f = (method (a b) = (sub a b))) (f 10 4)", Text("6")),
        ("(define f as (a) a) (f 1 2)", Kind("runtime")),
        ("(define x = 1) (set x = (add x 1)) x", Text("2")),
        ("(define x 1)", Kind("syntax")),
        ("(set true = 1)", Kind("runtime")),
        ("(list 1 2/4 3.5)", Text("(1 2/4 3.5)")),
        ("(eq 4/2 2)", Text("#t")),
        ("'(a b . c)", Text("(a b . c)")),
        ("(quote hello)", Text("hello")),
    ]);
}

#[test]
fn test_conditionals_and_loops() {
    run_table(&[
        ("(if (lt 1 2) yes else no)", Text("yes")),
        (r#"(if (lt 1 2) "yes" else "no")"#, Text(r#""yes""#)),
        ("(if (gt 1 2) yes else no)", Text("no")),
        ("(if (gt 1 2) yes else if (gt 2 1) maybe else no)", Text("maybe")),
        ("(if #f A)", Kind("syntax")),
        ("(if #f x y else z)", Kind("syntax")),
        ("(if #f (list 1) x else z)", Kind("syntax")),
        ("(if #f (list 1) (list 2) else z)", Text("z")),
        ("(if #f (list 1))", Text("()")),
        (
            "(set i = 0) (set total = 0)
             (while (lt i 5) (set total = (add total i)) (set i = (add i 1)))
             total",
            Text("10"),
        ),
    ]);
}

#[test]
fn test_continuations() {
    run_table(&[
        (
            "(define g as (k) (k 42) 0) (define f as () (add (g return) 1)) (f)",
            Text("42"),
        ),
        ("(define f as () (return) 5) (f)", Text("()")),
        ("(define f as () (return 1 2) 5) (f)", Text("(1 2)")),
    ]);
}

#[test]
fn test_errors_and_handlers() {
    run_table(&[
        (
            "(define safe as (x) (catch e e::kind) (div x 0)) (safe 1)",
            Raw("runtime"),
        ),
        (
            r#"(define f as () (catch e e::message) (throw "mine" "boom")) (f)"#,
            Raw("boom"),
        ),
        (r#"(throw "bad" "thing")"#, Kind("bad")),
        ("(fatal no way out)", Kind("fatal")),
        ("(list 1 . 2", Kind("syntax")),
    ]);

    let mut interpreter = Interpreter::new();
    assert!(matches!(
        interpreter.eval_str("(exit 3)"),
        Err(cellsh::Error::Exit(3))
    ));
}

#[test]
fn test_handler_errors_propagate_outward() {
    let source = r#"
        (define inner as ()
            (catch e (throw "again" e::message))
            (throw "first" "x"))
        (define outer as ()
            (catch e (list e::kind e::message))
            (inner))
        (outer)"#;
    run(&mut Interpreter::new(), source, &Text(r#"("again" "x")"#));
}

#[test]
fn test_catch_is_scoped_to_its_clause() {
    run_table(&[
        (
            r#"(define f as ()
                 (define r = (if #t (catch e (list "caught" e::message)) (throw "k" "m") never))
                 (list r "after"))
               (f)"#,
            Text(r#"(("caught" "m") "after")"#),
        ),
        (
            r#"(define f as () (if #t (catch e "caught") (list)) (throw "k" "m") "after") (f)"#,
            Kind("k"),
        ),
        (
            "(set i = 0) (set hits = 0)
             (while (lt i 3)
                 (set i = (add i 1))
                 (catch e (set hits = (add hits 1)))
                 (div 1 0))
             (list i hits)",
            Text("(3 3)"),
        ),
        (
            "(block
                 (set i = 0)
                 (while (lt i 1) (set i = (add i 1)) (catch e handled))
                 (div 1 0))",
            Kind("runtime"),
        ),
    ]);

    let mut interpreter = Interpreter::new();
    let source = r#"
        (set n = 0)
        (define f as ()
            (if #t (catch e (set n = (add n 1))) (list))
            (throw "k" "m")
            "after")
        (f)"#;
    assert!(interpreter.eval_str(source).is_err());
    run(&mut interpreter, "n", &Text("0"));
}

#[test]
fn test_inner_methods_outlive_their_definition() {
    run_table(&[
        ("(define make as () (define inner as () 42) inner) ((make))", Text("42")),
        (
            "(define make as (n) (define get as () n) get) (define g = (make 7)) (g)",
            Text("7"),
        ),
        (
            "(define counter = (object (define n = 0) (public bump as () (set n = (add n 1)) n)))
             (counter::bump) (counter::bump)",
            Text("2"),
        ),
        (
            "(define f as () (define g = 0) (set g = (method () = 5)) (g)) (f)",
            Text("5"),
        ),
    ]);
}

#[test]
fn test_objects_and_members() {
    let mut interpreter = Interpreter::new();
    interpreter
        .eval_str(
            "(define point = (object (public x = 1) (define secret = 2) (public getx as () x)))",
        )
        .unwrap();
    run(&mut interpreter, "point::x", &Text("1"));
    run(&mut interpreter, "(point::getx)", &Text("1"));
    run(&mut interpreter, "point::secret", &Kind("runtime"));
    run(&mut interpreter, "(set point::x = 5) point::x", &Text("5"));
    run(&mut interpreter, "(set point::y = 5)", &Kind("runtime"));
}

#[test]
fn test_string_members() {
    let mut interpreter = Interpreter::new();
    interpreter.eval_str(r#"(define s = "a,b,c")"#).unwrap();
    run(&mut interpreter, r#"(s::split ",")"#, &Text(r#"("a" "b" "c")"#));
    run(&mut interpreter, "(s::upper)", &Raw("A,B,C"));
    run(&mut interpreter, "(s::length)", &Text("5"));
    interpreter.eval_str(r#"(define sep = ", ")"#).unwrap();
    run(&mut interpreter, "(sep::join (list 1 2))", &Raw("1, 2"));
}

#[test]
fn test_echo_writes_to_dynamic_stdout() {
    run_table(&[
        (
            "(block (dynamic _stdout_ = (channel 4)) (echo hello there) (read _stdout_))",
            Raw("hello there"),
        ),
        (
            r#"(block (dynamic _stdout_ = (channel 4)) (echo "/*" "~") (read _stdout_))"#,
            Raw("/* ~"),
        ),
    ]);
}

#[test]
fn test_handles_read_back() {
    let mut interpreter = Interpreter::new();
    let object = interpreter.eval_str("(define o = (object)) o").unwrap();
    let text = object.to_string();
    assert!(text.starts_with("%object "), "{text}");
    run(&mut interpreter, &format!("(is {text} o)"), &Text("#t"));
}

#[test]
fn test_strict_mode() {
    let strict = || {
        Interpreter::with_config(Config {
            strict: true,
            ..Config::default()
        })
    };
    run(&mut Interpreter::new(), "(list foo)", &Text("(foo)"));
    run(&mut strict(), "(list foo)", &Kind("runtime"));
    run(&mut strict(), "(list 42)", &Text("(42)"));
    run(&mut strict(), "(define 3 = 4)", &Kind("syntax"));
}

#[test]
fn test_top_level_failure_restores_state() {
    let mut interpreter = Interpreter::new();
    interpreter.eval_str("(define x = 1)").unwrap();
    assert!(interpreter.eval_str("(block (set x = 2) (div 1 0))").is_err());
    // The assignment happened before the failure and is kept.
    run(&mut interpreter, "x", &Text("2"));
    run(&mut interpreter, "(add x 1)", &Text("3"));
    assert!(interpreter.root().access("x").is_some());
    assert_eq!(
        interpreter.eval_str("(list)").unwrap().to_string(),
        Cell::null().to_string()
    );
}
