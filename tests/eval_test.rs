use std::io::{self, Write};
use std::thread;

use carp::config::Config;
use carp::printer::print_val;
use carp::{LispError, Machine};

fn eval(m: &mut Machine, src: &str) -> String {
    let v = m
        .eval_str(src)
        .unwrap_or_else(|e| panic!("{} failed: {}", src, e));
    print_val(&m.heap, v)
}

fn eval_fresh(src: &str) -> String {
    eval(&mut Machine::new(), src)
}

fn eval_err(src: &str) -> LispError {
    match Machine::new().eval_str(src) {
        Ok(_) => panic!("{} should have failed", src),
        Err(e) => e,
    }
}

// ============================================================================
// Atoms
// ============================================================================

#[test]
fn atoms_evaluate_to_themselves() {
    assert_eq!(eval_fresh("42"), "42");
    assert_eq!(eval_fresh("1.5"), "1.5");
    assert_eq!(eval_fresh("\"hi\""), "\"hi\"");
    assert_eq!(eval_fresh(":key"), ":key");
    assert_eq!(eval_fresh("()"), "()");
}

#[test]
fn global_constants() {
    assert_eq!(eval_fresh("true"), "true");
    assert_eq!(eval_fresh("false"), "false");
    assert_eq!(eval_fresh("nil"), "()");
}

#[test]
fn unbound_symbol_is_an_error() {
    let err = eval_err("undefined-thing");
    assert_eq!(err, LispError::Unbound("undefined-thing".into()));
    assert_eq!(err.to_string(), "Can't find 'undefined-thing' in environment.");
}

// ============================================================================
// Special forms
// ============================================================================

#[test]
fn if_selects_branch_on_truthiness() {
    assert_eq!(eval_fresh("(if false 1 2)"), "2");
    assert_eq!(eval_fresh("(if true 1 2)"), "1");
    // Only `false` is false.
    assert_eq!(eval_fresh("(if 0 1 2)"), "1");
    assert_eq!(eval_fresh("(if nil 1 2)"), "1");
}

#[test]
fn if_requires_exactly_three_forms() {
    assert!(matches!(eval_err("(if true 1)"), LispError::Syntax { .. }));
    assert!(matches!(eval_err("(if true 1 2 3)"), LispError::Syntax { .. }));
}

#[test]
fn let_bindings_are_sequential() {
    assert_eq!(eval_fresh("(let (a 1 b (+ a 1)) b)"), "2");
    assert_eq!(eval_fresh("(let () 7)"), "7");
}

#[test]
fn let_bindings_do_not_leak() {
    let mut m = Machine::new();
    assert_eq!(eval(&mut m, "(let (zz 1) zz)"), "1");
    assert!(matches!(m.eval_str("zz"), Err(LispError::Unbound(_))));
}

#[test]
fn malformed_let_is_a_syntax_error() {
    assert!(matches!(eval_err("(let (a) a)"), LispError::Syntax { .. }));
    assert!(matches!(eval_err("(let (1 2) 3)"), LispError::Syntax { .. }));
    assert!(matches!(eval_err("(let (a 1))"), LispError::Syntax { .. }));
    assert!(matches!(eval_err("(let (a 1) a a)"), LispError::Syntax { .. }));
}

#[test]
fn do_returns_last_value() {
    assert_eq!(eval_fresh("(do 1 2 3)"), "3");
    assert_eq!(eval_fresh("(do)"), "()");
}

#[test]
fn not_is_true_only_when_every_arg_is_false() {
    assert_eq!(eval_fresh("(not false)"), "true");
    assert_eq!(eval_fresh("(not false false)"), "true");
    assert_eq!(eval_fresh("(not false 1)"), "false");
    assert_eq!(eval_fresh("(not)"), "true");
}

#[test]
fn quote_returns_form_unevaluated() {
    assert_eq!(eval_fresh("'(1 (undefined) x)"), "(1 (undefined) x)");
    assert_eq!(eval_fresh("(quote sym)"), "sym");
}

#[test]
fn while_loops_until_false() {
    let mut m = Machine::new();
    let result = eval(
        &mut m,
        "(def i 0)
         (def acc 0)
         (while (< i 5)
           (do (reset! acc (+ acc i))
               (reset! i (+ i 1))))",
    );
    assert_eq!(result, "()");
    assert_eq!(eval(&mut m, "acc"), "10");
}

#[test]
fn def_binds_globally_from_any_scope() {
    let mut m = Machine::new();
    eval(&mut m, "(def f (fn () (let (x 5) (def inner x))))");
    assert_eq!(eval(&mut m, "(f)"), "5");
    assert_eq!(eval(&mut m, "inner"), "5");
}

#[test]
fn def_requires_symbol() {
    assert!(matches!(eval_err("(def 1 2)"), LispError::Syntax { .. }));
    assert!(matches!(eval_err("(def x)"), LispError::Syntax { .. }));
}

#[test]
fn def_query_and_ref() {
    let mut m = Machine::new();
    assert_eq!(eval(&mut m, "(def? x)"), "false");
    eval(&mut m, "(def x 3)");
    assert_eq!(eval(&mut m, "(def? x)"), "true");
    assert_eq!(eval(&mut m, "(ref x)"), "3");
}

#[test]
fn fn_requires_params_and_body() {
    assert!(matches!(eval_err("(fn)"), LispError::Syntax { .. }));
    assert!(matches!(eval_err("(fn (x))"), LispError::Syntax { .. }));
}

// ============================================================================
// Application
// ============================================================================

#[test]
fn closures_capture_their_environment() {
    let mut m = Machine::new();
    eval(&mut m, "(def make-adder (fn (n) (fn (x) (+ x n))))");
    assert_eq!(eval(&mut m, "((make-adder 2) 3)"), "5");
}

#[test]
fn rest_parameters() {
    assert_eq!(eval_fresh("((fn (a & rest) rest) 1 2 3)"), "(2 3)");
    assert_eq!(eval_fresh("((fn (a & rest) rest) 1)"), "()");
}

#[test]
fn wrong_arity_is_an_error() {
    assert!(matches!(eval_err("((fn (a) a))"), LispError::Arity(_)));
    assert!(matches!(eval_err("((fn (a) a) 1 2)"), LispError::Arity(_)));
}

#[test]
fn non_callable_head_is_an_error() {
    let err = eval_err("(1 2)");
    assert_eq!(err, LispError::NotCallable("1".into()));
}

#[test]
fn recursion() {
    let mut m = Machine::new();
    eval(
        &mut m,
        "(def fact (fn (n) (if (< n 2) 1 (* n (fact (- n 1))))))",
    );
    assert_eq!(eval(&mut m, "(fact 10)"), "3628800");
}

// ============================================================================
// Macros
// ============================================================================

#[test]
fn macro_expansion_is_evaluated() {
    let mut m = Machine::new();
    eval(&mut m, "(def m (macro () '(+ 1 2)))");
    assert_eq!(eval(&mut m, "(m)"), "3");
}

#[test]
fn macro_receives_unevaluated_forms() {
    let mut m = Machine::new();
    eval(&mut m, "(def my-quote (macro (x) (list 'quote x)))");
    assert_eq!(eval(&mut m, "(my-quote (undefined-fn 1))"), "(undefined-fn 1)");
}

#[test]
fn macro_expansion_runs_in_calling_environment() {
    let mut m = Machine::new();
    eval(&mut m, "(def unless (macro (c body) (list 'if c () body)))");
    assert_eq!(eval(&mut m, "(let (x false) (unless x 42))"), "42");
}

// ============================================================================
// match
// ============================================================================

#[test]
fn match_rest_pattern() {
    assert_eq!(eval_fresh("(match (list 1 2 3) (a & rest) rest)"), "(2 3)");
    assert_eq!(eval_fresh("(match (list 1 2 3) (a & rest) a)"), "1");
}

#[test]
fn match_list_arity_must_agree() {
    assert_eq!(eval_fresh("(match (list 1 2 3) (a b) 1 _ 2)"), "2");
}

#[test]
fn match_quoted_and_literal_patterns() {
    assert_eq!(eval_fresh("(match 'foo 'bar 1 'foo 2)"), "2");
    assert_eq!(eval_fresh("(match 5 4 :no 5 :yes)"), ":yes");
}

#[test]
fn match_clause_bindings_do_not_leak() {
    assert_eq!(
        eval_fresh("(match (list 1 2) (x 3) x (y z) (def? x))"),
        "false"
    );
}

#[test]
fn match_failures() {
    assert!(matches!(eval_err("(match 1 2 3)"), LispError::NoMatch(_)));
    assert!(matches!(eval_err("(match 1 x)"), LispError::Syntax { .. }));
}

// ============================================================================
// reset!
// ============================================================================

#[test]
fn reset_of_unbound_symbol_is_a_no_op() {
    let mut m = Machine::new();
    assert_eq!(eval(&mut m, "(reset! nope 5)"), "()");
    assert_eq!(eval(&mut m, "(def? nope)"), "false");
}

#[test]
fn reset_updates_every_observer_of_the_binding() {
    let mut m = Machine::new();
    eval(
        &mut m,
        "(def cell (let (x 1) (list (fn () x) (fn (v) (reset! x v)))))",
    );
    assert_eq!(eval(&mut m, "((first cell))"), "1");
    assert_eq!(eval(&mut m, "((first (rest cell)) 10)"), "10");
    assert_eq!(eval(&mut m, "((first cell))"), "10");
}

#[test]
fn reset_of_global_from_function() {
    let mut m = Machine::new();
    eval(&mut m, "(def counter 0) (def bump (fn () (reset! counter (+ counter 1))))");
    eval(&mut m, "(bump) (bump)");
    assert_eq!(eval(&mut m, "counter"), "2");
}

// ============================================================================
// Dictionaries and keywords
// ============================================================================

#[test]
fn dictionary_literal_values_are_evaluated() {
    let mut m = Machine::new();
    eval(&mut m, "(def x 5)");
    assert_eq!(eval(&mut m, "{:v x :w (+ x 1)}"), "{:v 5, :w 6}");
}

#[test]
fn keyword_lookup() {
    assert_eq!(eval_fresh("(:a {:a 1 :b 2})"), "1");
    assert!(matches!(eval_err("(:c {:a 1})"), LispError::KeywordLookup(_)));
    assert!(matches!(eval_err("(:a 1)"), LispError::KeywordLookup(_)));
    assert!(matches!(eval_err("(:a {:a 1} 2)"), LispError::KeywordLookup(_)));
}

// ============================================================================
// Natives
// ============================================================================

#[test]
fn arithmetic() {
    assert_eq!(eval_fresh("(+ 1 2 3)"), "6");
    assert_eq!(eval_fresh("(+ 1 2.5)"), "3.5");
    assert_eq!(eval_fresh("(- 5)"), "-5");
    assert_eq!(eval_fresh("(- 10 3 2)"), "5");
    assert_eq!(eval_fresh("(/ 7 2)"), "3");
    assert_eq!(eval_fresh("(mod -1 3)"), "2");
    assert!(matches!(eval_err("(/ 1 0)"), LispError::Native(_)));
    assert!(matches!(eval_err("(+ 1 \"a\")"), LispError::Type(_)));
}

#[test]
fn comparisons_and_equality() {
    assert_eq!(eval_fresh("(< 1 2)"), "true");
    assert_eq!(eval_fresh("(> 1 2)"), "false");
    assert_eq!(eval_fresh("(= (list 1 2) (list 1 2))"), "true");
    assert_eq!(eval_fresh("(= 'a 'b)"), "false");
    assert!(matches!(eval_err("(= (fn () 1) (fn () 1))"), LispError::Compare(..)));
}

#[test]
fn list_natives() {
    assert_eq!(eval_fresh("(cons 1 (list 2 3))"), "(1 2 3)");
    assert_eq!(eval_fresh("(first (list 1 2))"), "1");
    assert_eq!(eval_fresh("(rest (list 1 2))"), "(2)");
    assert_eq!(eval_fresh("(count (list 1 2 3))"), "3");
    assert_eq!(eval_fresh("(count \"abcd\")"), "4");
    assert!(matches!(eval_err("(first ())"), LispError::Native(_)));
}

#[test]
fn str_concatenates_display_forms() {
    assert_eq!(eval_fresh("(str \"a\" 1 :k)"), "\"a1:k\"");
}

#[test]
fn copy_preserves_equality() {
    let mut m = Machine::new();
    eval(&mut m, "(def a (list 1 (list 2 3) {:k 4}))");
    assert_eq!(eval(&mut m, "(= a (copy a))"), "true");
}

#[test]
fn random_stays_in_range() {
    let mut m = Machine::new();
    for _ in 0..20 {
        let n: i64 = eval(&mut m, "(random 10)").parse().unwrap();
        assert!((0..10).contains(&n));
    }
    assert!(matches!(eval_err("(random 0)"), LispError::Type(_)));
}

// ============================================================================
// Errors and the driver
// ============================================================================

#[test]
fn error_stops_further_side_effects() {
    let mut m = Machine::new();
    assert!(m.eval_str("(do (def a 1) (undefined) (def b 2))").is_err());
    assert_eq!(eval(&mut m, "(def? a)"), "true");
    assert_eq!(eval(&mut m, "(def? b)"), "false");

    let before = m.stats.collections;
    assert!(m.eval_str("(list (undefined) (gc))").is_err());
    assert_eq!(m.stats.collections, before);
}

#[test]
fn stacks_are_unwound_after_error() {
    let mut m = Machine::new();
    assert!(m.eval_str("(let (x 1) (+ x ((fn (y) (match y 2 3)) x)))").is_err());
    assert_eq!(m.stack_depth(), 0);
    assert_eq!(m.root_depth(), 0);
    assert_eq!(eval(&mut m, "(+ 1 1)"), "2");
}

#[test]
fn call_trace_records_calls_in_progress() {
    let mut m = Machine::new();
    let err = m
        .eval_str("(def f (fn (x) (undefined x))) (f 1)")
        .unwrap_err();
    assert_eq!(err, LispError::Unbound("undefined".into()));
    assert_eq!(m.call_trace(), ["(f 1)".to_string()]);
}

#[test]
fn eval_text_echoes_and_stops_at_first_error() {
    let mut m = Machine::new();
    let mut out = Vec::new();
    let global = m.global;
    let result = m.eval_text(global, "(+ 1 2) (undefined) (+ 3 4)", &mut out);
    assert!(result.is_err());
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("3\n"));
    assert!(text.contains("ERROR: Can't find 'undefined' in environment."));
    assert!(!text.contains('7'));
    assert_eq!(m.stack_depth(), 0);
}

#[test]
fn eval_text_without_echo() {
    let mut m = Machine::new();
    m.config.echo_results = false;
    let mut out = Vec::new();
    let global = m.global;
    m.eval_text(global, "(def x 1) (+ x 1)", &mut out).unwrap();
    assert!(out.is_empty());
    assert_eq!(eval(&mut m, "x"), "1");
}

#[test]
fn eval_text_reports_malformed_input() {
    let mut m = Machine::new();
    let mut out = Vec::new();
    let global = m.global;
    let result = m.eval_text(global, "(+ 1 2)\n(+ 3 \"abc", &mut out);
    assert!(matches!(&result, Err(LispError::Read(msg)) if msg.contains("unterminated string")));
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("3\n"), "{}", text);
    assert!(text.contains("ERROR: Read error: unterminated string"), "{}", text);
    assert!(text.contains("(byte 17, line 2, column 10)"), "{}", text);
    assert_eq!(m.stack_depth(), 0);
}

#[test]
fn eval_text_prefers_the_evaluation_error() {
    let mut m = Machine::new();
    let mut out = Vec::new();
    let global = m.global;
    let result = m.eval_text(global, "(undefined) (", &mut out);
    assert!(matches!(result, Err(LispError::Unbound(_))));
    let text = String::from_utf8(out).unwrap();
    assert!(!text.contains("Read error"), "{}", text);
}

struct BrokenPipe;

impl Write for BrokenPipe {
    fn write(&mut self, _: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn eval_text_output_failure_unwinds_the_stack() {
    let mut m = Machine::new();
    let global = m.global;
    let result = m.eval_text(global, "(def x 1) (+ x 1)", &mut BrokenPipe);
    assert!(matches!(result, Err(LispError::Io(_))));
    assert_eq!(m.stack_depth(), 0);
    assert_eq!(m.root_depth(), 0);
    assert_eq!(eval(&mut m, "x"), "1");
}

// ============================================================================
// Evaluation depth
// ============================================================================

const COUNTDOWN: &str = "(def f (fn (n) (if (< n 1) 0 (f (- n 1)))))";

#[test]
fn recursion_within_the_depth_limit() {
    let mut m = Machine::with_config(Config {
        max_depth: 200,
        ..Config::default()
    });
    eval(&mut m, COUNTDOWN);
    assert_eq!(eval(&mut m, "(f 50)"), "0");
    assert_eq!(m.eval_depth(), 0);
}

#[test]
fn depth_is_restored_after_an_error() {
    let mut m = Machine::new();
    eval(&mut m, "(def g (fn (n) (if (< n 1) (undefined) (g (- n 1)))))");
    assert!(m.eval_str("(g 20)").is_err());
    assert_eq!(m.eval_depth(), 0);
}

#[test]
#[should_panic(expected = "Evaluation depth exceeded.")]
fn runaway_recursion_is_fatal() {
    let mut m = Machine::with_config(Config {
        max_depth: 200,
        ..Config::default()
    });
    eval(&mut m, COUNTDOWN);
    let _ = m.eval_str("(f 1000)");
}

#[test]
fn default_limit_fires_before_the_host_stack_runs_out() {
    let config = Config::default();
    let stack = config.host_stack_bytes();
    let outcome = thread::Builder::new()
        .stack_size(stack)
        .spawn(move || {
            let mut m = Machine::with_config(config);
            eval(&mut m, COUNTDOWN);
            assert_eq!(eval(&mut m, "(f 400)"), "0");
            let _ = m.eval_str("(f 5000)");
        })
        .unwrap()
        .join();
    let payload = outcome.unwrap_err();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap();
    assert_eq!(message, "Evaluation depth exceeded.");
}
