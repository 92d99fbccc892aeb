use std::cmp::Ordering;
use std::io::Write;

use rand::Rng;

use crate::error::{LispError, LispResult};
use crate::eval::Machine;
use crate::printer::{display_val, print_val};
use crate::structural::{value_copy, value_equals};
use crate::value::{NativeFn, Object, ObjRef};

/// Every built-in, as bound in the global environment.
pub const PRIMITIVES: &[(&str, NativeFn)] = &[
    ("+", prim_add),
    ("-", prim_sub),
    ("*", prim_mul),
    ("/", prim_div),
    ("mod", prim_mod),
    ("<", prim_lt),
    (">", prim_gt),
    ("=", prim_eq),
    ("list", prim_list),
    ("cons", prim_cons),
    ("first", prim_first),
    ("rest", prim_rest),
    ("count", prim_count),
    ("str", prim_str),
    ("print", prim_print),
    ("println", prim_println),
    ("copy", prim_copy),
    ("gc", prim_gc),
    ("random", prim_random),
    ("load-dylib", prim_load_dylib),
    ("register", prim_register),
    ("null-ptr", prim_null_ptr),
];

macro_rules! check_arity {
    ($args:expr, $name:expr, $n:expr) => {
        if $args.len() != $n {
            return Err(LispError::Arity(format!(
                "{} expects {} args, got {}",
                $name,
                $n,
                $args.len()
            )));
        }
    };
}

fn type_error(m: &Machine, name: &str, expected: &str, got: ObjRef) -> LispError {
    LispError::Type(format!(
        "{} expects {}, got {}",
        name,
        expected,
        print_val(&m.heap, got)
    ))
}

// ============================================================================
// Arithmetic
// ============================================================================

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(x) => x,
        }
    }
}

fn num(m: &Machine, name: &str, r: ObjRef) -> LispResult<Num> {
    match m.heap.get(r) {
        Object::Integer(i) => Ok(Num::Int(*i)),
        Object::Float(x) => Ok(Num::Float(*x)),
        _ => Err(type_error(m, name, "numbers", r)),
    }
}

fn alloc_num(m: &mut Machine, n: Num) -> ObjRef {
    match n {
        Num::Int(i) => m.heap.int(i),
        Num::Float(x) => m.heap.float(x),
    }
}

/// Combine two numbers: integer op when both are integers, float op
/// otherwise.
fn combine(
    name: &str,
    a: Num,
    b: Num,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> LispResult<Num> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_op(x, y)
            .map(Num::Int)
            .ok_or_else(|| LispError::native(format!("{}: integer overflow or division by zero", name))),
        _ => Ok(Num::Float(float_op(a.as_f64(), b.as_f64()))),
    }
}

fn fold_numbers(
    m: &mut Machine,
    name: &str,
    args: &[ObjRef],
    identity: Num,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> LispResult<ObjRef> {
    let mut acc = identity;
    for &a in args {
        let n = num(m, name, a)?;
        acc = combine(name, acc, n, int_op, float_op)?;
    }
    Ok(alloc_num(m, acc))
}

fn prim_add(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    fold_numbers(m, "+", args, Num::Int(0), i64::checked_add, |x, y| x + y)
}

fn prim_mul(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    fold_numbers(m, "*", args, Num::Int(1), i64::checked_mul, |x, y| x * y)
}

/// `(- x)` negates; `(- x y ...)` subtracts left to right.
fn prim_sub(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    match args {
        [] => Err(LispError::Arity("- expects at least 1 arg".into())),
        [x] => {
            let n = num(m, "-", *x)?;
            let negated = combine("-", Num::Int(0), n, i64::checked_sub, |x, y| x - y)?;
            Ok(alloc_num(m, negated))
        }
        [first, rest @ ..] => {
            let mut acc = num(m, "-", *first)?;
            for &a in rest {
                let n = num(m, "-", a)?;
                acc = combine("-", acc, n, i64::checked_sub, |x, y| x - y)?;
            }
            Ok(alloc_num(m, acc))
        }
    }
}

fn prim_div(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    let (first, rest) = args
        .split_first()
        .ok_or_else(|| LispError::Arity("/ expects at least 1 arg".into()))?;
    let mut acc = num(m, "/", *first)?;
    for &a in rest {
        let n = num(m, "/", a)?;
        acc = combine("/", acc, n, i64::checked_div, |x, y| x / y)?;
    }
    Ok(alloc_num(m, acc))
}

fn prim_mod(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "mod", 2);
    match (num(m, "mod", args[0])?, num(m, "mod", args[1])?) {
        (Num::Int(x), Num::Int(y)) => x
            .checked_rem_euclid(y)
            .map(|r| m.heap.int(r))
            .ok_or_else(|| LispError::native("mod: division by zero")),
        (a, b) => Ok(m.heap.float(a.as_f64().rem_euclid(b.as_f64()))),
    }
}

fn compare(
    m: &mut Machine,
    name: &str,
    args: &[ObjRef],
    holds: fn(Ordering) -> bool,
) -> LispResult<ObjRef> {
    check_arity!(args, name, 2);
    let ordering = match (num(m, name, args[0])?, num(m, name, args[1])?) {
        (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
        (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
    };
    Ok(m.bool(ordering.map_or(false, holds)))
}

fn prim_lt(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    compare(m, "<", args, |o| o == Ordering::Less)
}

fn prim_gt(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    compare(m, ">", args, |o| o == Ordering::Greater)
}

/// Structural equality of every adjacent pair of arguments.
fn prim_eq(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    for pair in args.windows(2) {
        if !value_equals(&m.heap, pair[0], pair[1])? {
            return Ok(m.lisp_false());
        }
    }
    Ok(m.lisp_true())
}

// ============================================================================
// Lists
// ============================================================================

fn prim_list(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    Ok(m.heap.list(args))
}

fn prim_cons(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "cons", 2);
    Ok(m.heap.cons(args[0], args[1]))
}

fn prim_first(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "first", 1);
    if !m.heap.is_pair(args[0]) {
        return Err(type_error(m, "first", "a list", args[0]));
    }
    m.heap
        .car(args[0])
        .ok_or_else(|| LispError::native("Can't take first of empty list."))
}

fn prim_rest(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "rest", 1);
    if !m.heap.is_pair(args[0]) {
        return Err(type_error(m, "rest", "a list", args[0]));
    }
    Ok(m.heap.cdr(args[0]).unwrap_or(m.nil()))
}

fn prim_count(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "count", 1);
    let n = match m.heap.get(args[0]) {
        Object::Pair { .. } => m.heap.list_len(args[0]),
        Object::Str(s) => s.as_bytes().len(),
        Object::Environment { bindings, .. } => m.heap.list_len(*bindings),
        _ => return Err(type_error(m, "count", "a list, string or dict", args[0])),
    };
    Ok(m.heap.int(n as i64))
}

fn prim_copy(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "copy", 1);
    Ok(value_copy(&mut m.heap, args[0]))
}

// ============================================================================
// Strings and output
// ============================================================================

fn prim_str(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    let text: String = args.iter().map(|a| display_val(&m.heap, *a)).collect();
    Ok(m.heap.string(&text))
}

fn write_args(m: &Machine, args: &[ObjRef], newline: bool) -> LispResult<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for a in args {
        write!(out, "{}", display_val(&m.heap, *a))?;
    }
    if newline {
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn prim_print(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    write_args(m, args, false)?;
    Ok(m.nil())
}

fn prim_println(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    write_args(m, args, true)?;
    Ok(m.nil())
}

// ============================================================================
// Runtime
// ============================================================================

/// `(gc)` forces a full collection and returns nil.
fn prim_gc(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "gc", 0);
    m.collect();
    Ok(m.nil())
}

/// `(random n)` returns an integer in `[0, n)`.
fn prim_random(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "random", 1);
    let bound = match m.heap.get(args[0]) {
        Object::Integer(n) if *n > 0 => *n,
        _ => return Err(type_error(m, "random", "a positive integer", args[0])),
    };
    let mut rng = rand::thread_rng();
    Ok(m.heap.int(rng.gen_range(0..bound)))
}

// ============================================================================
// Foreign functions
// ============================================================================

fn string_arg(m: &Machine, name: &str, r: ObjRef) -> LispResult<String> {
    match m.heap.get(r) {
        Object::Str(s) => Ok(s.to_string_lossy().into_owned()),
        _ => Err(type_error(m, name, "a string", r)),
    }
}

/// `(load-dylib "name")`
fn prim_load_dylib(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "load-dylib", 1);
    let name = string_arg(m, "load-dylib", args[0])?;
    let id = m
        .dispatch
        .open(&name)
        .ok_or_else(|| LispError::Foreign(format!("Failed to open dylib '{}'", name)))?;
    Ok(m.heap.alloc(Object::Library { id, name }))
}

/// `(register dylib "symbol" '(arg-types...) return-type)`
fn prim_register(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "register", 4);
    let symbol = string_arg(m, "register", args[1])?;
    m.register_foreign(args[0], &symbol, args[2], args[3])
}

fn prim_null_ptr(m: &mut Machine, args: &[ObjRef]) -> LispResult<ObjRef> {
    check_arity!(args, "null-ptr", 0);
    Ok(m.heap.alloc(Object::Pointer(std::ptr::null_mut())))
}
