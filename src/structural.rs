//! Structural equality, structural copy and truthiness.

use crate::env;
use crate::error::{LispError, LispResult};
use crate::heap::Heap;
use crate::printer::print_val;
use crate::value::{ForeignFn, Object, ObjRef};

/// Structural equality.
///
/// Identity short-circuits. Text compares by content, pairs and
/// environments compare deeply. Callables have no content equality and
/// comparing two distinct ones is an error.
pub fn value_equals(heap: &Heap, a: ObjRef, b: ObjRef) -> LispResult<bool> {
    if a == b {
        return Ok(true);
    }
    let (oa, ob) = (heap.get(a), heap.get(b));
    if oa.kind() != ob.kind() {
        return Ok(false);
    }
    match (oa, ob) {
        (Object::Str(x), Object::Str(y)) => Ok(x == y),
        (Object::Symbol(x), Object::Symbol(y)) | (Object::Keyword(x), Object::Keyword(y)) => {
            Ok(x == y)
        }
        (Object::Pointer(x), Object::Pointer(y)) => Ok(x == y),
        (Object::Integer(x), Object::Integer(y)) => Ok(x == y),
        (Object::Float(x), Object::Float(y)) => Ok(x == y),
        (Object::Pair { .. }, Object::Pair { .. }) => pairs_equal(heap, a, b),
        (Object::Environment { .. }, Object::Environment { .. }) => envs_equal(heap, a, b),
        _ => Err(LispError::Compare(print_val(heap, a), print_val(heap, b))),
    }
}

/// Equality where either side may be absent.
fn opt_equals(heap: &Heap, a: Option<ObjRef>, b: Option<ObjRef>) -> LispResult<bool> {
    match (a, b) {
        (None, None) => Ok(true),
        (Some(a), Some(b)) => value_equals(heap, a, b),
        _ => Ok(false),
    }
}

fn pairs_equal(heap: &Heap, a: ObjRef, b: ObjRef) -> LispResult<bool> {
    let (mut pa, mut pb) = (a, b);
    loop {
        if !opt_equals(heap, heap.car(pa), heap.car(pb))? {
            return Ok(false);
        }
        match (heap.cdr(pa), heap.cdr(pb)) {
            (None, None) => return Ok(true),
            (Some(da), Some(db)) => {
                if da == db {
                    return Ok(true);
                }
                if heap.is_pair(da) && heap.is_pair(db) {
                    pa = da;
                    pb = db;
                } else {
                    return value_equals(heap, da, db);
                }
            }
            _ => return Ok(false),
        }
    }
}

/// Every binding of one side must have an equal counterpart visible from
/// the other, in both directions, and the parents must be equal.
fn envs_equal(heap: &Heap, a: ObjRef, b: ObjRef) -> LispResult<bool> {
    if !opt_equals(heap, env::parent(heap, a), env::parent(heap, b))? {
        return Ok(false);
    }
    Ok(bindings_covered(heap, a, b)? && bindings_covered(heap, b, a)?)
}

fn bindings_covered(heap: &Heap, from: ObjRef, into: ObjRef) -> LispResult<bool> {
    for cell in env::binding_cells(heap, from) {
        let key = match heap.car(cell) {
            Some(key) => key,
            None => return Ok(false),
        };
        let other = match env::lookup_binding(heap, into, key)? {
            Some(other) => other,
            None => return Ok(false),
        };
        if !opt_equals(heap, heap.cdr(cell), heap.cdr(other))? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Structural copy.
///
/// Pairs and environments are copied deeply, scalars and strings by value.
/// Lambdas and macros are returned as-is: they are closures and must keep
/// their identity and their captured environment.
pub fn value_copy(heap: &mut Heap, r: ObjRef) -> ObjRef {
    let copied = match heap.get(r) {
        Object::Pair { .. } => None,
        Object::Lambda(_) | Object::Macro(_) => return r,
        Object::Environment { parent, bindings } => {
            let (parent, bindings) = (*parent, *bindings);
            let bindings = copy_list(heap, bindings);
            return heap.alloc(Object::Environment { parent, bindings });
        }
        Object::Foreign(f) => {
            let f = f.clone();
            let arg_types = value_copy(heap, f.arg_types);
            let return_type = value_copy(heap, f.return_type);
            return heap.alloc(Object::Foreign(ForeignFn {
                arg_types,
                return_type,
                ..f
            }));
        }
        Object::Integer(i) => Some(Object::Integer(*i)),
        Object::Float(x) => Some(Object::Float(*x)),
        Object::Str(s) => Some(Object::Str(s.clone())),
        Object::Symbol(s) => Some(Object::Symbol(s.clone())),
        Object::Keyword(s) => Some(Object::Keyword(s.clone())),
        Object::Native { name, func } => Some(Object::Native {
            name: *name,
            func: *func,
        }),
        Object::Library { id, name } => Some(Object::Library {
            id: *id,
            name: name.clone(),
        }),
        Object::Pointer(p) => Some(Object::Pointer(*p)),
    };
    match copied {
        Some(object) => heap.alloc(object),
        None => copy_list(heap, r),
    }
}

/// Copy a list spine node by node, copying each element. A non-pair tail
/// ends the copy and is linked by reference.
fn copy_list(heap: &mut Heap, list: ObjRef) -> ObjRef {
    let head = heap.empty_list();
    let mut out = head;
    let mut cursor = list;
    loop {
        let (car, cdr) = (heap.car(cursor), heap.cdr(cursor));
        let new_car = car.map(|c| value_copy(heap, c));
        heap.set_car(out, new_car);
        match cdr {
            None => break,
            Some(next) if heap.is_pair(next) => {
                let node = heap.empty_list();
                heap.set_cdr(out, Some(node));
                out = node;
                cursor = next;
            }
            Some(tail) => {
                heap.set_cdr(out, Some(tail));
                break;
            }
        }
    }
    head
}

/// Everything except the symbol `false` is true.
pub fn is_true(heap: &Heap, r: ObjRef) -> bool {
    !heap.get(r).is_symbol_named("false")
}
