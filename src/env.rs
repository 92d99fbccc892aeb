//! Environment storage: binding lists and parent-chain lookup.
//!
//! An environment holds a list of `(key . value)` binding cells. Cells are
//! ordinary pairs, so `reset!` can rebind in place and every closure that
//! captured the environment observes the change.

use crate::error::{LispError, LispResult};
use crate::heap::Heap;
use crate::printer::print_val;
use crate::structural::value_equals;
use crate::value::{Object, ObjRef};

fn bindings_of(heap: &Heap, env: ObjRef) -> (Option<ObjRef>, ObjRef) {
    match heap.get(env) {
        Object::Environment { parent, bindings } => (*parent, *bindings),
        other => panic!("expected environment, got {}", other.kind()),
    }
}

/// Key comparison by content. Symbols are not interned.
///
/// Dictionary literals may use any value as a key, so two keys that have no
/// structural equality (two distinct closures, say) report `Compare`.
pub fn keys_equal(heap: &Heap, a: ObjRef, b: ObjRef) -> LispResult<bool> {
    if a == b {
        return Ok(true);
    }
    match (heap.get(a), heap.get(b)) {
        (Object::Symbol(x), Object::Symbol(y)) | (Object::Keyword(x), Object::Keyword(y)) => {
            Ok(x == y)
        }
        (Object::Symbol(_), _) | (Object::Keyword(_), _) => Ok(false),
        _ => value_equals(heap, a, b),
    }
}

/// Add a binding to this environment only, shadowing any older one.
pub fn extend(heap: &mut Heap, env: ObjRef, key: ObjRef, value: ObjRef) {
    let (_, bindings) = bindings_of(heap, env);
    let cell = heap.cons(key, value);
    let node = heap.cons(cell, bindings);
    if let Object::Environment { bindings, .. } = heap.get_mut(env) {
        *bindings = node;
    }
}

/// Rebind `key` in `env` itself if present, otherwise add it.
pub fn set(heap: &mut Heap, env: ObjRef, key: ObjRef, value: ObjRef) -> LispResult<()> {
    let (_, bindings) = bindings_of(heap, env);
    for cell in heap.list_items(bindings) {
        if let Some(k) = heap.car_of(cell) {
            if keys_equal(heap, k, key)? {
                heap.set_cdr(cell, Some(value));
                return Ok(());
            }
        }
    }
    extend(heap, env, key, value);
    Ok(())
}

/// Find the binding cell for `key`, walking the parent chain.
pub fn lookup_binding(heap: &Heap, env: ObjRef, key: ObjRef) -> LispResult<Option<ObjRef>> {
    let mut current = Some(env);
    while let Some(e) = current {
        let (parent, bindings) = bindings_of(heap, e);
        let mut node = Some(bindings);
        while let Some(n) = node {
            match heap.get(n) {
                Object::Pair {
                    car: Some(cell),
                    cdr,
                } => {
                    if let Some(k) = heap.car_of(*cell) {
                        if keys_equal(heap, k, key)? {
                            return Ok(Some(*cell));
                        }
                    }
                    node = *cdr;
                }
                _ => break,
            }
        }
        current = parent;
    }
    Ok(None)
}

pub fn lookup(heap: &Heap, env: ObjRef, key: ObjRef) -> LispResult<Option<ObjRef>> {
    Ok(lookup_binding(heap, env, key)?.and_then(|cell| heap.cdr(cell)))
}

/// The binding cells of one environment, newest first. Parents excluded.
pub fn binding_cells(heap: &Heap, env: ObjRef) -> Vec<ObjRef> {
    let (_, bindings) = bindings_of(heap, env);
    heap.list_items(bindings)
}

pub fn parent(heap: &Heap, env: ObjRef) -> Option<ObjRef> {
    bindings_of(heap, env).0
}

/// Destructure `args` against a callable's parameter list and bind them.
///
/// `&` binds every remaining argument, as a list, to the parameter after it.
pub fn extend_with_arguments(
    heap: &mut Heap,
    env: ObjRef,
    callable: ObjRef,
    params: ObjRef,
    args: &[ObjRef],
) -> LispResult<()> {
    let params = heap.list_items(params);
    let mut next_arg = 0;
    let mut i = 0;
    while i < params.len() {
        let param = params[i];
        let is_rest = heap.get(param).is_symbol_named("&");
        if is_rest {
            let rest_param = *params.get(i + 1).ok_or_else(|| {
                LispError::syntax("No parameter after '&' in ", print_val(heap, callable))
            })?;
            let rest = heap.list(&args[next_arg.min(args.len())..]);
            bind_param(heap, env, callable, rest_param, rest)?;
            return Ok(());
        }
        let arg = *args.get(next_arg).ok_or_else(|| {
            LispError::Arity(format!("Too few arguments to {}", print_val(heap, callable)))
        })?;
        bind_param(heap, env, callable, param, arg)?;
        next_arg += 1;
        i += 1;
    }
    if next_arg < args.len() {
        return Err(LispError::Arity(format!(
            "Too many arguments to {}",
            print_val(heap, callable)
        )));
    }
    Ok(())
}

fn bind_param(
    heap: &mut Heap,
    env: ObjRef,
    callable: ObjRef,
    param: ObjRef,
    value: ObjRef,
) -> LispResult<()> {
    if heap.get(param).as_symbol().is_none() {
        return Err(LispError::syntax(
            format!("Parameter must be a symbol, got {} in ", print_val(heap, param)),
            print_val(heap, callable),
        ));
    }
    extend(heap, env, param, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parent_chain() {
        let mut heap = Heap::new();
        let outer = heap.environment(None);
        let inner = heap.environment(Some(outer));
        let key = heap.symbol("x");
        let val = heap.int(5);
        extend(&mut heap, outer, key, val);
        let probe = heap.symbol("x");
        assert_eq!(lookup(&heap, inner, probe).unwrap(), Some(val));
    }

    #[test]
    fn extend_shadows_in_child_only() {
        let mut heap = Heap::new();
        let outer = heap.environment(None);
        let inner = heap.environment(Some(outer));
        let k1 = heap.symbol("x");
        let k2 = heap.symbol("x");
        let one = heap.int(1);
        let two = heap.int(2);
        extend(&mut heap, outer, k1, one);
        extend(&mut heap, inner, k2, two);
        assert_eq!(lookup(&heap, inner, k1).unwrap(), Some(two));
        assert_eq!(lookup(&heap, outer, k1).unwrap(), Some(one));
    }

    #[test]
    fn set_rebinds_existing_cell() {
        let mut heap = Heap::new();
        let env = heap.environment(None);
        let key = heap.symbol("x");
        let one = heap.int(1);
        let two = heap.int(2);
        extend(&mut heap, env, key, one);
        set(&mut heap, env, key, two).unwrap();
        assert_eq!(binding_cells(&heap, env).len(), 1);
        assert_eq!(lookup(&heap, env, key).unwrap(), Some(two));
    }

    #[test]
    fn symbols_and_keywords_do_not_collide() {
        let mut heap = Heap::new();
        let env = heap.environment(None);
        let sym = heap.symbol("a");
        let kw = heap.keyword("a");
        let one = heap.int(1);
        extend(&mut heap, env, kw, one);
        assert_eq!(lookup(&heap, env, sym).unwrap(), None);
        assert_eq!(lookup(&heap, env, kw).unwrap(), Some(one));
    }

    #[test]
    fn incomparable_keys_report_an_error() {
        use crate::ffi::LibraryId;

        let mut heap = Heap::new();
        let env = heap.environment(None);
        let stored = heap.alloc(Object::Library {
            id: LibraryId(0),
            name: "liba".into(),
        });
        let other = heap.alloc(Object::Library {
            id: LibraryId(1),
            name: "libb".into(),
        });
        let one = heap.int(1);
        extend(&mut heap, env, stored, one);

        assert_eq!(lookup(&heap, env, stored).unwrap(), Some(one));
        assert!(matches!(lookup(&heap, env, other), Err(LispError::Compare(..))));
        let two = heap.int(2);
        assert!(matches!(set(&mut heap, env, other, two), Err(LispError::Compare(..))));
        assert_eq!(binding_cells(&heap, env).len(), 1);

        let sym = heap.symbol("liba");
        assert_eq!(lookup(&heap, env, sym).unwrap(), None);
    }

    #[test]
    fn rest_parameter_collects_remaining_args() {
        let mut heap = Heap::new();
        let env = heap.environment(None);
        let a = heap.symbol("a");
        let amp = heap.symbol("&");
        let rest = heap.symbol("rest");
        let params = heap.list(&[a, amp, rest]);
        let args: Vec<_> = (1..=3).map(|i| heap.int(i)).collect();
        extend_with_arguments(&mut heap, env, params, params, &args).unwrap();
        assert_eq!(lookup(&heap, env, a).unwrap(), Some(args[0]));
        let bound = lookup(&heap, env, rest).unwrap().unwrap();
        assert_eq!(heap.list_items(bound), &args[1..]);
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let mut heap = Heap::new();
        let env = heap.environment(None);
        let a = heap.symbol("a");
        let params = heap.list(&[a]);
        let none: [ObjRef; 0] = [];
        let err = extend_with_arguments(&mut heap, env, params, params, &none).unwrap_err();
        assert!(matches!(err, LispError::Arity(_)));
        let two = [heap.int(1), heap.int(2)];
        let err = extend_with_arguments(&mut heap, env, params, params, &two).unwrap_err();
        assert!(matches!(err, LispError::Arity(_)));
    }
}
