use crate::env;
use crate::heap::Heap;
use crate::primitives::PRIMITIVES;
use crate::value::{Object, ObjRef};

/// Build the initial global environment.
/// Pre-installs:
///   - true, false = the canonical truth symbols
///   - nil = the canonical empty list
///   - every built-in native function
pub fn build_globals(heap: &mut Heap, nil: ObjRef, lisp_true: ObjRef, lisp_false: ObjRef) -> ObjRef {
    let global = heap.environment(None);

    for (name, value) in [("true", lisp_true), ("false", lisp_false), ("nil", nil)] {
        let key = heap.symbol(name);
        env::extend(heap, global, key, value);
    }

    for &(name, func) in PRIMITIVES {
        let key = heap.symbol(name);
        let native = heap.alloc(Object::Native { name, func });
        env::extend(heap, global, key, native);
    }

    global
}
