use crate::heap::Heap;
use crate::value::{Object, ObjRef};

/// Print a value so the reader could read it back: strings quoted and
/// escaped.
pub fn print_val(heap: &Heap, val: ObjRef) -> String {
    let mut out = String::new();
    print_inner(heap, val, true, &mut out, 0);
    out
}

/// Print a value for humans: strings appear as their raw text.
pub fn display_val(heap: &Heap, val: ObjRef) -> String {
    let mut out = String::new();
    print_inner(heap, val, false, &mut out, 0);
    out
}

fn print_inner(heap: &Heap, val: ObjRef, prn: bool, out: &mut String, depth: usize) {
    if depth > 1000 {
        out.push_str("...");
        return;
    }

    match heap.get(val) {
        Object::Integer(i) => out.push_str(&i.to_string()),
        Object::Float(x) => out.push_str(&format_float(*x)),
        Object::Str(s) => {
            let text = s.to_string_lossy();
            if prn {
                print_string(&text, out);
            } else {
                out.push_str(&text);
            }
        }
        Object::Symbol(name) => out.push_str(name),
        Object::Keyword(name) => {
            out.push(':');
            out.push_str(name);
        }
        Object::Native { name, .. } => {
            out.push_str("<primop:");
            out.push_str(name);
            out.push('>');
        }
        Object::Library { name, .. } => {
            out.push_str("<dylib:");
            out.push_str(name);
            out.push('>');
        }
        Object::Pointer(p) => out.push_str(&format!("{:p}", *p)),
        Object::Foreign(f) => {
            out.push_str("<foreign:");
            out.push_str(&f.descriptor.name);
            out.push('>');
        }
        Object::Macro(_) => out.push_str("<macro>"),
        Object::Lambda(c) => {
            out.push_str("(fn ");
            print_inner(heap, c.params, prn, out, depth + 1);
            out.push(' ');
            print_inner(heap, c.body, prn, out, depth + 1);
            out.push(')');
        }
        Object::Environment { bindings, .. } => {
            out.push('{');
            // Bindings are stored newest first.
            let cells = heap.list_items(*bindings);
            for (i, cell) in cells.iter().rev().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                match (heap.car_of(*cell), heap.cdr_of(*cell)) {
                    (Some(k), Some(v)) => {
                        print_inner(heap, k, prn, out, depth + 1);
                        out.push(' ');
                        print_inner(heap, v, prn, out, depth + 1);
                    }
                    _ => out.push('?'),
                }
            }
            out.push('}');
        }
        Object::Pair { car, cdr } => {
            let car = match car {
                Some(car) => *car,
                None => {
                    out.push_str("()");
                    return;
                }
            };

            // (quote x) -> 'x
            if heap.get(car).is_symbol_named("quote") {
                if let Some(quoted) = cdr.and_then(|rest| heap.car_of(rest)) {
                    let single = cdr
                        .and_then(|rest| heap.cdr_of(rest))
                        .map_or(true, |tail| heap.is_empty_list(tail));
                    if single {
                        out.push('\'');
                        print_inner(heap, quoted, prn, out, depth + 1);
                        return;
                    }
                }
            }

            out.push('(');
            print_inner(heap, car, prn, out, depth + 1);
            let mut current = *cdr;
            while let Some(node) = current {
                match heap.get(node) {
                    Object::Pair { car: None, .. } => break,
                    Object::Pair {
                        car: Some(item),
                        cdr,
                    } => {
                        out.push(' ');
                        print_inner(heap, *item, prn, out, depth + 1);
                        current = *cdr;
                    }
                    _ => {
                        out.push_str(" . ");
                        print_inner(heap, node, prn, out, depth + 1);
                        break;
                    }
                }
            }
            out.push(')');
        }
    }
}

fn format_float(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

fn print_string(text: &str, out: &mut String) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
}
