//! Foreign-function marshaling.
//!
//! Foreign functions carry a list of declared parameter types and a
//! declared return type. At call time each argument is checked against its
//! declared type and converted to a [`NativeArg`]; the call itself goes
//! through a [`CallDispatch`] so the evaluator never links a platform
//! library loader directly.
//!
//! Type descriptors are keywords (`:int`, `:float`, `:string`, `:bool`,
//! `:void`), pointer lists `(:ptr T)`, and `(:ref T)`, which declares the
//! same parameter as `T`.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};

use log::trace;

use crate::error::{LispError, LispResult};
use crate::eval::Machine;
use crate::printer::print_val;
use crate::value::{CallDescriptor, ForeignFn, Object, ObjRef};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LibraryId(pub u32);

/// A resolved native symbol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EntryPoint(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NativeKind {
    Int,
    Float,
    Bool,
    Str,
    Void,
    Ptr,
}

/// One marshaled argument.
#[derive(Clone, Copy, Debug)]
pub enum NativeArg {
    Int(i64),
    Float(f64),
    /// Points into the interpreter's string buffer. The buffer is pinned
    /// for the rest of the session.
    Str(*const c_char),
    Ptr(*mut c_void),
}

impl NativeArg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            NativeArg::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            NativeArg::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<*mut c_void> {
        match self {
            NativeArg::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    /// Read a string argument.
    ///
    /// # Safety
    /// The pointer must come from the interpreter, which keeps it valid.
    pub unsafe fn as_c_str<'a>(&self) -> Option<&'a CStr> {
        match self {
            NativeArg::Str(p) if !p.is_null() => Some(CStr::from_ptr(*p)),
            _ => None,
        }
    }
}

/// A raw native result, before conversion back into a heap value.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// `None` is a NULL string.
    Str(Option<String>),
    Void,
    Ptr(*mut c_void),
}

/// The platform seam: library loading, symbol resolution and the call.
pub trait CallDispatch {
    fn open(&mut self, name: &str) -> Option<LibraryId>;
    fn resolve(&mut self, library: LibraryId, symbol: &str) -> Option<EntryPoint>;
    fn call(
        &mut self,
        entry: EntryPoint,
        args: &[NativeArg],
        ret: NativeKind,
    ) -> Result<NativeValue, String>;
}

pub type Callback = Box<dyn FnMut(&[NativeArg]) -> NativeValue>;

struct Library {
    name: String,
    symbols: HashMap<String, EntryPoint>,
}

/// In-process libraries made of Rust callbacks.
#[derive(Default)]
pub struct LibraryRegistry {
    libraries: Vec<Library>,
    entries: Vec<(String, Callback)>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `symbol` to `library`, creating the library on first use.
    pub fn define<F>(&mut self, library: &str, symbol: &str, f: F) -> EntryPoint
    where
        F: FnMut(&[NativeArg]) -> NativeValue + 'static,
    {
        let entry = EntryPoint(self.entries.len() as u32);
        self.entries.push((symbol.to_string(), Box::new(f)));
        let index = match self.libraries.iter().position(|l| l.name == library) {
            Some(i) => i,
            None => {
                self.libraries.push(Library {
                    name: library.to_string(),
                    symbols: HashMap::new(),
                });
                self.libraries.len() - 1
            }
        };
        self.libraries[index]
            .symbols
            .insert(symbol.to_string(), entry);
        entry
    }
}

impl CallDispatch for LibraryRegistry {
    fn open(&mut self, name: &str) -> Option<LibraryId> {
        self.libraries
            .iter()
            .position(|l| l.name == name)
            .map(|i| LibraryId(i as u32))
    }

    fn resolve(&mut self, library: LibraryId, symbol: &str) -> Option<EntryPoint> {
        self.libraries
            .get(library.0 as usize)?
            .symbols
            .get(symbol)
            .copied()
    }

    fn call(
        &mut self,
        entry: EntryPoint,
        args: &[NativeArg],
        _ret: NativeKind,
    ) -> Result<NativeValue, String> {
        let (name, callback) = self
            .entries
            .get_mut(entry.0 as usize)
            .ok_or_else(|| format!("No native entry point #{}", entry.0))?;
        trace!("native call {} with {} args", name, args.len());
        Ok(callback(args))
    }
}

impl Machine {
    /// Build a foreign function value for `symbol` in `library`. An
    /// unresolvable symbol gives a stub that fails when called.
    pub fn register_foreign(
        &mut self,
        library: ObjRef,
        symbol: &str,
        arg_types: ObjRef,
        return_type: ObjRef,
    ) -> LispResult<ObjRef> {
        let id = match self.heap.get(library) {
            Object::Library { id, .. } => *id,
            _ => {
                return Err(LispError::Type(format!(
                    "expected a dylib, got {}",
                    print_val(&self.heap, library)
                )))
            }
        };
        if !self.heap.is_pair(arg_types) {
            return Err(LispError::Foreign(format!(
                "Argument types of '{}' must be a list: {}",
                symbol,
                print_val(&self.heap, arg_types)
            )));
        }
        let entry = self.dispatch.resolve(id, symbol);
        if entry.is_none() {
            log::warn!("Unable to resolve '{}', registering a stub", symbol);
        }
        let arity = self.heap.list_len(arg_types);
        Ok(self.heap.alloc(Object::Foreign(ForeignFn {
            descriptor: CallDescriptor {
                name: symbol.to_string(),
                arity,
            },
            entry,
            arg_types,
            return_type,
        })))
    }

    /// Marshal `args`, call through the dispatcher and push the converted
    /// result.
    pub(crate) fn apply_foreign(&mut self, function: ObjRef, args: &[ObjRef]) -> LispResult<()> {
        let foreign = match self.heap.get(function) {
            Object::Foreign(f) => f.clone(),
            other => panic!("apply_foreign on {}", other.kind()),
        };
        let entry = foreign.entry.ok_or_else(|| {
            LispError::Foreign(format!(
                "Foreign function '{}' has no entry point.",
                foreign.descriptor.name
            ))
        })?;

        let arity = foreign.descriptor.arity;
        if args.len() != arity {
            let which = if args.len() > arity { "many" } else { "few" };
            return Err(LispError::Arity(format!(
                "Too {} arguments to {} (expects {}, got {})",
                which,
                print_val(&self.heap, function),
                arity,
                args.len()
            )));
        }
        let types = self.heap.list_items(foreign.arg_types);

        let ret = self.type_kind(foreign.return_type).ok_or_else(|| {
            LispError::Foreign(format!(
                "Returning what? {}",
                print_val(&self.heap, foreign.return_type)
            ))
        })?;

        let mut native_args = Vec::with_capacity(args.len());
        for (&arg, &declared) in args.iter().zip(&types) {
            // Pinned before its type is checked, and never unpinned: a value
            // rejected below stays alive with everything it references.
            self.heap.mark_external(arg);
            let declared = self.strip_ref(declared);
            let kind = match self.type_kind(declared) {
                Some(k @ (NativeKind::Int | NativeKind::Float | NativeKind::Str | NativeKind::Ptr)) => k,
                _ => {
                    return Err(LispError::Foreign(format!(
                        "Can't call foreign function with argument of type {}",
                        print_val(&self.heap, declared)
                    )))
                }
            };
            native_args.push(self.marshal(arg, kind)?);
        }

        let value = self
            .dispatch
            .call(entry, &native_args, ret)
            .map_err(LispError::Foreign)?;
        let result = self.unmarshal(value, ret)?;
        self.push(result);
        Ok(())
    }

    /// `(:ref T)` declares the same parameter as `T`.
    fn strip_ref(&self, ty: ObjRef) -> ObjRef {
        let heap = &self.heap;
        match heap.car_of(ty) {
            Some(head) if heap.get(head).is_keyword_named("ref") => heap.nth(ty, 1).unwrap_or(ty),
            _ => ty,
        }
    }

    fn type_kind(&self, ty: ObjRef) -> Option<NativeKind> {
        match self.heap.get(ty) {
            Object::Keyword(k) => match k.as_str() {
                "int" => Some(NativeKind::Int),
                "float" => Some(NativeKind::Float),
                "string" => Some(NativeKind::Str),
                "bool" => Some(NativeKind::Bool),
                "void" => Some(NativeKind::Void),
                _ => None,
            },
            Object::Pair { car: Some(head), .. } if self.heap.get(*head).is_keyword_named("ptr") => {
                Some(NativeKind::Ptr)
            }
            _ => None,
        }
    }

    fn marshal(&self, arg: ObjRef, kind: NativeKind) -> LispResult<NativeArg> {
        match (kind, self.heap.get(arg)) {
            (NativeKind::Int, Object::Integer(i)) => Ok(NativeArg::Int(*i)),
            (NativeKind::Float, Object::Float(x)) => Ok(NativeArg::Float(*x)),
            (NativeKind::Str, Object::Str(s)) => Ok(NativeArg::Str(s.as_ptr())),
            (NativeKind::Ptr, Object::Pointer(p)) => Ok(NativeArg::Ptr(*p)),
            _ => Err(LispError::Type(print_val(&self.heap, arg))),
        }
    }

    fn unmarshal(&mut self, value: NativeValue, ret: NativeKind) -> LispResult<ObjRef> {
        let result = match (ret, value) {
            (NativeKind::Int, NativeValue::Int(i)) => self.heap.int(i),
            (NativeKind::Float, NativeValue::Float(x)) => self.heap.float(x),
            (NativeKind::Bool, NativeValue::Bool(b)) => self.bool(b),
            (NativeKind::Bool, NativeValue::Int(i)) => self.bool(i != 0),
            (NativeKind::Str, NativeValue::Str(s)) => self.heap.string(s.as_deref().unwrap_or("")),
            (NativeKind::Ptr, NativeValue::Ptr(p)) => self.heap.alloc(Object::Pointer(p)),
            (NativeKind::Void, _) => self.nil(),
            (kind, other) => {
                return Err(LispError::Foreign(format!(
                    "Native call returned {:?} for declared type {:?}",
                    other, kind
                )))
            }
        };
        Ok(result)
    }
}
