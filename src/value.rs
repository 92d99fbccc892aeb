use std::ffi::{c_void, CString};
use std::fmt;

use crate::error::LispResult;
use crate::eval::Machine;
use crate::ffi::{EntryPoint, LibraryId};

/// Handle to an object in the heap. This is the GC handle.
///
/// The generation is bumped every time a slot is freed, so a handle that
/// outlives its object is detected on the next access instead of silently
/// aliasing whatever got allocated into the slot afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ObjRef {
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({}@{})", self.index, self.generation)
    }
}

/// A host function callable from Lisp. Receives the evaluated argument vector.
pub type NativeFn = fn(&mut Machine, &[ObjRef]) -> LispResult<ObjRef>;

/// Shared shape of lambdas and macros.
#[derive(Clone, Copy, Debug)]
pub struct Closure {
    pub params: ObjRef,
    pub body: ObjRef,
    /// The defining environment.
    pub env: ObjRef,
    /// The whole `(fn ...)` / `(macro ...)` form, kept for diagnostics.
    pub code: ObjRef,
}

/// Native call descriptor: the auxiliary storage of a foreign function.
#[derive(Clone, Debug)]
pub struct CallDescriptor {
    pub name: String,
    pub arity: usize,
}

#[derive(Clone, Debug)]
pub struct ForeignFn {
    pub descriptor: CallDescriptor,
    /// `None` for a signature-only stub whose symbol could not be resolved.
    pub entry: Option<EntryPoint>,
    /// Declared parameter types, a list of type descriptors.
    pub arg_types: ObjRef,
    pub return_type: ObjRef,
}

/// One heap object. Every variant of the language's value model.
pub enum Object {
    /// Cons cell. The empty list is a pair with both fields absent.
    Pair {
        car: Option<ObjRef>,
        cdr: Option<ObjRef>,
    },
    Integer(i64),
    Float(f64),
    Str(CString),
    Symbol(String),
    Keyword(String),
    Native {
        name: &'static str,
        func: NativeFn,
    },
    Library {
        id: LibraryId,
        name: String,
    },
    Pointer(*mut c_void),
    Foreign(ForeignFn),
    Lambda(Closure),
    Macro(Closure),
    Environment {
        parent: Option<ObjRef>,
        /// List of `(key . value)` binding cells.
        bindings: ObjRef,
    },
}

/// Variant tag, for diagnostics and cheap dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Pair,
    Integer,
    Float,
    Str,
    Symbol,
    Keyword,
    Native,
    Library,
    Pointer,
    Foreign,
    Lambda,
    Macro,
    Environment,
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::Pair { .. } => Kind::Pair,
            Object::Integer(_) => Kind::Integer,
            Object::Float(_) => Kind::Float,
            Object::Str(_) => Kind::Str,
            Object::Symbol(_) => Kind::Symbol,
            Object::Keyword(_) => Kind::Keyword,
            Object::Native { .. } => Kind::Native,
            Object::Library { .. } => Kind::Library,
            Object::Pointer(_) => Kind::Pointer,
            Object::Foreign(_) => Kind::Foreign,
            Object::Lambda(_) => Kind::Lambda,
            Object::Macro(_) => Kind::Macro,
            Object::Environment { .. } => Kind::Environment,
        }
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, Object::Pair { .. })
    }

    /// True for the empty-list terminator.
    pub fn is_empty_list(&self) -> bool {
        matches!(self, Object::Pair { car: None, .. })
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Object::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&str> {
        match self {
            Object::Keyword(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            Object::Lambda(c) | Object::Macro(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_symbol_named(&self, name: &str) -> bool {
        self.as_symbol() == Some(name)
    }

    pub fn is_keyword_named(&self, name: &str) -> bool {
        self.as_keyword() == Some(name)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Pair => "list",
            Kind::Integer => "int",
            Kind::Float => "float",
            Kind::Str => "string",
            Kind::Symbol => "symbol",
            Kind::Keyword => "keyword",
            Kind::Native => "primop",
            Kind::Library => "dylib",
            Kind::Pointer => "ptr",
            Kind::Foreign => "foreign",
            Kind::Lambda => "lambda",
            Kind::Macro => "macro",
            Kind::Environment => "dict",
        };
        f.write_str(name)
    }
}
