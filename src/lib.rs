pub mod config;
pub mod env;
pub mod error;
pub mod eval;
pub mod ffi;
pub mod gc;
pub mod globals;
pub mod heap;
pub mod matching;
pub mod primitives;
pub mod printer;
pub mod reader;
pub mod structural;
pub mod value;

pub use error::{LispError, LispResult};
pub use eval::Machine;
pub use value::{ObjRef, Object};
