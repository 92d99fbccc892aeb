/// Recoverable, user-level errors raised while reading or evaluating.
///
/// Messages usually embed the printed form of the offending value, rendered
/// by the operation that detected the fault. Stack-discipline violations are
/// not represented here: those are defects in the evaluator and panic.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LispError {
    /// Symbol lookup failed through the whole environment chain.
    #[error("Can't find '{0}' in environment.")]
    Unbound(String),

    /// Malformed special form. `form` is the printed offending form.
    #[error("{message}{form}")]
    Syntax { message: String, form: String },

    /// No `match` clause accepted the scrutinee.
    #[error("Failed to find a suitable match for: {0}")]
    NoMatch(String),

    #[error("Can't call non-function: {0}")]
    NotCallable(String),

    #[error("{0}")]
    Arity(String),

    /// Wrong argument type, mostly at the foreign-call boundary.
    #[error("Invalid type of arg: {0}")]
    Type(String),

    /// Keyword invoked as a function on a dictionary.
    #[error("{0}")]
    KeywordLookup(String),

    /// Structural equality is undefined for these variants.
    #[error("Can't compare {0} with {1}.")]
    Compare(String, String),

    /// Foreign function configuration or dispatch failure.
    #[error("{0}")]
    Foreign(String),

    /// Raised by a built-in native function.
    #[error("{0}")]
    Native(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LispError {
    fn from(e: std::io::Error) -> Self {
        LispError::Io(e.to_string())
    }
}

impl LispError {
    pub fn syntax(message: impl Into<String>, form: impl Into<String>) -> Self {
        LispError::Syntax {
            message: message.into(),
            form: form.into(),
        }
    }

    pub fn native(message: impl Into<String>) -> Self {
        LispError::Native(message.into())
    }
}

pub type LispResult<T> = Result<T, LispError>;
