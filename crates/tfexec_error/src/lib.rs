use std::borrow::Cow;
use std::error::Error;
use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Broad classification of an error.
///
/// Fatal kinds indicate a broken invariant somewhere upstream (planner,
/// code generation, device runtime). Callers should abort the whole
/// invocation when they see one instead of retrying or returning partial
/// results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
    /// Recoverable error caused by how the function or query was configured.
    Config,
    /// The kernel ran and reported a failure status.
    Execution,
    /// The compiled kernel did not uphold its side of the calling contract.
    ContractViolation,
    /// An internal invariant was violated.
    Internal,
    #[default]
    Other,
}

impl ErrorKind {
    pub const fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::ContractViolation | ErrorKind::Internal)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Execution => write!(f, "execution"),
            Self::ContractViolation => write!(f, "contract violation"),
            Self::Internal => write!(f, "internal"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug)]
pub struct DbError {
    inner: Box<DbErrorInner>,
}

#[derive(Debug)]
struct DbErrorInner {
    msg: String,
    kind: ErrorKind,
    source: Option<Box<dyn Error + Send + Sync>>,
    /// Extra key/value context attached to the error.
    fields: Vec<(Cow<'static, str>, String)>,
}

impl DbError {
    pub fn new(msg: impl Into<String>) -> Self {
        DbError {
            inner: Box::new(DbErrorInner {
                msg: msg.into(),
                kind: ErrorKind::Other,
                source: None,
                fields: Vec::new(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        let mut err = Self::new(msg);
        err.inner.source = Some(source);
        err
    }

    /// Shorthand for an error of kind `Config`.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(msg).with_kind(ErrorKind::Config)
    }

    /// Shorthand for an error of kind `Internal`.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(msg).with_kind(ErrorKind::Internal)
    }

    /// Shorthand for an error of kind `ContractViolation`.
    pub fn contract_violation(msg: impl Into<String>) -> Self {
        Self::new(msg).with_kind(ErrorKind::ContractViolation)
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.inner.kind = kind;
        self
    }

    pub fn with_field<V>(mut self, key: impl Into<Cow<'static, str>>, value: V) -> Self
    where
        V: fmt::Display,
    {
        self.inner.fields.push((key.into(), value.to_string()));
        self
    }

    pub fn get_msg(&self) -> &str {
        &self.inner.msg
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn is_fatal(&self) -> bool {
        self.inner.kind.is_fatal()
    }

    /// Get the value for a field if it exists.
    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;

        for (key, value) in &self.inner.fields {
            write!(f, "\n{key}: {value}")?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }

        Ok(())
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::fmt::Error> for DbError {
    fn from(value: std::fmt::Error) -> Self {
        DbError::with_source("Format error", Box::new(value))
    }
}

/// Attach context to foreign errors.
pub trait ResultExt<T, E> {
    fn context(self, msg: &'static str) -> Result<T, DbError>;

    fn context_fn<F>(self, f: F) -> Result<T, DbError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T, E> for std::result::Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T, DbError> {
        self.map_err(|e| DbError::with_source(msg, Box::new(e)))
    }

    fn context_fn<F>(self, f: F) -> Result<T, DbError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DbError::with_source(f(), Box::new(e)))
    }
}

pub trait OptionExt<T> {
    /// Return an internal error if the value is None.
    fn required(self, msg: &'static str) -> Result<T, DbError>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T, DbError> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::internal(format!("Missing required value: {msg}"))),
        }
    }
}

/// Return a "not implemented" error from the current function.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)+) => {{
        let msg = std::format!($($arg)+);
        return Err($crate::DbError::config(std::format!("Not yet implemented: {msg}")));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_fields_and_source() {
        let source = std::fmt::Error;
        let err = DbError::with_source("outer", Box::new(source)).with_field("code", 3);

        let s = err.to_string();
        assert!(s.starts_with("outer"));
        assert!(s.contains("code: 3"));
        assert!(s.contains("Error source"));
        assert_eq!(Some("3"), err.get_field("code"));
    }

    #[test]
    fn kinds_and_fatality() {
        assert!(!DbError::new("a").is_fatal());
        assert!(!DbError::config("a").is_fatal());
        assert!(DbError::internal("a").is_fatal());
        assert!(DbError::contract_violation("a").is_fatal());
        assert_eq!(
            ErrorKind::Execution,
            DbError::new("a").with_kind(ErrorKind::Execution).kind()
        );
    }

    #[test]
    fn required_on_none_is_internal() {
        let v: Option<u32> = None;
        let err = v.required("thing").unwrap_err();
        assert_eq!(ErrorKind::Internal, err.kind());
    }

    #[test]
    fn not_implemented_is_config() {
        fn f() -> Result<()> {
            not_implemented!("feature {}", 4)
        }
        let err = f().unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());
        assert!(err.get_msg().contains("feature 4"));
    }
}
