//! Compile-time and runtime error types.

use std::fmt;

use thiserror::Error;

/// The snippet text could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("SyntaxError: {message} (line {line}, column {column})")]
pub struct SyntaxError {
    message: String,
    line: usize,
    column: usize,
}

impl SyntaxError {
    pub(crate) fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }

    /// Human-readable description of the problem.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// One-based snippet line.
    #[must_use]
    pub const fn line(&self) -> usize {
        self.line
    }

    /// One-based column.
    #[must_use]
    pub const fn column(&self) -> usize {
        self.column
    }
}

/// Result alias for parsing.
pub type ParseResult<T> = Result<T, SyntaxError>;

/// Built-in exception classes visible to snippets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Root of every catchable exception.
    Exception,
    /// Numeric failures.
    ArithmeticError,
    /// Failed key or index lookups.
    LookupError,
    /// Argument has the right type but an unusable value.
    ValueError,
    /// Operation applied to a value of the wrong type.
    TypeError,
    /// Missing mapping key.
    KeyError,
    /// Sequence index out of range.
    IndexError,
    /// Unbound name.
    NameError,
    /// Missing attribute.
    AttributeError,
    /// Division or modulo by zero.
    ZeroDivisionError,
    /// Integer result does not fit in 64 bits.
    OverflowError,
    /// Generic runtime failure.
    RuntimeError,
    /// Call depth exceeded the configured limit.
    RecursionError,
    /// A value would exceed the size the engine allocates.
    MemoryError,
    /// Placeholder for unimplemented behaviour.
    NotImplementedError,
    /// Unknown module in an import statement.
    ImportError,
    /// Failed `assert` statement.
    AssertionError,
    /// Lookup of a capability that is not bound.
    CapabilityNotFound,
    /// A capability backend failed.
    CapabilityInvocationError,
}

impl ExceptionKind {
    /// Every kind, in the order they are bound into the prelude.
    pub const ALL: [Self; 19] = [
        Self::Exception,
        Self::ArithmeticError,
        Self::LookupError,
        Self::ValueError,
        Self::TypeError,
        Self::KeyError,
        Self::IndexError,
        Self::NameError,
        Self::AttributeError,
        Self::ZeroDivisionError,
        Self::OverflowError,
        Self::RuntimeError,
        Self::RecursionError,
        Self::MemoryError,
        Self::NotImplementedError,
        Self::ImportError,
        Self::AssertionError,
        Self::CapabilityNotFound,
        Self::CapabilityInvocationError,
    ];

    /// Class name as written in snippets.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Exception => "Exception",
            Self::ArithmeticError => "ArithmeticError",
            Self::LookupError => "LookupError",
            Self::ValueError => "ValueError",
            Self::TypeError => "TypeError",
            Self::KeyError => "KeyError",
            Self::IndexError => "IndexError",
            Self::NameError => "NameError",
            Self::AttributeError => "AttributeError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::OverflowError => "OverflowError",
            Self::RuntimeError => "RuntimeError",
            Self::RecursionError => "RecursionError",
            Self::MemoryError => "MemoryError",
            Self::NotImplementedError => "NotImplementedError",
            Self::ImportError => "ImportError",
            Self::AssertionError => "AssertionError",
            Self::CapabilityNotFound => "CapabilityNotFound",
            Self::CapabilityInvocationError => "CapabilityInvocationError",
        }
    }

    /// Direct base class, `None` for [`ExceptionKind::Exception`].
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Exception => None,
            Self::ZeroDivisionError | Self::OverflowError => Some(Self::ArithmeticError),
            Self::KeyError | Self::IndexError | Self::CapabilityNotFound => Some(Self::LookupError),
            Self::RecursionError | Self::NotImplementedError | Self::CapabilityInvocationError => {
                Some(Self::RuntimeError)
            }
            _ => Some(Self::Exception),
        }
    }

    /// Returns `true` if `self` is `other` or derives from it.
    #[must_use]
    pub fn is_subclass_of(self, other: Self) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime exception raised inside a snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    kind: ExceptionKind,
    message: String,
    line: Option<usize>,
}

impl Exception {
    /// Creates an exception of the given class.
    #[must_use]
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    /// Shorthand for a [`ExceptionKind::TypeError`].
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::TypeError, message)
    }

    /// Shorthand for a [`ExceptionKind::ValueError`].
    #[must_use]
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::ValueError, message)
    }

    /// Shorthand for a [`ExceptionKind::RuntimeError`].
    #[must_use]
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::RuntimeError, message)
    }

    /// Exception class.
    #[must_use]
    pub const fn kind(&self) -> ExceptionKind {
        self.kind
    }

    /// Message passed when the exception was created.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Snippet line where the exception was first raised, if known.
    #[must_use]
    pub const fn line(&self) -> Option<usize> {
        self.line
    }

    /// Records the raising line unless one is already set.
    #[must_use]
    pub fn at_line(mut self, line: usize) -> Self {
        self.line.get_or_insert(line);
        self
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)?;
        } else {
            write!(f, "{}: {}", self.kind, self.message)?;
        }
        if let Some(line) = self.line {
            write!(f, " (line {line})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

/// Result alias for evaluation.
pub type ExecResult<T> = Result<T, Exception>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_walks_to_root() {
        assert!(ExceptionKind::KeyError.is_subclass_of(ExceptionKind::LookupError));
        assert!(ExceptionKind::CapabilityInvocationError.is_subclass_of(ExceptionKind::RuntimeError));
        assert!(ExceptionKind::ZeroDivisionError.is_subclass_of(ExceptionKind::Exception));
        assert!(!ExceptionKind::ValueError.is_subclass_of(ExceptionKind::TypeError));
    }

    #[test]
    fn display_includes_line_once() {
        let exc = Exception::value_error("bad input").at_line(3).at_line(9);
        assert_eq!(exc.to_string(), "ValueError: bad input (line 3)");
    }
}
