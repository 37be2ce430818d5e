//! Error types for the xmldb core.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] xmldb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The broker pool has been shut down.
    #[error("broker pool is closed")]
    PoolClosed,

    /// No broker became available within the configured wait.
    #[error("no broker available after waiting {waited:?}")]
    PoolExhausted {
        /// How long the caller waited.
        waited: Duration,
    },

    /// Unknown, deactivated or wrongly authenticated identity.
    #[error("authentication failed for '{user}': {reason}")]
    Authentication {
        /// The account name presented.
        user: String,
        /// Why it was refused.
        reason: String,
    },

    /// Two attributes with the same qualified name on one element.
    #[error("name collision: duplicate attribute {name}")]
    NameCollision {
        /// The colliding qualified name.
        name: String,
    },

    /// Typed values that cannot be compared with each other.
    #[error("type mismatch: cannot compare {actual} with {expected}")]
    IndexTypeMismatch {
        /// The type required by the index or left operand.
        expected: String,
        /// The type that was supplied.
        actual: String,
    },

    /// Forced journal write failed; the owning transaction was aborted.
    #[error("journal write failed: {message}")]
    JournalWrite {
        /// Description of the failure.
        message: String,
    },

    /// The journal could not be replayed at start-up.
    #[error("recovery failed: {message}")]
    Recovery {
        /// Description of the failure.
        message: String,
    },

    /// Malformed query source or unresolved static reference.
    #[error("query compilation error [{code}]: {message}")]
    QueryCompilation {
        /// XQuery error code, e.g. `XPST0003`.
        code: String,
        /// Description of the error.
        message: String,
    },

    /// A capability the query needs is switched off by configuration.
    #[error("host bindings are disabled: cannot bind namespace {namespace}")]
    BindingDisabled {
        /// The namespace URI of the binding that was requested.
        namespace: String,
    },

    /// Dynamic error raised while evaluating a query.
    #[error("evaluation error [{code}]: {message}")]
    Evaluation {
        /// XQuery error code, e.g. `XPTY0004`.
        code: String,
        /// Description of the error.
        message: String,
    },

    /// XML source could not be parsed.
    #[error("XML parse error: {message}")]
    XmlParse {
        /// Description of the error.
        message: String,
    },

    /// Collection not found.
    #[error("collection not found: {path}")]
    CollectionNotFound {
        /// Path of the collection.
        path: String,
    },

    /// Document not found.
    #[error("document not found: {path}")]
    DocumentNotFound {
        /// Path of the document.
        path: String,
    },

    /// Document already exists and the store was not an update.
    #[error("document already exists: {path}")]
    DocumentExists {
        /// Path of the document.
        path: String,
    },

    /// Collection already exists where one was to be created by a copy.
    #[error("collection already exists: {path}")]
    CollectionExists {
        /// Path of the collection.
        path: String,
    },

    /// No node at the given address in the current version of its document.
    #[error("node not found: {address}")]
    NodeNotFound {
        /// The address that did not resolve.
        address: String,
    },

    /// Transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Storage location is already held by another pool.
    #[error("database locked: another pool has exclusive access")]
    DatabaseLocked,

    /// Invalid on-disk format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Journal is corrupted or invalid.
    #[error("journal corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a journal write error.
    pub fn journal_write(message: impl Into<String>) -> Self {
        Self::JournalWrite {
            message: message.into(),
        }
    }

    /// Creates a recovery error.
    pub fn recovery(message: impl Into<String>) -> Self {
        Self::Recovery {
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    pub fn authentication(user: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Authentication {
            user: user.into(),
            reason: reason.into(),
        }
    }

    /// Creates a query compilation error with an XQuery error code.
    pub fn compilation(code: &str, message: impl Into<String>) -> Self {
        Self::QueryCompilation {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Creates a dynamic evaluation error with an XQuery error code.
    pub fn evaluation(code: &str, message: impl Into<String>) -> Self {
        Self::Evaluation {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Creates a type mismatch error.
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::IndexTypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates an XML parse error.
    pub fn xml_parse(message: impl Into<String>) -> Self {
        Self::XmlParse {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for errors raised by the broker pool itself rather than
    /// by the data or the query.
    #[must_use]
    pub fn is_pool_error(&self) -> bool {
        matches!(self, Self::PoolClosed | Self::PoolExhausted { .. })
    }

    /// Returns true if retrying the same call later may succeed.
    ///
    /// Only an exhausted pool qualifies: a closed pool stays closed, and data,
    /// query and durability errors repeat on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Returns the XQuery error code for compilation and evaluation errors.
    #[must_use]
    pub fn query_code(&self) -> Option<&str> {
        match self {
            Self::QueryCompilation { code, .. } | Self::Evaluation { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_distinguished_from_data_errors() {
        let exhausted = CoreError::PoolExhausted {
            waited: Duration::from_millis(5),
        };
        assert!(exhausted.is_pool_error());
        assert!(exhausted.is_retryable());

        assert!(CoreError::PoolClosed.is_pool_error());
        assert!(!CoreError::PoolClosed.is_retryable());

        let data = CoreError::NameCollision {
            name: "id".into(),
        };
        assert!(!data.is_pool_error());
        assert!(!data.is_retryable());
    }

    #[test]
    fn binding_disabled_is_not_a_compilation_error() {
        let err = CoreError::BindingDisabled {
            namespace: "host:clock".into(),
        };
        assert!(!matches!(err, CoreError::QueryCompilation { .. }));
        assert_eq!(err.query_code(), None);
    }

    #[test]
    fn query_codes_are_exposed() {
        let err = CoreError::compilation("XPST0003", "unexpected token");
        assert_eq!(err.query_code(), Some("XPST0003"));
        assert!(err.to_string().contains("XPST0003"));
    }
}
