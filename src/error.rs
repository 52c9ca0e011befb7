use std::fmt;

use anyhow::anyhow;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Schema declaration, query or mutation failed.
    Store,
    /// File retrieval or store connection could not be established.
    Transport,
    /// An identity that an earlier step should have created is missing.
    Consistency,
    InvalidInput,
    Unknown,
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn store(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Store,
            code: "store_error",
            public,
            source,
        }
    }

    pub fn transport(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Transport,
            code: "transport_error",
            public,
            source,
        }
    }

    pub fn consistency(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Consistency,
            code: "consistency_error",
            public,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            source,
        }
    }

    pub fn invalid_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code,
            public,
            source,
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            source,
        }
    }

    pub fn message(public: &'static str) -> Self {
        Self::unknown(public, anyhow!(public))
    }

    pub fn is_store(&self) -> bool {
        self.kind == ErrorKind::Store
    }
}

impl fmt::Display for LibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.public, self.source)
    }
}

impl std::error::Error for LibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + 'static) = self.source.as_ref();
        Some(source)
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::store("Database request failed", anyhow!(value))
    }
}

#[cfg(feature = "dgraph")]
impl From<reqwest::Error> for LibError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_connect() {
            Self::transport("Graph store is unreachable", anyhow!(value))
        } else {
            Self::store("Graph store request failed", anyhow!(value))
        }
    }
}
