//! Taxonomía de errores del motor.
//!
//! Cada variante expone una etiqueta de texto estable (`tag`) que es la que
//! aparece en los logs de ejecución y en las respuestas JSON del servicio.

use std::fmt;

use thiserror::Error;

use crate::dag::NodeId;

pub type Result<T, E = EtlError> = std::result::Result<T, E>;

/// Motivo concreto de un `CompileError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    Cycle,
    UnknownNode,
    UnknownKind,
    UnknownSubtype,
    ArityViolation,
    DuplicateNode,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cycle => "cycle",
            Self::UnknownNode => "unknown-node",
            Self::UnknownKind => "unknown-kind",
            Self::UnknownSubtype => "unknown-subtype",
            Self::ArityViolation => "arity-violation",
            Self::DuplicateNode => "duplicate-node",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EtlError {
    #[error("CompileError({kind}): {message}")]
    Compile {
        kind: CompileErrorKind,
        node_id: Option<NodeId>,
        message: String,
    },

    #[error("ConfigError: {0}")]
    Config(String),

    /// `ssl` marca errores de handshake SSL/TLS del driver SQL.
    #[error("IOError: {message}")]
    Io { message: String, ssl: bool },

    #[error("TransformError: {0}")]
    Transform(String),

    #[error("RenameCollision: la columna '{0}' quedaría duplicada")]
    RenameCollision(String),

    #[error("NoSource: el DAG no tiene nodos origen")]
    NoSource,

    #[error("Cancelled")]
    Cancelled,

    #[error("AuthError: {0}")]
    Auth(String),
}

impl EtlError {
    pub fn compile(kind: CompileErrorKind, node_id: Option<NodeId>, message: impl Into<String>) -> Self {
        Self::Compile {
            kind,
            node_id,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            ssl: false,
        }
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform(message.into())
    }

    /// Etiqueta estable del tipo de error.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "CompileError",
            Self::Config(_) => "ConfigError",
            Self::Io { .. } => "IOError",
            Self::Transform(_) | Self::RenameCollision(_) => "TransformError",
            Self::NoSource => "NoSource",
            Self::Cancelled => "Cancelled",
            Self::Auth(_) => "AuthError",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self, Self::Io { ssl: true, .. })
    }
}

impl From<std::io::Error> for EtlError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<csv::Error> for EtlError {
    fn from(e: csv::Error) -> Self {
        Self::io(format!("csv: {e}"))
    }
}

/// Fallo de un nodo durante la ejecución del DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionError {
    pub node_id: Option<NodeId>,
    pub error: EtlError,
}

impl ExecutionError {
    pub fn new(node_id: Option<NodeId>, error: EtlError) -> Self {
        Self { node_id, error }
    }

    pub fn tag(&self) -> &'static str {
        self.error.tag()
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node_id {
            Some(id) => write!(f, "nodo {id}: {}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<EtlError> for ExecutionError {
    fn from(error: EtlError) -> Self {
        Self::new(None, error)
    }
}
