use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a registered client
pub type ClientId = u64;

/// Key into the backing store's flat keyspace
pub type StorageKey = u64;

/// Kind of a single client statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    Read,
    ReadForUpdate,
    Write,
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementKind::Read => write!(f, "READ"),
            StatementKind::ReadForUpdate => write!(f, "READ_FOR_UPDATE"),
            StatementKind::Write => write!(f, "WRITE"),
            StatementKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// One statement within a transactional request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementKind,
    pub key: StorageKey,
    pub value: Option<Vec<u8>>,
}

impl Statement {
    pub fn read(key: StorageKey) -> Self {
        Self {
            kind: StatementKind::Read,
            key,
            value: None,
        }
    }

    pub fn read_for_update(key: StorageKey) -> Self {
        Self {
            kind: StatementKind::ReadForUpdate,
            key,
            value: None,
        }
    }

    pub fn write(key: StorageKey, value: Vec<u8>) -> Self {
        Self {
            kind: StatementKind::Write,
            key,
            value: Some(value),
        }
    }

    pub fn delete(key: StorageKey) -> Self {
        Self {
            kind: StatementKind::Delete,
            key,
            value: None,
        }
    }

    /// True for statements whose result carries a read value back to the client
    pub fn is_read(&self) -> bool {
        matches!(self.kind, StatementKind::Read | StatementKind::ReadForUpdate)
    }
}

/// Address on which a client listens for responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub host: String,
    pub port: u16,
}

/// Inbound client message: registration or a transactional request.
///
/// A transactional request may carry any combination of a start/commit/abort
/// flag and a batch of statements; statements within one request are
/// independent and may execute in any order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: ClientId,
    #[serde(default)]
    pub register: Option<Registration>,
    #[serde(default)]
    pub to_start: bool,
    #[serde(default)]
    pub to_commit: bool,
    #[serde(default)]
    pub to_abort: bool,
    #[serde(default)]
    pub statements: Vec<Statement>,
}

impl ClientRequest {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            register: None,
            to_start: false,
            to_commit: false,
            to_abort: false,
            statements: Vec::new(),
        }
    }

    pub fn register<S: Into<String>>(client_id: ClientId, host: S, port: u16) -> Self {
        let mut req = Self::new(client_id);
        req.register = Some(Registration {
            host: host.into(),
            port,
        });
        req
    }

    pub fn start(client_id: ClientId) -> Self {
        let mut req = Self::new(client_id);
        req.to_start = true;
        req
    }

    pub fn abort(client_id: ClientId) -> Self {
        let mut req = Self::new(client_id);
        req.to_abort = true;
        req
    }

    pub fn with_statements(mut self, statements: Vec<Statement>) -> Self {
        self.statements = statements;
        self
    }

    pub fn with_commit(mut self) -> Self {
        self.to_commit = true;
        self
    }
}

/// Kind of an outbound client response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    Register,
    Operation,
}

/// Outbound client message.
///
/// `read_values` holds one entry per READ/READ_FOR_UPDATE statement of the
/// answered batch, in request order; an empty byte value denotes "not found".
/// Aborted transactions never surface read values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub is_error: bool,
    pub kind: ResponseKind,
    pub read_values: Vec<Vec<u8>>,
}

impl ClientResponse {
    pub fn register_ack() -> Self {
        Self {
            is_error: false,
            kind: ResponseKind::Register,
            read_values: Vec::new(),
        }
    }

    pub fn operation(is_error: bool, read_values: Vec<Vec<u8>>) -> Self {
        Self {
            is_error,
            kind: ResponseKind::Operation,
            read_values,
        }
    }

    pub fn success(read_values: Vec<Vec<u8>>) -> Self {
        Self::operation(false, read_values)
    }

    pub fn error() -> Self {
        Self::operation(true, Vec::new())
    }
}
