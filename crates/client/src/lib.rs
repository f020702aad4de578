//! Client side of the storage framework: per-server connections, the batch
//! engine that coalesces and dispatches operations, typed operation
//! constructors, and the distribution policies for striped object I/O.

use std::net::TcpStream;
use std::sync::{Mutex, MutexGuard};

use config::{BackendKind, Configuration, ServerAddress};
use db_types::DbError;
use message::{Message, MessageBuilder, Opcode};

mod batch;
pub mod db;
mod distribution;
pub mod kv;
pub mod object;

pub use batch::{Batch, OpResult, Operation, ReplyCursor};
pub use distribution::{Distribution, DistributionPolicy};

/// Client-side failures. Per-operation remote errors reconstruct from reply
/// status codes; transport failures flatten their detail so errors stay
/// cloneable into the batch's error vector.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("reply does not correlate with the outstanding request")]
    ReplyMismatch,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("remote i/o failure")]
    RemoteIo,
    #[error("out of space")]
    OutOfSpace,
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("daemon rejected the opcode")]
    UnknownOpcode,
    #[error("daemon does not host the backend for this operation")]
    WrongBackendHere,
    #[error("internal daemon failure")]
    Internal,
}

impl From<message::Error> for Error {
    fn from(err: message::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl Error {
    /// Interpret an object/kv reply status. `None` is success.
    pub(crate) fn from_status(code: u32) -> Option<Error> {
        use message::status;

        Some(match code {
            status::OK => return None,
            status::NOT_FOUND => Error::NotFound,
            status::ALREADY_EXISTS => Error::AlreadyExists,
            status::OUT_OF_SPACE => Error::OutOfSpace,
            status::UNKNOWN_OPCODE => Error::UnknownOpcode,
            status::WRONG_BACKEND => Error::WrongBackendHere,
            status::INTERNAL => Error::Internal,
            _ => Error::RemoteIo,
        })
    }
}

/// Aggregate daemon counters, as returned by the statistics opcode.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    pub files_created: u64,
    pub files_deleted: u64,
    pub files_stated: u64,
    pub sync_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// A connected client. Connections are opened lazily, one per distinct
/// server address, and reused across batches; one batch never interleaves
/// with another on the same connection.
pub struct Client {
    servers: Vec<ServerAddress>,
    connections: Vec<Mutex<Option<TcpStream>>>,
    object_map: Vec<usize>,
    kv_map: Vec<usize>,
    db_map: Vec<usize>,
}

impl Client {
    pub fn new(config: &Configuration) -> Self {
        let servers = config.all_servers();

        let index_of = |address: &ServerAddress| {
            servers
                .iter()
                .position(|candidate| candidate == address)
                .expect("every per-kind server appears in the union")
        };

        let map_for = |kind: BackendKind| -> Vec<usize> {
            config.servers(kind).iter().map(index_of).collect()
        };

        let connections = servers.iter().map(|_| Mutex::new(None)).collect();

        Self {
            object_map: map_for(BackendKind::Object),
            kv_map: map_for(BackendKind::Kv),
            db_map: map_for(BackendKind::Db),
            servers,
            connections,
        }
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn object_server_count(&self) -> usize {
        self.object_map.len()
    }

    /// Server index (into the connection table) for a whole-object
    /// operation on `name`.
    pub fn object_server(&self, name: &str) -> usize {
        self.object_map[fxhash::hash64(name.as_bytes()) as usize % self.object_map.len()]
    }

    /// Server index for the `index`-th object server, as yielded by a
    /// distribution policy.
    pub fn object_server_at(&self, index: usize) -> usize {
        self.object_map[index]
    }

    pub fn kv_server(&self, key: &str) -> usize {
        self.kv_map[fxhash::hash64(key.as_bytes()) as usize % self.kv_map.len()]
    }

    pub fn db_server(&self) -> usize {
        self.db_map[0]
    }

    pub fn batch(&self, semantics: semantics::Semantics) -> Batch<'_> {
        Batch::new(self, semantics)
    }

    pub(crate) fn connection(
        &self,
        server: usize,
    ) -> Result<MutexGuard<'_, Option<TcpStream>>, Error> {
        let mut guard = self.connections[server]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if guard.is_none() {
            let address = &self.servers[server];
            tracing::debug!(%address, "connecting");

            let stream = TcpStream::connect((address.host.as_str(), address.port))
                .map_err(|err| Error::Transport(format!("connect to {address}: {err}")))?;
            stream.set_nodelay(true)?;

            *guard = Some(stream);
        }

        Ok(guard)
    }

    /// Probe which backend families a daemon hosts.
    pub fn ping(&self, server: usize) -> Result<Vec<String>, Error> {
        let mut guard = self.connection(server)?;
        let stream = guard.as_mut().expect("connection just established");

        let request = MessageBuilder::new(Opcode::Ping, 0).finish();
        request.send(stream)?;

        let mut reply = Message::receive(stream, u64::from(u32::MAX))?
            .ok_or(Error::Transport("daemon closed the connection".to_string()))?;

        if reply.id() != request.id() || !reply.flags().is_reply() {
            return Err(Error::ReplyMismatch);
        }

        let mut families = Vec::new();
        for _ in 0..reply.count() {
            reply.next_operation()?;
            families.push(reply.get_string()?.to_string());
        }

        Ok(families)
    }

    /// Fetch daemon counters: this connection's when `get_all` is false,
    /// daemon-wide otherwise.
    pub fn statistics(&self, server: usize, get_all: bool) -> Result<Statistics, Error> {
        let mut guard = self.connection(server)?;
        let stream = guard.as_mut().expect("connection just established");

        let mut builder = MessageBuilder::new(Opcode::Statistics, 16);
        builder.add_operation(1);
        builder.append_u8(u8::from(get_all));
        let request = builder.finish();
        request.send(stream)?;

        let mut reply = Message::receive(stream, u64::from(u32::MAX))?
            .ok_or(Error::Transport("daemon closed the connection".to_string()))?;

        if reply.id() != request.id() {
            return Err(Error::ReplyMismatch);
        }

        reply.next_operation()?;

        Ok(Statistics {
            files_created: reply.get_u64()?,
            files_deleted: reply.get_u64()?,
            files_stated: reply.get_u64()?,
            sync_count: reply.get_u64()?,
            bytes_read: reply.get_u64()?,
            bytes_written: reply.get_u64()?,
            bytes_received: reply.get_u64()?,
            bytes_sent: reply.get_u64()?,
        })
    }
}
