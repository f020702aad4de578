//! The storage daemon: a listener with one handler thread per connection,
//! dispatching framed messages into the backends this daemon hosts.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use backend::{DbBackend, KvBackend, MemoryKvBackend, MemoryObjectBackend, ObjectBackend};
use config::{BackendKind, Configuration};
use db_sql::{MysqlDriver, SqlEngine, SqliteDriver};
use message::Message;
use socket2::{Domain, Socket, Type};

mod arena;
mod dispatch;
mod statistics;

pub use arena::MemoryChunk;
pub use statistics::Statistics;

/// Everything the dispatch loop needs, immutable after init. The shared
/// statistics mutex is the only mutable member.
pub struct DaemonContext {
    pub object: Option<Box<dyn ObjectBackend>>,
    pub kv: Option<Box<dyn KvBackend>>,
    pub db: Option<Box<dyn DbBackend>>,
    pub statistics: Mutex<Statistics>,
    pub max_operation_size: u64,
}

/// Initialise the backends this daemon hosts, per its `(host, port)`
/// identity in the configured server lists.
pub fn build_context(
    config: &Configuration,
    host: &str,
    port: u16,
) -> anyhow::Result<DaemonContext> {
    let mut context = DaemonContext {
        object: None,
        kv: None,
        db: None,
        statistics: Mutex::new(Statistics::default()),
        max_operation_size: config.max_operation_size(),
    };

    for kind in config.hosted_kinds(host, port) {
        let backend = config.backend(kind);
        let path = backend.path_for_port(port);

        match kind {
            BackendKind::Object => {
                context.object = Some(match backend.name.as_str() {
                    "memory" => Box::new(MemoryObjectBackend::new()),
                    other => anyhow::bail!("unknown object backend {other}"),
                });
            }
            BackendKind::Kv => {
                context.kv = Some(match backend.name.as_str() {
                    "memory" => Box::new(MemoryKvBackend::new()),
                    other => anyhow::bail!("unknown kv backend {other}"),
                });
            }
            BackendKind::Db => {
                let capacity = config.statement_cache_capacity();

                context.db = Some(match backend.name.as_str() {
                    "sqlite" => Box::new(
                        SqlEngine::new(SqliteDriver::new(&path, capacity))
                            .context("could not initialize the sqlite db backend")?,
                    ) as Box<dyn DbBackend>,
                    "mysql" => Box::new(
                        SqlEngine::new(MysqlDriver::new(&path)?)
                            .context("could not initialize the mysql db backend")?,
                    ),
                    other => anyhow::bail!("unknown db backend {other}"),
                });
            }
        }

        tracing::info!(
            kind = kind.as_str(),
            backend = %backend.name,
            "initialized backend"
        );
    }

    Ok(context)
}

pub struct Daemon {
    context: Arc<DaemonContext>,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
}

/// Stops the accept loop; in-flight connection handlers drain before
/// `serve` returns.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<AtomicBool>,
    port: u16,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

impl Daemon {
    /// Bind the listening socket. `SO_REUSEADDR` tolerates a predecessor's
    /// lingering TIME_WAIT sockets; port 0 picks a free port.
    pub fn bind(context: DaemonContext, port: u16) -> anyhow::Result<Self> {
        let address: SocketAddr = ([0, 0, 0, 0], port).into();

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&address.into())
            .with_context(|| format!("could not bind port {port}"))?;
        socket.listen(128)?;

        Ok(Self {
            context: Arc::new(context),
            listener: socket.into(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|address| address.port())
            .unwrap_or(0)
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.shutdown.clone(),
            port: self.port(),
        }
    }

    /// Accept connections until shut down; one handler thread per
    /// connection.
    pub fn serve(&self) -> anyhow::Result<()> {
        tracing::info!(port = self.port(), "daemon listening");

        let mut workers: Vec<std::thread::JoinHandle<()>> = Vec::new();

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match stream {
                Ok(stream) => {
                    let context = self.context.clone();
                    workers.push(std::thread::spawn(move || {
                        handle_connection(context, stream)
                    }));
                }
                Err(err) => tracing::warn!(%err, "accept failed"),
            }

            workers.retain(|worker| !worker.is_finished());
        }

        // Drain in-flight handlers before returning.
        for worker in workers {
            let _ = worker.join();
        }

        tracing::info!("daemon stopped");
        Ok(())
    }
}

fn handle_connection(context: Arc<DaemonContext>, mut stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    tracing::debug!(?peer, "connection opened");

    let _ = stream.set_nodelay(true);

    let mut arena = MemoryChunk::new(context.max_operation_size as usize);
    let mut statistics = Statistics::default();

    loop {
        match Message::receive(&mut stream, context.max_operation_size) {
            Ok(Some(message)) => {
                if let Err(err) =
                    dispatch::handle_message(&context, &mut stream, message, &mut arena, &mut statistics)
                {
                    tracing::debug!(?peer, %err, "dispatch failed, dropping connection");
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(?peer, %err, "transport failure, dropping connection");
                break;
            }
        }
    }

    context
        .statistics
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .fold(&statistics);

    tracing::debug!(?peer, "connection closed");
}
