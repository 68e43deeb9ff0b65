//! Controller-facing TCP server.
//!
//! One task per accepted connection. Each task reads in fixed-size chunks,
//! assembles complete `<Commands>` batches and answers them in arrival order.
//! Different connections run concurrently and share the handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_batch, encode_batch};
use crate::command::{BatchResult, CommandResult};
use crate::config::Config;
use crate::dispatcher::{diagnostic_trace, OperationDispatcher};
use crate::error::L1Error;
use crate::frame::FrameAssembler;
use crate::handler::L1Handler;

/// Shortest poll interval of the controller read loop.
const MIN_READ_IDLE: Duration = Duration::from_secs(1);

/// Per-connection tuning, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub read_chunk_bytes: usize,
    pub read_idle: Duration,
    /// Drop a connection after this much silence. `None` keeps it forever.
    pub idle_drop: Option<Duration>,
    pub max_batch_bytes: usize,
    pub log_batches: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServerOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            read_chunk_bytes: cfg.read_chunk_bytes.max(1),
            read_idle: cfg.read_idle().max(MIN_READ_IDLE),
            idle_drop: cfg.idle_drop(),
            max_batch_bytes: cfg.max_batch_bytes,
            log_batches: cfg.log_batches,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionServer {
    dispatcher: OperationDispatcher,
    options: ServerOptions,
}

impl ConnectionServer {
    pub fn new(handler: Arc<dyn L1Handler>, options: ServerOptions) -> Self {
        Self {
            dispatcher: OperationDispatcher::new(handler),
            options,
        }
    }

    #[must_use]
    pub const fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Bind a listening socket with `SO_REUSEADDR` and an explicit backlog.
    /// `host` may be an IP literal or a name; resolved addresses are tried in
    /// order until one binds.
    ///
    /// # Errors
    ///
    /// `L1Error::Bind` when the host does not resolve or no address can be bound.
    pub async fn bind(host: &str, port: u16, backlog: u32) -> Result<TcpListener, L1Error> {
        let addr_text = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let bind_err = |source: std::io::Error| L1Error::Bind {
            addr: addr_text.clone(),
            source,
        };

        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "host resolved to no address",
        );
        for addr in lookup_host((host, port)).await.map_err(bind_err)? {
            match bind_socket(addr, backlog) {
                Ok(listener) => {
                    debug!("bound {addr_text} as {addr}");
                    return Ok(listener);
                }
                Err(e) => {
                    debug!("bind {addr} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(bind_err(last_err))
    }

    /// Bind and serve forever.
    ///
    /// # Errors
    ///
    /// Only a bind failure is returned; per-connection failures are logged.
    pub async fn listen(&self, host: &str, port: u16, backlog: u32) -> Result<(), L1Error> {
        let listener = Self::bind(host, port, backlog).await?;
        info!("Listening on {host}:{port} (backlog {backlog})");
        self.run_listener_on(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn run_listener_on(&self, listener: TcpListener) -> Result<(), L1Error> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            info!("Connection from {peer}");
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_connection(stream, peer.to_string()).await;
            });
        }
    }

    /// Serve one controller connection until it closes.
    pub async fn serve_connection<S>(&self, mut stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let opts = &self.options;
        let mut assembler = FrameAssembler::new(opts.max_batch_bytes);
        let mut chunk = vec![0u8; opts.read_chunk_bytes.max(1)];
        let mut silent_for = Duration::ZERO;

        loop {
            let n = match timeout(opts.read_idle, stream.read(&mut chunk)).await {
                Err(_) => {
                    silent_for += opts.read_idle;
                    if let Some(limit) = opts.idle_drop {
                        if silent_for >= limit {
                            info!("{peer}: idle for {}s, dropping connection", silent_for.as_secs());
                            break;
                        }
                    }
                    continue;
                }
                Ok(Ok(0)) => {
                    if assembler.pending() > 0 {
                        warn!(
                            "{peer}: connection closed with {} bytes of incomplete batch",
                            assembler.pending()
                        );
                    }
                    info!("{peer}: connection closed");
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!("{peer}: read failed: {e}");
                    break;
                }
            };
            silent_for = Duration::ZERO;
            debug!("{peer}: received {n} bytes");

            let mut frame = match assembler.feed(&chunk[..n]) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("{peer}: {e}; closing connection");
                    break;
                }
            };
            while let Some(batch) = frame {
                let response = self.process_batch(&batch).await;
                if let Err(e) = write_response(&mut stream, &response).await {
                    warn!("{peer}: write failed: {e}");
                    return;
                }
                frame = assembler.next_buffered();
            }
        }
    }

    /// Decode, dispatch and encode one complete batch.
    ///
    /// An undecodable batch is answered with a single failed result so the
    /// controller always gets a response envelope.
    pub async fn process_batch(&self, frame: &[u8]) -> String {
        if self.options.log_batches {
            info!("batch received: {}", String::from_utf8_lossy(frame));
        }
        let batch = match decode_batch(frame) {
            Ok(commands) => self.dispatcher.dispatch_batch(commands).await,
            Err(e) => {
                warn!("{e}");
                let log = diagnostic_trace(&e, "", "");
                BatchResult::new(vec![CommandResult::failure("", "", e.to_string(), log)])
            }
        };
        let xml = encode_batch(&batch);
        if self.options.log_batches {
            info!("batch response: {xml}");
        }
        xml
    }
}

fn bind_socket(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn write_response<S>(stream: &mut S, response: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
