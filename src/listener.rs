//! Listener supervisor and connection dispatcher
//!
//! One `ProxyListener` per configured listener: bind, accept, and spawn a
//! task per connection. The connection task runs the admission gates, takes
//! exactly one bounded read of the initial bytes, scans them, classifies the
//! traffic as HTTP or raw TCP, executes the matching processor action, and on
//! allow splices client and backend until both directions close.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{Action, Config, DropResponse, ListenerConfig, Processor};
use crate::defense::DefenseEngine;
use crate::geoip::GeoIpFilter;
use crate::http;
use crate::time_window::TimeWindowFilter;

/// Size of the one-shot initial read
const INITIAL_READ_SIZE: usize = 4096;

/// Process-wide state shared by every listener
pub struct ProxyState {
    pub config: Arc<Config>,
    pub defense: Arc<DefenseEngine>,
    pub geoip: Arc<GeoIpFilter>,
    pub time_window: Arc<TimeWindowFilter>,
}

/// A bound listener ready to accept connections
pub struct ProxyListener {
    listener: TcpListener,
    state: Arc<ProxyState>,
    index: usize,
}

impl ProxyListener {
    /// Bind the listener at `state.config.listeners[index]`. A bind failure
    /// is fatal for this listener.
    pub async fn bind(state: Arc<ProxyState>, index: usize) -> anyhow::Result<Self> {
        let cfg = &state.config.listeners[index];
        let addr: SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("[{}] failed to bind {}", cfg.name, addr))?;

        info!(
            "[{}] listening on {}, forwarding to {}",
            cfg.name,
            listener.local_addr()?,
            cfg.backend_addr
        );

        Ok(Self {
            listener,
            state,
            index,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Accept errors are logged and the loop continues.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(
                        "[{}] failed to accept connection: {}",
                        self.state.config.listeners[self.index].name, e
                    );
                    continue;
                }
            };

            let state = Arc::clone(&self.state);
            let index = self.index;
            tokio::spawn(async move {
                handle_connection(state, index, stream, peer).await;
            });
        }
    }
}

/// Full lifetime of one client connection
async fn handle_connection(
    state: Arc<ProxyState>,
    index: usize,
    mut client: TcpStream,
    peer: SocketAddr,
) {
    let cfg = &state.config.listeners[index];
    let global = &state.config.global;

    // Admission gates that need only the peer address and the clock run
    // before any read
    if let Some(country) = state.geoip.is_blocked(peer.ip()) {
        warn!("[{}] blocked {} by region ({})", cfg.name, peer, country);
        return;
    }

    if !state.time_window.in_window() {
        warn!("[{}] blocked {} outside time window", cfg.name, peer);
        return;
    }

    // Exactly one read of at most 4096 bytes, optionally under a deadline
    let mut buf = [0u8; INITIAL_READ_SIZE];
    let n = match initial_read(cfg, &mut client, &mut buf).await {
        Some(n) => n,
        None => return,
    };
    let initial = &buf[..n];

    let is_http = http::is_http(initial);
    let path = if is_http {
        let line = String::from_utf8_lossy(http::request_line(initial)).into_owned();
        http::extract_path(&line).to_string()
    } else {
        String::new()
    };

    // Defense scan sees the raw initial bytes plus the HTTP path, if any
    let verdict = state.defense.scan(peer.ip(), initial, &path);
    if verdict.blocked {
        state.defense.log_blocked(peer.ip(), &verdict);
        if is_http {
            let _ = client.write_all(http::RESPONSE_403).await;
        }
        return;
    }

    if is_http {
        handle_http(cfg, client, peer, initial, &path, global.buffer_size).await;
    } else {
        handle_tcp(cfg, client, peer, initial, global.buffer_size).await;
    }
}

/// Perform the bounded initial read. `None` means the connection is done
/// (timeout, error, or immediate close), already logged at debug.
async fn initial_read(
    cfg: &ListenerConfig,
    client: &mut TcpStream,
    buf: &mut [u8],
) -> Option<usize> {
    let deadline = if cfg.timeout.enabled && cfg.timeout.initial_read > 0 {
        Some(Duration::from_secs(cfg.timeout.initial_read))
    } else {
        None
    };

    let read = async { client.read(buf).await };
    let result = match deadline {
        Some(d) => match tokio::time::timeout(d, read).await {
            Ok(r) => r,
            Err(_) => {
                debug!("[{}] initial read timed out", cfg.name);
                return None;
            }
        },
        None => read.await,
    };

    match result {
        Ok(0) => {
            debug!("[{}] connection closed before any data", cfg.name);
            None
        }
        Ok(n) => Some(n),
        Err(e) => {
            debug!("[{}] error reading initial data: {}", cfg.name, e);
            None
        }
    }
}

async fn handle_http(
    cfg: &ListenerConfig,
    mut client: TcpStream,
    peer: SocketAddr,
    initial: &[u8],
    path: &str,
    buffer_size: usize,
) {
    let Some(proc) = cfg.match_http_processor(path) else {
        debug!("[{}] no processor for {} from {}", cfg.name, path, peer);
        let _ = client.write_all(http::RESPONSE_404).await;
        return;
    };

    match proc.action {
        Action::Drop => {
            info!("[{}] dropped {} {} from {}", cfg.name, path, drop_label(proc), peer);
            if let Some(bytes) = drop_response_bytes(proc) {
                let _ = client.write_all(bytes).await;
            }
        }
        Action::File => {
            serve_file(cfg, &mut client, proc, peer).await;
        }
        Action::Rewrite => {
            let from = proc.paths().first().cloned().unwrap_or_default();
            let to = proc.rewrite_to.clone().unwrap_or_default();
            let rewritten = http::rewrite_path(initial, &from, &to);
            info!(
                "[{}] rewriting {} -> {} for {}",
                cfg.name, from, to, peer
            );
            forward_http(cfg, client, peer, &rewritten, buffer_size).await;
        }
        Action::Allow | Action::Proxy => {
            info!("[{}] forwarding HTTP {} from {}", cfg.name, path, peer);
            forward_http(cfg, client, peer, initial, buffer_size).await;
        }
    }
}

async fn handle_tcp(
    cfg: &ListenerConfig,
    client: TcpStream,
    peer: SocketAddr,
    initial: &[u8],
    buffer_size: usize,
) {
    let Some(proc) = cfg.tcp_processor() else {
        info!("[{}] no TCP processor configured, closing {}", cfg.name, peer);
        return;
    };

    match proc.action {
        Action::Drop => {
            info!("[{}] dropped raw TCP connection from {}", cfg.name, peer);
        }
        Action::File => {
            let mut client = client;
            serve_file(cfg, &mut client, proc, peer).await;
        }
        // Rewrite has no request line to act on; forward the bytes untouched
        Action::Allow | Action::Proxy | Action::Rewrite => {
            info!("[{}] forwarding raw TCP connection from {}", cfg.name, peer);
            forward_tcp(cfg, client, peer, initial, buffer_size).await;
        }
    }
}

fn drop_label(proc: &Processor) -> &'static str {
    match proc.response.unwrap_or(DropResponse::NotFound) {
        DropResponse::NotFound => "(404)",
        DropResponse::Forbidden => "(403)",
        DropResponse::BadGateway => "(502)",
        DropResponse::Close => "(close)",
    }
}

fn drop_response_bytes(proc: &Processor) -> Option<&'static [u8]> {
    match proc.response.unwrap_or(DropResponse::NotFound) {
        DropResponse::NotFound => Some(http::RESPONSE_404),
        DropResponse::Forbidden => Some(http::RESPONSE_403),
        DropResponse::BadGateway => Some(http::RESPONSE_502),
        DropResponse::Close => None,
    }
}

async fn serve_file(cfg: &ListenerConfig, client: &mut TcpStream, proc: &Processor, peer: SocketAddr) {
    let Some(file) = proc.file.as_ref() else {
        let _ = client.write_all(http::RESPONSE_404).await;
        return;
    };

    match tokio::fs::read(file).await {
        Ok(body) => {
            info!("[{}] serving {:?} to {}", cfg.name, file, peer);
            let _ = client.write_all(&http::file_response(file, &body)).await;
        }
        Err(e) => {
            warn!("[{}] failed to read {:?}: {}", cfg.name, file, e);
            let _ = client.write_all(http::RESPONSE_404).await;
        }
    }
}

/// Forward an HTTP connection: dial the backend, write the initial buffer,
/// splice. A dial failure answers 502.
async fn forward_http(
    cfg: &ListenerConfig,
    mut client: TcpStream,
    peer: SocketAddr,
    initial: &[u8],
    buffer_size: usize,
) {
    let backend = match dial_backend(cfg).await {
        Ok(b) => b,
        Err(e) => {
            warn!("[{}] failed to connect to backend: {}", cfg.name, e);
            let _ = client.write_all(http::RESPONSE_502).await;
            return;
        }
    };

    splice(cfg, client, backend, peer, initial, buffer_size).await;
}

/// Forward a raw TCP connection; dial failures close silently
async fn forward_tcp(
    cfg: &ListenerConfig,
    client: TcpStream,
    peer: SocketAddr,
    initial: &[u8],
    buffer_size: usize,
) {
    let backend = match dial_backend(cfg).await {
        Ok(b) => b,
        Err(e) => {
            warn!("[{}] failed to connect to backend: {}", cfg.name, e);
            return;
        }
    };

    splice(cfg, client, backend, peer, initial, buffer_size).await;
}

async fn dial_backend(cfg: &ListenerConfig) -> io::Result<TcpStream> {
    let connect = TcpStream::connect(cfg.backend_addr.as_str());

    if cfg.timeout.enabled && cfg.timeout.connect_backend > 0 {
        match tokio::time::timeout(Duration::from_secs(cfg.timeout.connect_backend), connect).await
        {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "backend connect timed out",
            )),
        }
    } else {
        connect.await
    }
}

/// Bidirectional splice. The initial buffer is written to the backend before
/// either copy task starts; after that the two directions run independently
/// and an EOF or error on one half-closes only its own peer.
async fn splice(
    cfg: &ListenerConfig,
    client: TcpStream,
    mut backend: TcpStream,
    peer: SocketAddr,
    initial: &[u8],
    buffer_size: usize,
) {
    if let Err(e) = backend.write_all(initial).await {
        debug!("[{}] error writing initial data to backend: {}", cfg.name, e);
        return;
    }

    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let upstream = tokio::spawn(copy_half(client_read, backend_write, buffer_size));
    let downstream = tokio::spawn(copy_half(backend_read, client_write, buffer_size));

    let (up, down) = tokio::join!(upstream, downstream);
    let sent = initial.len() as u64 + up.unwrap_or(0);
    let received = down.unwrap_or(0);

    debug!(
        "[{}] connection from {} done ({} bytes up, {} bytes down)",
        cfg.name, peer, sent, received
    );
}

/// Copy one direction until EOF or error, then half-close the write side.
/// Errors end this direction only.
async fn copy_half<R, W>(mut reader: R, mut writer: W, buffer_size: usize) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}
