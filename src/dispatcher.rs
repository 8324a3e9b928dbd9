use crate::bandwidth::BandwidthMeter;
use crate::config::{self, Config};
use crate::controller::{BackendControl, BackendStatus, Controller};
use crate::handshake::{self, Intent};
use crate::response;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Per-direction read timeout; hitting it is treated the same as a clean EOF.
const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-direction read buffer size.
const COPY_BUF_SIZE: usize = 1024;

/// Accept loop plus per-connection state shared by every accepted client: the live
/// `server_version_name`/`server_protocol` pair (mutated once a real handshake is
/// observed) and the config needed to synthesize responses.
pub struct Dispatcher<B: BackendControl> {
    controller: Arc<Controller<B>>,
    meter: Arc<BandwidthMeter>,
    config: Config,
    config_dir: PathBuf,
    player_count: Arc<AtomicI64>,
    server_host: String,
    server_port: u16,
    learned_version: Arc<Mutex<(String, i32)>>,
}

impl<B: BackendControl> Dispatcher<B> {
    pub fn new(
        controller: Arc<Controller<B>>,
        meter: Arc<BandwidthMeter>,
        config: Config,
        config_dir: PathBuf,
        player_count: Arc<AtomicI64>,
    ) -> Arc<Self> {
        let learned_version = (config.server_version_name.clone(), config.server_protocol);
        Arc::new(Dispatcher {
            server_host: config.server_host.clone(),
            server_port: config.server_port,
            controller,
            meter,
            config,
            config_dir,
            player_count,
            learned_version: Arc::new(Mutex::new(learned_version)),
        })
    }

    /// Binds the listener and accepts an unbounded stream of clients. A panic or error
    /// inside one connection's handler is caught via `tokio::spawn` and logged; the loop
    /// itself never exits except on a fatal bind failure.
    pub async fn run(self: Arc<Self>, listen_host: &str, listen_port: u16) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{listen_host}:{listen_port}").parse()?;
        let listener = TcpListener::bind(addr).await?;
        log::info!("Listening for connections on {addr}");

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(socket, peer).await {
                    log::debug!("Connection handler for {peer} exited with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        mut socket: TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        if self.controller.status().await == BackendStatus::Online {
            return self.bridge_to_upstream(socket, peer).await;
        }

        match handshake::classify(&mut socket, peer).await? {
            Intent::Login { player_name } => {
                let status = self.controller.status().await;
                if status == BackendStatus::Offline {
                    self.controller.request_start().await;
                }
                log::info!("Login attempt from {player_name} ({peer}) while backend is not online");
                let time_until_up = self.controller.time_until_up().await;
                let packet = response::build_text_message(&self.config, status, time_until_up);
                let _ = socket.write_all(&packet).await;
                let _ = socket.shutdown().await;
                Ok(())
            }
            Intent::Status => {
                let status = self.controller.status().await;
                let (version_name, protocol) = self.learned_version.lock().await.clone();
                let packet = response::build_info_message(&self.config, status, &version_name, protocol);
                let _ = socket.write_all(&packet).await;
                if let Ok(nonce) = handshake::read_ping_nonce(&mut socket).await {
                    let _ = socket.write_all(&nonce).await;
                }
                let _ = socket.shutdown().await;
                Ok(())
            }
            Intent::Unknown => Ok(()),
        }
    }

    async fn bridge_to_upstream(self: &Arc<Self>, client: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let upstream = match TcpStream::connect((self.server_host.as_str(), self.server_port)).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Upstream dial to {}:{} failed for {peer}: {e}", self.server_host, self.server_port);
                return Ok(());
            }
        };

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = upstream.into_split();

        let new_count = self.player_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.controller.notify_player_joined(new_count);

        let learn_ctx = LearnContext {
            slot: Arc::clone(&self.learned_version),
            config_dir: self.config_dir.clone(),
            base_config: self.config.clone(),
        };
        let meter_up = Arc::clone(&self.meter);
        let meter_down = Arc::clone(&self.meter);

        let client_to_server = tokio::spawn(copy_direction(client_read, server_write, meter_up, None, peer));
        let server_to_client = tokio::spawn(copy_direction(server_read, client_write, meter_down, Some(learn_ctx), peer));

        let _ = tokio::join!(client_to_server, server_to_client);

        let new_count = self.player_count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.controller.notify_player_left(new_count);
        Ok(())
    }
}

/// Shared state needed to persist a newly observed `server_version_name`/`server_protocol`
/// pair back to disk, passed to the server->client copy direction only.
struct LearnContext {
    slot: Arc<Mutex<(String, i32)>>,
    config_dir: PathBuf,
    base_config: Config,
}

/// Reads up to [`COPY_BUF_SIZE`] bytes at a time from `src` and writes them to `dst` until
/// EOF, a read timeout (treated as EOF), or an error. On the server->client direction, the
/// first buffer is scanned for a live `serverVersion`/`serverProtocol` pair; a pair that
/// differs from the one already in `learn.slot` is written back to the config file.
async fn copy_direction<R, W>(
    mut src: R,
    mut dst: W,
    meter: Arc<BandwidthMeter>,
    learn: Option<LearnContext>,
    peer: SocketAddr,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut first_buffer = true;
    loop {
        let read = tokio::time::timeout(READ_TIMEOUT, src.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(0)) | Err(_) => {
                let _ = dst.shutdown().await;
                return;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionReset || e.kind() == ErrorKind::ConnectionAborted => {
                return;
            }
            Ok(Err(e)) => {
                log::debug!("Forward error for {peer}: {e}");
                return;
            }
        };

        if first_buffer {
            first_buffer = false;
            if let Some(ctx) = &learn {
                if let Some((name, protocol)) = response::learn_version_protocol(&buf[..n]) {
                    let mut guard = ctx.slot.lock().await;
                    if *guard != (name.clone(), protocol) {
                        *guard = (name.clone(), protocol);
                        drop(guard);
                        let mut updated = ctx.base_config.clone();
                        updated.server_version_name = name;
                        updated.server_protocol = protocol;
                        let config_dir = ctx.config_dir.clone();
                        let persisted = tokio::task::spawn_blocking(move || {
                            config::persist_learned_version(&config_dir, &updated)
                        })
                        .await;
                        if let Ok(Err(e)) = persisted {
                            log::warn!("Failed to persist learned server version for {peer}: {e}");
                        }
                    }
                }
            }
        }

        if dst.write_all(&buf[..n]).await.is_err() {
            return;
        }
        meter.record(n as u64).await;
    }
}
