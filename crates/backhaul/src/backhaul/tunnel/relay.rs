use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, watch},
};

use crate::backhaul::net;
use crate::backhaul::tunnel::{
    bridge::bridge,
    pending::{PendingConnection, PendingRegistry},
    protocol::{
        self, AuthResponse, Message, MessageReader, MessageWriter, NewConnRequest, ProtocolError,
        RegTunnelRequest, RegTunnelResponse,
    },
    registry::{ActiveConn, PortRange, RegistryError, SessionId, Tunnel, TunnelRegistry},
};

const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Control listener address; `":7000"` binds all interfaces.
    pub control_addr: String,
    pub auth_token: String,
    /// Allowed public ports. `None` allows any port.
    pub port_range: Option<PortRange>,
    /// Host public tunnel listeners bind on.
    pub bind_host: String,
    pub pending_timeout: Duration,
    pub handshake_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("expected auth, got {0}")]
    Unexpected(String),
    #[error("invalid token")]
    BadToken,
    #[error("timed out")]
    Timeout,
}

type ControlWriter = Arc<Mutex<MessageWriter<OwnedWriteHalf>>>;

/// One authenticated control connection and the tunnels it registered.
struct ControlSession {
    id: SessionId,
    peer: SocketAddr,
    writer: ControlWriter,
}

impl ControlSession {
    async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        self.writer.lock().await.send(msg).await
    }
}

enum SessionEnd {
    Closed,
    Failed(ProtocolError),
    Claim(String),
}

/// The exposed side: accepts agent control connections and public traffic.
pub struct Relay {
    opts: RelayOptions,
    tunnels: Arc<TunnelRegistry>,
    pending: Arc<PendingRegistry>,
    session_seq: AtomicU64,
    local_addr: OnceLock<SocketAddr>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("control_addr", &self.opts.control_addr)
            .finish_non_exhaustive()
    }
}

impl Relay {
    pub fn new(opts: RelayOptions) -> Self {
        let pending = Arc::new(PendingRegistry::new(opts.pending_timeout));
        Self {
            opts,
            tunnels: Arc::new(TunnelRegistry::new()),
            pending,
            session_seq: AtomicU64::new(1),
            local_addr: OnceLock::new(),
        }
    }

    pub fn tunnels(&self) -> &Arc<TunnelRegistry> {
        &self.tunnels
    }

    pub fn pending(&self) -> &Arc<PendingRegistry> {
        &self.pending
    }

    /// Port of the control listener: the bound one once serving, else the configured one.
    pub fn control_port(&self) -> u16 {
        if let Some(a) = self.local_addr.get() {
            return a.port();
        }
        net::port_of(&self.opts.control_addr).unwrap_or(0)
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.control_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("relay: bind control {}", self.opts.control_addr))?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        self: Arc<Self>,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local = ln.local_addr().context("relay: control local_addr")?;
        let _ = self.local_addr.set(local);
        tracing::info!(
            addr=%local,
            port_range=%self.opts.port_range.map(|r| r.to_string()).unwrap_or_else(|| "any".into()),
            "relay: listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    match res {
                        Ok((conn, peer)) => {
                            let me = self.clone();
                            tokio::spawn(async move { me.handle_conn(conn, peer).await });
                        }
                        Err(err) => {
                            // Usually fd exhaustion; back off instead of spinning.
                            tracing::warn!(err=%err, "relay: accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        tracing::info!("relay: stopped accepting control connections");
        Ok(())
    }

    async fn handle_conn(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        let _ = conn.set_nodelay(true);
        let (rd, wr) = conn.into_split();
        let mut reader = MessageReader::new(rd);
        let mut writer = MessageWriter::new(wr);

        let auth = tokio::time::timeout(
            self.opts.handshake_timeout,
            handshake(&mut reader, &mut writer, &self.opts.auth_token),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout));
        if let Err(err) = auth {
            tracing::warn!(peer=%peer, err=%err, "relay: handshake failed");
            return;
        }

        let session = ControlSession {
            id: self.session_seq.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: Arc::new(Mutex::new(writer)),
        };
        tracing::debug!(session=session.id, peer=%peer, "relay: authenticated");
        metrics::gauge!("backhaul_control_sessions").increment(1.0);

        let end = self.control_loop(&mut reader, &session).await;

        let released = self.tunnels.release_session(session.id).await;
        metrics::gauge!("backhaul_control_sessions").decrement(1.0);

        match end {
            SessionEnd::Closed => {
                if !released.is_empty() {
                    tracing::info!(session=session.id, peer=%peer, tunnels=released.len(), "relay: agent disconnected");
                }
            }
            SessionEnd::Failed(err) => {
                tracing::warn!(session=session.id, peer=%peer, err=%err, tunnels=released.len(), "relay: control connection failed");
            }
            SessionEnd::Claim(conn_id) => {
                self.start_data_plane(session, reader, conn_id).await;
            }
        }
    }

    async fn control_loop(
        &self,
        reader: &mut MessageReader<OwnedReadHalf>,
        session: &ControlSession,
    ) -> SessionEnd {
        loop {
            let msg = match reader.read_message().await {
                Ok(m) => m,
                Err(err) if err.is_closed() => return SessionEnd::Closed,
                // The line was consumed whole, so the stream is still framed.
                Err(ProtocolError::Json(err)) => {
                    tracing::warn!(session=session.id, peer=%session.peer, err=%err, "relay: skipping undecodable message");
                    continue;
                }
                Err(err) => return SessionEnd::Failed(err),
            };

            let res = match msg {
                Message::RegTunnel(req) => self.register(session, req).await,
                Message::Ping => session.send(&Message::Pong).await,
                Message::ProxyData(req) => {
                    if self.tunnels.owned_by(session.id).await > 0 {
                        tracing::warn!(
                            session=session.id,
                            peer=%session.peer,
                            conn_id=%req.conn_id,
                            "relay: claim on a connection that owns tunnels; closing"
                        );
                        return SessionEnd::Closed;
                    }
                    return SessionEnd::Claim(req.conn_id);
                }
                other => {
                    tracing::debug!(session=session.id, kind=%other.type_name(), "relay: ignoring message");
                    Ok(())
                }
            };
            if let Err(err) = res {
                return SessionEnd::Failed(err);
            }
        }
    }

    async fn register(
        &self,
        session: &ControlSession,
        req: RegTunnelRequest,
    ) -> Result<(), ProtocolError> {
        let port = u16::try_from(req.remote_port);
        let reserved = match port {
            _ if req.name.trim().is_empty() => Err(RegistryError::EmptyName),
            Err(_) => Err(RegistryError::InvalidPort(req.remote_port)),
            Ok(port) => {
                self.tunnels
                    .reserve(
                        session.id,
                        &req.name,
                        &req.protocol,
                        port,
                        self.opts.port_range,
                        &self.opts.bind_host,
                    )
                    .await
            }
        };

        let (tunnel, ln) = match reserved {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(
                    session=session.id,
                    tunnel=%req.name,
                    port=req.remote_port,
                    err=%err,
                    "relay: tunnel registration rejected"
                );
                let remote_port = match err {
                    RegistryError::PortOutOfRange { .. } => 0,
                    _ => port.unwrap_or(0),
                };
                return session
                    .send(&Message::RegResp(RegTunnelResponse {
                        name: req.name,
                        success: false,
                        remote_port,
                        error: err.to_string(),
                    }))
                    .await;
            }
        };

        // The writer stays locked until reg_resp is out, so any new_conn from the
        // fresh accept loop follows the response on the wire.
        let mut control = session.writer.lock().await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            self.pending.clone(),
            tunnel.clone(),
            ln,
            session.writer.clone(),
            stop_rx,
        ));
        self.tunnels.activate(tunnel.clone(), stop_tx, task).await;
        control
            .send(&Message::RegResp(RegTunnelResponse {
                name: tunnel.name.clone(),
                success: true,
                remote_port: tunnel.remote_port,
                error: String::new(),
            }))
            .await?;
        drop(control);

        tracing::info!(
            session=session.id,
            peer=%session.peer,
            tunnel=%tunnel.name,
            protocol=%tunnel.protocol,
            port=tunnel.remote_port,
            "relay: tunnel registered"
        );
        Ok(())
    }

    async fn start_data_plane(
        &self,
        session: ControlSession,
        reader: MessageReader<OwnedReadHalf>,
        conn_id: String,
    ) {
        let ControlSession {
            id, peer, writer, ..
        } = session;
        let writer = match Arc::try_unwrap(writer) {
            Ok(w) => w.into_inner().into_inner(),
            Err(_) => {
                tracing::warn!(session=id, conn_id=%conn_id, "relay: data connection still shared; closing");
                return;
            }
        };

        let Some(pc) = self.pending.claim(&conn_id) else {
            tracing::warn!(session=id, peer=%peer, conn_id=%conn_id, "relay: pending connection not found (claimed or expired)");
            return;
        };

        let PendingConnection {
            stream,
            peer: public_peer,
            conn,
            accepted_at,
        } = pc;
        let tunnel = conn.tunnel().name.clone();
        tracing::info!(
            conn_id=%conn_id,
            tunnel=%tunnel,
            public=%public_peer,
            agent=%peer,
            waited_ms=accepted_at.elapsed().as_millis() as u64,
            "relay: bridging"
        );

        let stats = bridge(stream.into_split(), (reader.into_inner(), writer)).await;
        drop(conn);

        tracing::debug!(
            conn_id=%conn_id,
            tunnel=%tunnel,
            ingress=stats.a_to_b,
            egress=stats.b_to_a,
            "relay: bridge closed"
        );
    }
}

/// Reads the first frame and checks the token; answers with `auth_resp` either way.
pub async fn handshake<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    token: &str,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let req = match reader.read_message().await? {
        Message::Auth(req) => req,
        other => {
            let _ = writer
                .send(&Message::AuthResp(AuthResponse {
                    success: false,
                    error: "expected auth".into(),
                }))
                .await;
            return Err(HandshakeError::Unexpected(other.type_name().to_string()));
        }
    };

    if !protocol::token_matches(&req.token, token) {
        let _ = writer
            .send(&Message::AuthResp(AuthResponse {
                success: false,
                error: "Invalid Token".into(),
            }))
            .await;
        return Err(HandshakeError::BadToken);
    }

    writer
        .send(&Message::AuthResp(AuthResponse {
            success: true,
            error: String::new(),
        }))
        .await?;
    Ok(())
}

async fn accept_loop(
    pending: Arc<PendingRegistry>,
    tunnel: Arc<Tunnel>,
    ln: TcpListener,
    control: ControlWriter,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                match res {
                    Ok((stream, peer)) => {
                        tokio::spawn(on_public_conn(
                            pending.clone(),
                            tunnel.clone(),
                            control.clone(),
                            stream,
                            peer,
                        ));
                    }
                    Err(err) => {
                        tracing::warn!(tunnel=%tunnel.name, port=tunnel.remote_port, err=%err, "relay: tunnel accept failed");
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(tunnel=%tunnel.name, port=tunnel.remote_port, "relay: tunnel listener closed");
}

async fn on_public_conn(
    pending: Arc<PendingRegistry>,
    tunnel: Arc<Tunnel>,
    control: ControlWriter,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let _ = stream.set_nodelay(true);
    let conn = ActiveConn::acquire(&tunnel);
    metrics::counter!("backhaul_public_connections_total").increment(1);

    let id = pending.next_id();
    pending.insert(
        id.clone(),
        PendingConnection {
            stream,
            peer,
            conn,
            accepted_at: Instant::now(),
        },
    );
    pending.arm_expiry(id.clone());

    let note = Message::NewConn(NewConnRequest {
        conn_id: id.clone(),
        tunnel_name: tunnel.name.clone(),
    });
    match notify(&control, &note, CONTROL_WRITE_TIMEOUT).await {
        Ok(()) => {
            tracing::debug!(tunnel=%tunnel.name, conn_id=%id, public=%peer, "relay: waiting for agent");
        }
        Err(err) => {
            pending.discard(&id);
            tracing::warn!(tunnel=%tunnel.name, conn_id=%id, public=%peer, err=%err, "relay: notify agent failed");
        }
    }
}

/// Sends one frame on a shared control writer within `limit`.
///
/// A write cut off by the deadline may leave half a frame on the wire, so the
/// writer is shut down and the agent sees the control connection end.
async fn notify<W>(
    control: &Mutex<MessageWriter<W>>,
    msg: &Message,
    limit: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let timed_out = || ProtocolError::Io(std::io::ErrorKind::TimedOut.into());

    let mut w = tokio::time::timeout(limit, control.lock())
        .await
        .map_err(|_| timed_out())?;
    let sent = tokio::time::timeout(limit, w.send(msg)).await;
    match sent {
        Ok(res) => res,
        Err(_) => {
            let _ = w.shutdown().await;
            Err(timed_out())
        }
    }
}
