use std::{sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, oneshot, watch},
};

use crate::backhaul::config::TunnelConfig;
use crate::backhaul::tunnel::{
    bridge::{BridgeStats, bridge},
    protocol::{
        AuthRequest, Message, MessageReader, MessageWriter, NewConnRequest, ProtocolError,
        ProxyDataRequest, RegTunnelRequest, RegTunnelResponse,
    },
};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub server_addr: String,
    pub auth_token: String,
    pub tunnels: Vec<TunnelConfig>,
    pub dial_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub retry_backoff: Duration,
    /// Bound on waiting for `auth_resp` / `reg_resp`.
    pub response_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelEditError {
    #[error("tunnel name is required")]
    EmptyName,
    #[error("tunnel {0:?}: local_addr is required")]
    EmptyLocalAddr(String),
    #[error("tunnel {0:?} already exists")]
    Duplicate(String),
    #[error("tunnel {0:?} not found")]
    NotFound(String),
    #[error("relay rejected tunnel {name:?}: {reason}")]
    Rejected { name: String, reason: String },
    #[error("relay did not answer registration of {0:?}")]
    NoResponse(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, thiserror::Error)]
enum RegisterError {
    #[error("no response")]
    NoResponse,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type RegWaiter = (String, oneshot::Sender<RegTunnelResponse>);

/// The live control connection, shared by registration, heartbeat and dashboard edits.
struct ControlLink {
    writer: Mutex<MessageWriter<OwnedWriteHalf>>,
    waiters: std::sync::Mutex<Vec<RegWaiter>>,
}

impl ControlLink {
    fn new(writer: MessageWriter<OwnedWriteHalf>) -> Self {
        Self {
            writer: Mutex::new(writer),
            waiters: std::sync::Mutex::new(Vec::new()),
        }
    }

    async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        self.writer.lock().await.send(msg).await
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, Vec<RegWaiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn register(
        &self,
        req: RegTunnelRequest,
        timeout: Duration,
    ) -> Result<RegTunnelResponse, RegisterError> {
        let (tx, rx) = oneshot::channel();
        self.waiters().push((req.name.clone(), tx));

        if let Err(err) = self.send(&Message::RegTunnel(req)).await {
            self.prune();
            return Err(err.into());
        }

        let res = tokio::time::timeout(timeout, rx).await;
        match res {
            Ok(Ok(resp)) => Ok(resp),
            // Sender dropped: the link went away.
            Ok(Err(_)) => Err(RegisterError::NoResponse),
            Err(_) => {
                self.prune();
                Err(RegisterError::NoResponse)
            }
        }
    }

    /// Hands a `reg_resp` to the oldest registration waiting on that name.
    fn resolve(&self, resp: RegTunnelResponse) {
        let tx = {
            let mut waiters = self.waiters();
            waiters
                .iter()
                .position(|(name, _)| *name == resp.name)
                .map(|i| waiters.remove(i).1)
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(resp);
            }
            None => {
                tracing::debug!(tunnel=%resp.name, "agent: unsolicited reg_resp");
            }
        }
    }

    fn prune(&self) {
        self.waiters().retain(|(_, tx)| !tx.is_closed());
    }
}

/// The NAT'd side: keeps one control connection to the relay and serves `new_conn`.
pub struct Agent {
    opts: Arc<AgentOptions>,
    tunnels: ArcSwap<Vec<TunnelConfig>>,
    link: ArcSwapOption<ControlLink>,
    edit: Mutex<()>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("server_addr", &self.opts.server_addr)
            .field("tunnels", &self.tunnels.load().len())
            .field("connected", &self.connected())
            .finish()
    }
}

impl Agent {
    pub fn new(mut opts: AgentOptions) -> Self {
        let defaults = crate::backhaul::config::Timeouts::default();
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = defaults.dial;
        }
        if opts.heartbeat_interval.is_zero() {
            opts.heartbeat_interval = defaults.heartbeat;
        }
        if opts.retry_backoff.is_zero() {
            opts.retry_backoff = defaults.retry_backoff;
        }
        if opts.response_timeout.is_zero() {
            opts.response_timeout = defaults.response;
        }

        let mut tunnels: Vec<TunnelConfig> = Vec::new();
        for t in opts.tunnels.drain(..) {
            let Some(t) = t.normalize() else { continue };
            if t.local_addr.is_empty() || tunnels.iter().any(|x| x.name == t.name) {
                continue;
            }
            tunnels.push(t);
        }

        Self {
            opts: Arc::new(opts),
            tunnels: ArcSwap::from_pointee(tunnels),
            link: ArcSwapOption::empty(),
            edit: Mutex::new(()),
        }
    }

    pub fn server_addr(&self) -> &str {
        &self.opts.server_addr
    }

    pub fn connected(&self) -> bool {
        self.link.load().is_some()
    }

    /// The live tunnel configuration.
    pub fn tunnels(&self) -> Arc<Vec<TunnelConfig>> {
        self.tunnels.load_full()
    }

    /// Reconnects after `retry_backoff` until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.opts.server_addr.trim().is_empty() {
            anyhow::bail!("agent: server_addr is required");
        }

        let backoff = self.opts.retry_backoff;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        server=%self.opts.server_addr,
                        err=%format!("{err:#}"),
                        backoff=%humantime::format_duration(backoff),
                        "agent: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One control session. Returns `Ok` only on shutdown; a lost connection is an error.
    pub async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.opts.server_addr.as_str();
        let conn = tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("agent: dial {addr} timed out"))?
            .with_context(|| format!("agent: dial {addr}"))?;
        let _ = conn.set_nodelay(true);

        let (rd, wr) = conn.into_split();
        let mut reader = MessageReader::new(rd);
        let mut writer = MessageWriter::new(wr);
        tokio::time::timeout(
            self.opts.response_timeout,
            authenticate(&mut reader, &mut writer, &self.opts.auth_token),
        )
        .await
        .context("agent: auth timed out")??;

        let link = Arc::new(ControlLink::new(writer));
        // An edit either lands in this snapshot or sees the link and registers itself.
        let initial = {
            let _edit = self.edit.lock().await;
            self.link.store(Some(link.clone()));
            self.tunnels.load_full()
        };
        tracing::info!(server=%addr, tunnels=initial.len(), "agent: connected");

        let res = tokio::select! {
            res = self.read_loop(reader, &link) => res,
            res = async {
                self.register_all(&link, &initial).await;
                self.heartbeat(&link).await
            } => res,
            _ = shutdown_requested(&mut shutdown) => Ok(()),
        };

        self.link.store(None);
        res
    }

    async fn read_loop(
        &self,
        mut reader: MessageReader<OwnedReadHalf>,
        link: &ControlLink,
    ) -> anyhow::Result<()> {
        loop {
            let msg = match reader.read_message().await {
                Ok(m) => m,
                Err(err) if err.is_closed() => anyhow::bail!("agent: relay closed the connection"),
                Err(err) => return Err(err).context("agent: read control"),
            };
            match msg {
                Message::NewConn(note) => self.on_new_conn(note),
                Message::RegResp(resp) => link.resolve(resp),
                Message::Pong => {}
                other => {
                    tracing::debug!(kind=%other.type_name(), "agent: ignoring message");
                }
            }
        }
    }

    async fn register_all(&self, link: &ControlLink, tunnels: &[TunnelConfig]) {
        for t in tunnels {
            let req = RegTunnelRequest {
                name: t.name.clone(),
                protocol: t.protocol.clone(),
                remote_port: t.remote_port.into(),
            };
            match link.register(req, self.opts.response_timeout).await {
                Ok(resp) if resp.success => {
                    tracing::info!(
                        tunnel=%t.name,
                        local=%t.local_addr,
                        remote_port=resp.remote_port,
                        "agent: tunnel registered"
                    );
                }
                Ok(resp) => {
                    tracing::warn!(
                        tunnel=%t.name,
                        remote_port=t.remote_port,
                        err=%resp.error,
                        "agent: tunnel registration failed"
                    );
                }
                Err(RegisterError::NoResponse) => {
                    tracing::warn!(tunnel=%t.name, "agent: no reg_resp from relay");
                }
                Err(RegisterError::Protocol(err)) => {
                    // The read loop reports the broken connection.
                    tracing::debug!(tunnel=%t.name, err=%err, "agent: registration write failed");
                    return;
                }
            }
        }
    }

    async fn heartbeat(&self, link: &ControlLink) -> anyhow::Result<()> {
        let every = self.opts.heartbeat_interval;
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tick.tick().await;
            link.send(&Message::Ping).await.context("agent: heartbeat")?;
        }
    }

    fn on_new_conn(&self, note: NewConnRequest) {
        let tunnels = self.tunnels.load();
        let Some(t) = tunnels.iter().find(|t| t.name == note.tunnel_name) else {
            tracing::warn!(tunnel=%note.tunnel_name, conn_id=%note.conn_id, "agent: new_conn for unknown tunnel");
            return;
        };

        let opts = self.opts.clone();
        let local = t.local_addr.clone();
        tokio::spawn(async move {
            let conn_id = note.conn_id;
            let tunnel = note.tunnel_name;
            match serve_data_conn(&opts, &local, &conn_id).await {
                Ok(stats) => {
                    tracing::debug!(
                        tunnel=%tunnel,
                        conn_id=%conn_id,
                        egress=stats.a_to_b,
                        ingress=stats.b_to_a,
                        "agent: data connection closed"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        tunnel=%tunnel,
                        conn_id=%conn_id,
                        local=%local,
                        err=%format!("{err:#}"),
                        "agent: data connection failed"
                    );
                }
            }
        });
    }

    /// Adds a tunnel to the live configuration, registering it first when connected.
    pub async fn add_tunnel(&self, t: TunnelConfig) -> Result<TunnelConfig, TunnelEditError> {
        let t = t.normalize().ok_or(TunnelEditError::EmptyName)?;
        if t.local_addr.is_empty() {
            return Err(TunnelEditError::EmptyLocalAddr(t.name));
        }

        let _edit = self.edit.lock().await;
        if self.tunnels.load().iter().any(|x| x.name == t.name) {
            return Err(TunnelEditError::Duplicate(t.name));
        }

        if let Some(link) = self.link.load_full() {
            let req = RegTunnelRequest {
                name: t.name.clone(),
                protocol: t.protocol.clone(),
                remote_port: t.remote_port.into(),
            };
            let resp = match link.register(req, self.opts.response_timeout).await {
                Ok(resp) => resp,
                Err(RegisterError::NoResponse) => {
                    return Err(TunnelEditError::NoResponse(t.name));
                }
                Err(RegisterError::Protocol(err)) => return Err(err.into()),
            };
            if !resp.success {
                return Err(TunnelEditError::Rejected {
                    name: t.name,
                    reason: resp.error,
                });
            }
            tracing::info!(tunnel=%t.name, remote_port=resp.remote_port, "agent: tunnel added");
        } else {
            tracing::info!(tunnel=%t.name, "agent: tunnel added; registers on next connect");
        }

        let mut next = (**self.tunnels.load()).clone();
        next.push(t.clone());
        self.tunnels.store(Arc::new(next));
        Ok(t)
    }

    /// Drops a tunnel from the live configuration. Its relay port stays bound until
    /// the control connection ends.
    pub async fn remove_tunnel(&self, name: &str) -> Result<TunnelConfig, TunnelEditError> {
        let name = name.trim();
        let _edit = self.edit.lock().await;
        let mut next = (**self.tunnels.load()).clone();
        let Some(i) = next.iter().position(|t| t.name == name) else {
            return Err(TunnelEditError::NotFound(name.to_string()));
        };
        let removed = next.remove(i);
        self.tunnels.store(Arc::new(next));
        tracing::info!(tunnel=%removed.name, "agent: tunnel removed");
        Ok(removed)
    }
}

/// Resolves once shutdown is signalled or its sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

async fn authenticate<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    token: &str,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .send(&Message::Auth(AuthRequest {
            token: token.to_string(),
        }))
        .await
        .context("agent: send auth")?;

    match reader.read_message().await.context("agent: read auth_resp")? {
        Message::AuthResp(r) if r.success => Ok(()),
        Message::AuthResp(r) => anyhow::bail!("agent: auth rejected: {}", r.error),
        other => anyhow::bail!("agent: expected auth_resp, got {}", other.type_name()),
    }
}

async fn serve_data_conn(
    opts: &AgentOptions,
    local_addr: &str,
    conn_id: &str,
) -> anyhow::Result<BridgeStats> {
    let local = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(local_addr))
        .await
        .context("dial local timed out")?
        .with_context(|| format!("dial local {local_addr}"))?;
    let _ = local.set_nodelay(true);

    let relay = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(&opts.server_addr))
        .await
        .context("dial relay timed out")?
        .context("dial relay")?;
    let _ = relay.set_nodelay(true);

    let (rd, wr) = relay.into_split();
    let mut reader = MessageReader::new(rd);
    let mut writer = MessageWriter::new(wr);
    tokio::time::timeout(
        opts.response_timeout,
        authenticate(&mut reader, &mut writer, &opts.auth_token),
    )
    .await
    .context("auth timed out")??;

    writer
        .send(&Message::ProxyData(ProxyDataRequest {
            conn_id: conn_id.to_string(),
        }))
        .await
        .context("send proxy_data")?;

    Ok(bridge(local.into_split(), (reader.into_inner(), writer.into_inner())).await)
}
