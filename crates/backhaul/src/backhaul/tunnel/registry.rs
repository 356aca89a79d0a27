use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{net::TcpListener, sync::RwLock, sync::watch, task::JoinHandle};

use crate::backhaul::net;

pub type SessionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("empty tunnel name")]
    EmptyName,
    #[error("port {0} is not a valid TCP port")]
    InvalidPort(i64),
    #[error("port {port} is out of allowed range {range}")]
    PortOutOfRange { port: u16, range: PortRange },
    #[error("tunnel {0:?} is already registered on this connection")]
    DuplicateName(String),
    #[error("port {port} is unavailable: {source}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Inclusive range of ports agents may expose, written `min-max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((lo, hi)) = s.trim().split_once('-') else {
            anyhow::bail!("port range {s:?}: expected min-max");
        };
        let min: u16 = lo
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("port range {s:?}: bad lower bound"))?;
        let max: u16 = hi
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("port range {s:?}: bad upper bound"))?;
        if min == 0 || min > max {
            anyhow::bail!("port range {s:?}: need 1 <= min <= max");
        }
        Ok(Self { min, max })
    }
}

#[derive(Debug)]
pub struct Tunnel {
    pub name: String,
    pub protocol: String,
    pub remote_port: u16,
    pub session: SessionId,
    active: AtomicU64,
}

impl Tunnel {
    pub fn new(session: SessionId, name: &str, protocol: &str, remote_port: u16) -> Self {
        let mut protocol = protocol.trim().to_ascii_lowercase();
        if protocol.is_empty() {
            protocol = "tcp".into();
        }
        Self {
            name: name.trim().to_string(),
            protocol,
            remote_port,
            session,
            active: AtomicU64::new(0),
        }
    }

    pub fn active_conns(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// One live public connection counted against its tunnel.
///
/// The count goes down when this is dropped, wherever the connection ended up
/// (pending table, expiry, rollback or bridge).
#[derive(Debug)]
pub struct ActiveConn {
    tunnel: Arc<Tunnel>,
}

impl ActiveConn {
    pub fn acquire(tunnel: &Arc<Tunnel>) -> Self {
        tunnel.active.fetch_add(1, Ordering::Relaxed);
        Self {
            tunnel: tunnel.clone(),
        }
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }
}

impl Drop for ActiveConn {
    fn drop(&mut self) {
        self.tunnel.active.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Entry {
    tunnel: Arc<Tunnel>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Tunnels currently exposed by this relay, keyed by owning session and name.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<(SessionId, String), Entry>>,
}

impl fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRegistry").finish_non_exhaustive()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
        }
    }

    /// Validates a registration and binds its public listener.
    ///
    /// Nothing is recorded until [`TunnelRegistry::activate`]; on error no port is held.
    pub async fn reserve(
        &self,
        session: SessionId,
        name: &str,
        protocol: &str,
        port: u16,
        range: Option<PortRange>,
        bind_host: &str,
    ) -> Result<(Arc<Tunnel>, TcpListener), RegistryError> {
        if let Some(range) = range {
            if !range.contains(port) {
                return Err(RegistryError::PortOutOfRange { port, range });
            }
        }

        let name = name.trim();
        {
            let st = self.tunnels.read().await;
            if st.contains_key(&(session, name.to_string())) {
                return Err(RegistryError::DuplicateName(name.to_string()));
            }
        }

        let addr = net::join_host_port(bind_host, port);
        let ln = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| RegistryError::PortUnavailable { port, source })?;
        // Port 0 asks the OS for one; report what was bound.
        let bound = ln.local_addr().map(|a| a.port()).unwrap_or(port);
        Ok((Arc::new(Tunnel::new(session, name, protocol, bound)), ln))
    }

    /// Records a tunnel whose accept loop is already running.
    pub async fn activate(
        &self,
        tunnel: Arc<Tunnel>,
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) {
        let key = (tunnel.session, tunnel.name.clone());
        let mut st = self.tunnels.write().await;
        if let Some(old) = st.insert(key, Entry { tunnel, stop, task }) {
            // Sessions register sequentially, so this only happens on misuse.
            let _ = old.stop.send(true);
            old.task.abort();
        }
        metrics::gauge!("backhaul_tunnels").set(st.len() as f64);
    }

    /// Removes every tunnel owned by `session` and waits for their listeners to close.
    pub async fn release_session(&self, session: SessionId) -> Vec<Arc<Tunnel>> {
        let removed: Vec<Entry> = {
            let mut st = self.tunnels.write().await;
            let keys: Vec<(SessionId, String)> =
                st.keys().filter(|(s, _)| *s == session).cloned().collect();
            let removed: Vec<Entry> = keys.iter().filter_map(|k| st.remove(k)).collect();
            metrics::gauge!("backhaul_tunnels").set(st.len() as f64);
            removed
        };

        let mut out = Vec::with_capacity(removed.len());
        for e in removed {
            let _ = e.stop.send(true);
            let _ = e.task.await;
            tracing::info!(
                tunnel=%e.tunnel.name,
                port=e.tunnel.remote_port,
                session=session,
                "tunnel: released"
            );
            out.push(e.tunnel);
        }
        out
    }

    pub async fn snapshot(&self) -> Vec<Arc<Tunnel>> {
        let st = self.tunnels.read().await;
        let mut out: Vec<Arc<Tunnel>> = st.values().map(|e| e.tunnel.clone()).collect();
        out.sort_by(|a, b| {
            a.remote_port
                .cmp(&b.remote_port)
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }

    pub async fn owned_by(&self, session: SessionId) -> usize {
        let st = self.tunnels.read().await;
        st.keys().filter(|(s, _)| *s == session).count()
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }
}
