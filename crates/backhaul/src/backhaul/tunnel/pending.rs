use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use rand::{RngExt, rng};
use tokio::net::TcpStream;

use crate::backhaul::tunnel::registry::ActiveConn;

pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(10);

/// A public connection waiting for the agent's data connection.
#[derive(Debug)]
pub struct PendingConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub conn: ActiveConn,
    pub accepted_at: Instant,
}

/// Rendezvous table between accepted public connections and agent claims.
///
/// Every removal path (claim, expiry, rollback) goes through `DashMap::remove`,
/// so an entry is handed out at most once.
pub struct PendingRegistry {
    conns: DashMap<String, PendingConnection>,
    nonce: u32,
    seq: AtomicU64,
    timeout: Duration,
}

impl std::fmt::Debug for PendingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistry")
            .field("len", &self.conns.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PendingRegistry {
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_PENDING_TIMEOUT
        } else {
            timeout
        };
        Self {
            conns: DashMap::new(),
            nonce: rng().random::<u32>(),
            seq: AtomicU64::new(1),
            timeout,
        }
    }

    /// Returns an id never handed out before by this process.
    ///
    /// The random per-registry prefix keeps a late claim aimed at a previous relay
    /// process from matching a fresh connection.
    pub fn next_id(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{:08x}-{n}", self.nonce)
    }

    pub fn insert(&self, id: String, pc: PendingConnection) {
        self.conns.insert(id, pc);
    }

    pub fn claim(&self, id: &str) -> Option<PendingConnection> {
        let (_, pc) = self.conns.remove(id)?;
        metrics::counter!("backhaul_pending_claimed_total").increment(1);
        Some(pc)
    }

    /// Drops the entry if it is still waiting. Returns whether this call removed it.
    pub fn expire(&self, id: &str) -> bool {
        let Some((_, pc)) = self.conns.remove(id) else {
            return false;
        };
        metrics::counter!("backhaul_pending_expired_total").increment(1);
        tracing::info!(
            conn_id=%id,
            tunnel=%pc.conn.tunnel().name,
            peer=%pc.peer,
            waited=%humantime::format_duration(trim_millis(pc.accepted_at.elapsed())),
            "pending: timed out waiting for agent"
        );
        true
    }

    /// Removes an entry whose notification never reached the agent.
    pub fn discard(&self, id: &str) -> bool {
        self.conns.remove(id).is_some()
    }

    pub fn arm_expiry(self: &Arc<Self>, id: String) -> tokio::task::JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(me.timeout).await;
            me.expire(&id);
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conns.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }
}

fn trim_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}
