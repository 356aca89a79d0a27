use async_trait::async_trait;
use serde::Serialize;

use crate::backhaul::config::TunnelConfig;
use crate::backhaul::tunnel::{
    agent::{Agent, TunnelEditError},
    relay::Relay,
};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Status {
    Server(RelayStatus),
    Client(AgentStatus),
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub control_port: u16,
    #[serde(rename = "tunnels_count")]
    pub tunnel_count: usize,
    pub pending_conns: usize,
    pub tunnels: Vec<TunnelStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub name: String,
    pub protocol: String,
    pub remote_port: u16,
    pub active_conns: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub server_addr: String,
    pub connected: bool,
    pub tunnels: Vec<TunnelConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("not supported in {0} mode")]
    Unsupported(&'static str),
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Internal(String),
}

impl From<TunnelEditError> for StatusError {
    fn from(err: TunnelEditError) -> Self {
        let msg = err.to_string();
        match err {
            TunnelEditError::EmptyName | TunnelEditError::EmptyLocalAddr(_) => {
                StatusError::Invalid(msg)
            }
            TunnelEditError::Duplicate(_) => StatusError::Conflict(msg),
            TunnelEditError::NotFound(_) => StatusError::NotFound(msg),
            TunnelEditError::Rejected { .. } => StatusError::Rejected(msg),
            TunnelEditError::NoResponse(_) | TunnelEditError::Protocol(_) => {
                StatusError::Internal(msg)
            }
        }
    }
}

/// What the dashboard can ask of a running relay or agent.
#[async_trait]
pub trait StatusProvider: Send + Sync {
    async fn status(&self) -> Status;

    async fn add_tunnel(&self, tunnel: TunnelConfig) -> Result<TunnelConfig, StatusError>;

    async fn remove_tunnel(&self, name: &str) -> Result<TunnelConfig, StatusError>;
}

#[async_trait]
impl StatusProvider for Relay {
    async fn status(&self) -> Status {
        let tunnels: Vec<TunnelStatus> = self
            .tunnels()
            .snapshot()
            .await
            .into_iter()
            .map(|t| TunnelStatus {
                name: t.name.clone(),
                protocol: t.protocol.clone(),
                remote_port: t.remote_port,
                active_conns: t.active_conns(),
            })
            .collect();
        Status::Server(RelayStatus {
            control_port: self.control_port(),
            tunnel_count: tunnels.len(),
            pending_conns: self.pending().len(),
            tunnels,
        })
    }

    async fn add_tunnel(&self, _tunnel: TunnelConfig) -> Result<TunnelConfig, StatusError> {
        Err(StatusError::Unsupported("server"))
    }

    async fn remove_tunnel(&self, _name: &str) -> Result<TunnelConfig, StatusError> {
        Err(StatusError::Unsupported("server"))
    }
}

#[async_trait]
impl StatusProvider for Agent {
    async fn status(&self) -> Status {
        Status::Client(AgentStatus {
            server_addr: self.server_addr().to_string(),
            connected: self.connected(),
            tunnels: self.tunnels().as_ref().clone(),
        })
    }

    async fn add_tunnel(&self, tunnel: TunnelConfig) -> Result<TunnelConfig, StatusError> {
        Ok(Agent::add_tunnel(self, tunnel).await?)
    }

    async fn remove_tunnel(&self, name: &str) -> Result<TunnelConfig, StatusError> {
        Ok(Agent::remove_tunnel(self, name).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::{net::TcpStream, sync::watch};

    use super::*;
    use crate::backhaul::tunnel::{
        agent::tests::agent_options,
        relay::tests::{free_port, relay_options, start_relay},
    };

    fn web(port: u16) -> TunnelConfig {
        TunnelConfig {
            name: "web".into(),
            protocol: "tcp".into(),
            local_addr: "127.0.0.1:1".into(),
            remote_port: port,
        }
    }

    #[tokio::test]
    async fn relay_reports_tunnels_and_refuses_edits() {
        let (relay, addr, _stop) = start_relay(relay_options(None, "T")).await;
        let provider: Arc<dyn StatusProvider> = relay.clone();

        let Status::Server(st) = provider.status().await else {
            panic!("expected server status");
        };
        assert_eq!(st.control_port, addr.port());
        assert_eq!(st.tunnel_count, 0);

        assert!(matches!(
            provider.add_tunnel(web(1)).await,
            Err(StatusError::Unsupported("server"))
        ));
        assert!(matches!(
            provider.remove_tunnel("web").await,
            Err(StatusError::Unsupported("server"))
        ));

        let v = serde_json::to_value(provider.status().await).unwrap();
        assert_eq!(v["mode"], "server");
        assert_eq!(v["control_port"], addr.port());
        assert_eq!(v["tunnels_count"], 0);
        assert_eq!(v["tunnels"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected_without_duplication() {
        let (relay, addr, _stop) = start_relay(relay_options(None, "T")).await;
        let agent = Arc::new(Agent::new(agent_options(addr, "T")));
        let (tx, rx) = watch::channel(false);
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });
        tokio::time::timeout(Duration::from_secs(3), async {
            while !agent.connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("agent connected");

        let provider: Arc<dyn StatusProvider> = agent.clone();
        let port = free_port().await;
        provider.add_tunnel(web(port)).await.unwrap();

        let err = provider.add_tunnel(web(free_port().await)).await.unwrap_err();
        assert!(matches!(err, StatusError::Conflict(_)), "{err}");

        let Status::Client(st) = provider.status().await else {
            panic!("expected client status");
        };
        assert!(st.connected);
        assert_eq!(st.tunnels.len(), 1);
        assert_eq!(st.tunnels[0].remote_port, port);
        assert_eq!(relay.tunnels().len().await, 1);

        // Only the first registration owns a public port.
        TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        assert!(matches!(
            provider.remove_tunnel("nope").await,
            Err(StatusError::NotFound(_))
        ));
        tx.send(true).unwrap();
    }

    #[test]
    fn edit_errors_map_to_status_errors() {
        assert!(matches!(
            StatusError::from(TunnelEditError::EmptyName),
            StatusError::Invalid(_)
        ));
        let err = StatusError::from(TunnelEditError::Rejected {
            name: "web".into(),
            reason: "port 80 unavailable".into(),
        });
        assert!(matches!(err, StatusError::Rejected(_)));
        assert!(err.to_string().contains("port 80 unavailable"));
    }
}
