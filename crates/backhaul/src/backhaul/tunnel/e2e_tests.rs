//! Relay, agent and a local service wired together over loopback.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::backhaul::config::TunnelConfig;
use crate::backhaul::tunnel::{
    agent::{Agent, tests::agent_options},
    relay::{
        Relay,
        tests::{free_port, relay_options, start_relay},
    },
};

/// Replies `PONG` to `PING` and echoes everything else.
async fn start_local_service() -> SocketAddr {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = ln.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let reply: &[u8] = if &buf[..n] == b"PING" { b"PONG" } else { &buf[..n] };
                    if conn.write_all(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn tunnel(name: &str, local: SocketAddr, port: u16) -> TunnelConfig {
    TunnelConfig {
        name: name.into(),
        protocol: "tcp".into(),
        local_addr: local.to_string(),
        remote_port: port,
    }
}

async fn start_agent(
    relay: SocketAddr,
    tunnels: Vec<TunnelConfig>,
) -> (Arc<Agent>, watch::Sender<bool>) {
    let mut opts = agent_options(relay, "T");
    opts.tunnels = tunnels;
    let agent = Arc::new(Agent::new(opts));
    let (tx, rx) = watch::channel(false);
    tokio::spawn({
        let agent = agent.clone();
        async move { agent.run(rx).await }
    });
    (agent, tx)
}

async fn wait_for_tunnels(relay: &Relay, n: usize) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while relay.tunnels().len().await < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tunnels registered");
}

async fn ping_through(port: u16) -> [u8; 4] {
    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    public.write_all(b"PING").await.unwrap();
    let mut got = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(3), public.read_exact(&mut got))
        .await
        .expect("reply in time")
        .unwrap();
    got
}

#[tokio::test]
async fn ping_round_trips_through_relay_and_agent() {
    let local = start_local_service().await;
    let (relay, addr, _stop) = start_relay(relay_options(None, "T")).await;
    let port = free_port().await;

    let (_agent, shutdown) = start_agent(addr, vec![tunnel("web", local, port)]).await;
    wait_for_tunnels(&relay, 1).await;

    assert_eq!(&ping_through(port).await, b"PONG");

    // Every connection gets its own data channel.
    let (a, b) = tokio::join!(ping_through(port), ping_through(port));
    assert_eq!(&a, b"PONG");
    assert_eq!(&b, b"PONG");

    // Bulk bytes pass through unmodified.
    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    public.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(3), public.read_exact(&mut echoed))
        .await
        .expect("echo in time")
        .unwrap();
    assert_eq!(echoed, payload);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn port_conflict_fails_one_tunnel_and_keeps_the_rest() {
    let local = start_local_service().await;
    let (relay, addr, _stop) = start_relay(relay_options(None, "T")).await;
    let shared = free_port().await;
    let other = free_port().await;

    let (_first, stop_first) = start_agent(addr, vec![tunnel("web", local, shared)]).await;
    wait_for_tunnels(&relay, 1).await;

    let (second, stop_second) = start_agent(
        addr,
        vec![tunnel("web2", local, shared), tunnel("api", local, other)],
    )
    .await;
    wait_for_tunnels(&relay, 2).await;

    let names: Vec<String> = relay
        .tunnels()
        .snapshot()
        .await
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert!(names.contains(&"web".to_string()));
    assert!(names.contains(&"api".to_string()));
    assert!(!names.contains(&"web2".to_string()));

    // Both working tunnels serve traffic and the second agent's control connection
    // survived the failed registration.
    assert_eq!(&ping_through(shared).await, b"PONG");
    assert_eq!(&ping_through(other).await, b"PONG");
    assert!(second.connected());

    let _ = stop_first.send(true);
    let _ = stop_second.send(true);
}

#[tokio::test]
async fn wrong_token_agent_creates_nothing() {
    let local = start_local_service().await;
    let (relay, addr, _stop) = start_relay(relay_options(None, "T")).await;
    let port = free_port().await;

    let mut opts = agent_options(addr, "wrong");
    opts.tunnels = vec![tunnel("web", local, port)];
    let agent = Agent::new(opts);
    let (_tx, rx) = watch::channel(false);
    assert!(agent.run_once(rx).await.is_err());

    assert_eq!(relay.tunnels().len().await, 0);
    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}

#[tokio::test]
async fn tunnel_added_at_runtime_serves_traffic() {
    let local = start_local_service().await;
    let (relay, addr, _stop) = start_relay(relay_options(None, "T")).await;
    let (agent, shutdown) = start_agent(addr, Vec::new()).await;
    tokio::time::timeout(Duration::from_secs(3), async {
        while !agent.connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent connected");

    let port = free_port().await;
    agent.add_tunnel(tunnel("late", local, port)).await.unwrap();
    assert_eq!(relay.tunnels().len().await, 1);
    assert_eq!(&ping_through(port).await, b"PONG");

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn agent_shutdown_releases_relay_ports() {
    let local = start_local_service().await;
    let (relay, addr, _stop) = start_relay(relay_options(None, "T")).await;
    let port = free_port().await;

    let (_agent, shutdown) = start_agent(addr, vec![tunnel("web", local, port)]).await;
    wait_for_tunnels(&relay, 1).await;
    shutdown.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(3), async {
        while relay.tunnels().len().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tunnels released");
    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}
