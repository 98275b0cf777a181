//! End-to-end protocol scenarios over the in-memory network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tokio_util::bytes::Bytes;

use scuttle::testing::MockHub;
use scuttle::{
    DispatchEventHandler, Node, NodeStatus, Scuttle, ScuttleConfig, ScuttleConfigBuilder,
};

/// Records every callback so tests can assert on what the host saw.
#[derive(Default)]
struct Recorder {
    transitions: Mutex<Vec<(SocketAddr, NodeStatus, NodeStatus)>>,
    broadcasts: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

#[async_trait]
impl DispatchEventHandler for Recorder {
    async fn notify_status_change(
        &self,
        node: &Node,
        old_status: NodeStatus,
        new_status: NodeStatus,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.transitions
            .lock()
            .push((node.address(), old_status, new_status));
        Ok(())
    }

    async fn notify_broadcast(
        &self,
        origin: SocketAddr,
        payload: Bytes,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.broadcasts.lock().push((origin, payload.to_vec()));
        Ok(())
    }
}

impl Recorder {
    fn saw_transition(&self, addr: SocketAddr, old: NodeStatus, new: NodeStatus) -> bool {
        self.transitions
            .lock()
            .iter()
            .any(|(a, o, n)| *a == addr && *o == old && *n == new)
    }

    fn broadcast_count(&self, origin: SocketAddr, payload: &[u8]) -> usize {
        self.broadcasts
            .lock()
            .iter()
            .filter(|(o, p)| *o == origin && p == payload)
            .count()
    }
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Fast protocol timings so scenarios settle in tens of milliseconds.
fn fast_config(port: u16, seeds: &[u16]) -> ScuttleConfigBuilder {
    ScuttleConfig::builder()
        .listen_ip("127.0.0.1")
        .listen_port(port)
        .heartbeat(Duration::from_millis(40))
        .direct_timeout(Duration::from_millis(60))
        .indirect_timeout(Duration::from_millis(150))
        .suspicion(Duration::from_millis(300))
        .seed_nodes(seeds.iter().map(|p| addr(*p)))
}

struct TestNode {
    handle: Scuttle,
    recorder: Arc<Recorder>,
}

async fn spawn_node(hub: &MockHub, config: ScuttleConfig) -> TestNode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let recorder = Arc::new(Recorder::default());
    let (transport, channel) = hub.open(config.listen_addr());
    let handle = Scuttle::with_custom(
        config,
        Arc::new(transport),
        channel,
        Some(recorder.clone()),
    )
    .unwrap();

    let runner = handle.clone();
    tokio::spawn(async move {
        let _ = runner.start().await;
    });
    // Let `start` claim the channel and spawn its loops.
    time::sleep(Duration::from_millis(5)).await;
    TestNode { handle, recorder }
}

async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn status_of(node: &Scuttle, member: SocketAddr) -> Option<NodeStatus> {
    node.members()
        .into_iter()
        .find(|n| n.address() == member)
        .map(|n| n.status())
}

fn sees_alive(node: &Scuttle, member: SocketAddr) -> bool {
    status_of(node, member) == Some(NodeStatus::Alive)
}

#[tokio::test]
async fn test_two_node_bring_up() {
    let hub = MockHub::new();
    let a = spawn_node(&hub, fast_config(9001, &[9002]).build().unwrap()).await;
    let b = spawn_node(&hub, fast_config(9002, &[]).build().unwrap()).await;

    let b_heartbeat_at_a = || {
        a.handle
            .members()
            .into_iter()
            .find(|n| n.address() == addr(9002))
            .map(|n| n.heartbeat)
            .unwrap_or(0)
    };
    assert!(
        wait_for(
            || {
                sees_alive(&a.handle, addr(9002))
                    && sees_alive(&b.handle, addr(9001))
                    && b_heartbeat_at_a() >= 1
            },
            Duration::from_secs(2),
        )
        .await,
        "both nodes should see each other alive"
    );

    a.handle.stop().unwrap();
    b.handle.stop().unwrap();
}

#[tokio::test]
async fn test_crashed_node_is_suspected_then_declared_dead() {
    let hub = MockHub::new();
    let a = spawn_node(&hub, fast_config(9011, &[9012, 9013]).build().unwrap()).await;
    let b = spawn_node(&hub, fast_config(9012, &[9011]).build().unwrap()).await;
    let c = spawn_node(&hub, fast_config(9013, &[9011]).build().unwrap()).await;

    assert!(
        wait_for(
            || {
                sees_alive(&a.handle, addr(9012))
                    && sees_alive(&a.handle, addr(9013))
                    && sees_alive(&b.handle, addr(9013))
                    && sees_alive(&c.handle, addr(9012))
            },
            Duration::from_secs(3),
        )
        .await,
        "three-node cluster should converge to all-alive"
    );

    hub.crash(addr(9013));

    assert!(
        wait_for(
            || {
                status_of(&a.handle, addr(9013)) == Some(NodeStatus::Dead)
                    && status_of(&b.handle, addr(9013)) == Some(NodeStatus::Dead)
            },
            Duration::from_secs(5),
        )
        .await,
        "survivors should declare the crashed node dead"
    );

    // Somebody walked the suspect phase before the death verdict; the other
    // node may have learned the final state through gossip.
    assert!(
        a.recorder
            .saw_transition(addr(9013), NodeStatus::Alive, NodeStatus::Suspect)
            || b.recorder
                .saw_transition(addr(9013), NodeStatus::Alive, NodeStatus::Suspect)
    );

    a.handle.stop().unwrap();
    b.handle.stop().unwrap();
    c.handle.stop().unwrap();
}

#[tokio::test]
async fn test_indirect_probe_saves_partitioned_link() {
    let hub = MockHub::new();
    let a = spawn_node(&hub, fast_config(9021, &[9022, 9023]).build().unwrap()).await;
    let b = spawn_node(&hub, fast_config(9022, &[9021]).build().unwrap()).await;
    let c = spawn_node(&hub, fast_config(9023, &[9021]).build().unwrap()).await;

    assert!(
        wait_for(
            || sees_alive(&a.handle, addr(9023)) && sees_alive(&c.handle, addr(9021)),
            Duration::from_secs(3),
        )
        .await
    );

    // A and C cannot talk directly, but both can reach B.
    hub.drop_link(addr(9021), addr(9023));
    time::sleep(Duration::from_secs(2)).await;

    assert_eq!(status_of(&a.handle, addr(9023)), Some(NodeStatus::Alive));
    assert!(
        !a.recorder
            .saw_transition(addr(9023), NodeStatus::Alive, NodeStatus::Suspect),
        "indirect acks through B should prevent suspicion"
    );

    a.handle.stop().unwrap();
    b.handle.stop().unwrap();
    c.handle.stop().unwrap();
}

#[tokio::test]
async fn test_dead_node_resurrects() {
    let hub = MockHub::new();
    let a = spawn_node(
        &hub,
        fast_config(9031, &[9032, 9033])
            .resurrection_period(5)
            .build()
            .unwrap(),
    )
    .await;
    let b = spawn_node(
        &hub,
        fast_config(9032, &[9031])
            .resurrection_period(5)
            .build()
            .unwrap(),
    )
    .await;
    // C only answers probes: its own scheduler is effectively off, so the
    // way back in is a live node's resurrection probe.
    let c = spawn_node(
        &hub,
        fast_config(9033, &[])
            .heartbeat(Duration::from_secs(3_600))
            .suspicion(Duration::from_millis(300))
            .build()
            .unwrap(),
    )
    .await;

    assert!(
        wait_for(
            || sees_alive(&a.handle, addr(9033)) && sees_alive(&b.handle, addr(9033)),
            Duration::from_secs(3),
        )
        .await
    );

    hub.crash(addr(9033));
    assert!(
        wait_for(
            || {
                status_of(&a.handle, addr(9033)) == Some(NodeStatus::Dead)
                    && status_of(&b.handle, addr(9033)) == Some(NodeStatus::Dead)
            },
            Duration::from_secs(5),
        )
        .await,
        "crashed node should be declared dead"
    );

    hub.revive(addr(9033));
    assert!(
        wait_for(
            || sees_alive(&a.handle, addr(9033)) && sees_alive(&b.handle, addr(9033)),
            Duration::from_secs(5),
        )
        .await,
        "revived node should return to alive everywhere"
    );
    assert!(
        a.handle.stats().resurrections >= 1 || b.handle.stats().resurrections >= 1,
        "some live node should have observed the resurrection"
    );

    a.handle.stop().unwrap();
    b.handle.stop().unwrap();
    c.handle.stop().unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_every_node_exactly_once() {
    let hub = MockHub::new();
    let ports = [9041u16, 9042, 9043, 9044, 9045];
    let mut nodes = Vec::new();
    for port in ports {
        let seeds: Vec<u16> = ports.iter().copied().filter(|p| *p != port).collect();
        nodes.push(spawn_node(&hub, fast_config(port, &seeds).build().unwrap()).await);
    }

    assert!(
        wait_for(
            || {
                nodes.iter().all(|n| {
                    ports
                        .iter()
                        .filter(|p| addr(**p) != n.handle.local_addr())
                        .all(|p| sees_alive(&n.handle, addr(*p)))
                })
            },
            Duration::from_secs(5),
        )
        .await,
        "five-node cluster should converge to all-alive"
    );

    nodes[0].handle.broadcast_bytes(b"hello").await.unwrap();

    assert!(
        wait_for(
            || {
                nodes
                    .iter()
                    .all(|n| n.recorder.broadcast_count(addr(9041), b"hello") >= 1)
            },
            Duration::from_secs(5),
        )
        .await,
        "broadcast should reach every node"
    );

    // Redundant copies keep arriving for a while; none may be re-delivered.
    time::sleep(Duration::from_millis(500)).await;
    for node in &nodes {
        assert_eq!(
            node.recorder.broadcast_count(addr(9041), b"hello"),
            1,
            "broadcast must be applied at most once per process"
        );
    }

    for node in &nodes {
        node.handle.stop().unwrap();
    }
}

#[tokio::test]
async fn test_oversized_broadcast_rejected() {
    let hub = MockHub::new();
    let a = spawn_node(&hub, fast_config(9051, &[]).build().unwrap()).await;
    let payload = vec![0u8; 257];
    assert!(a.handle.broadcast_bytes(&payload).await.is_err());
    a.handle.stop().unwrap();
}

#[tokio::test]
async fn test_leave_is_gossiped_on_stop() {
    let hub = MockHub::new();
    let a = spawn_node(&hub, fast_config(9061, &[9062]).build().unwrap()).await;
    let b = spawn_node(&hub, fast_config(9062, &[9061]).build().unwrap()).await;

    assert!(
        wait_for(
            || sees_alive(&a.handle, addr(9062)) && sees_alive(&b.handle, addr(9061)),
            Duration::from_secs(2),
        )
        .await
    );

    b.handle.stop().unwrap();
    // The record is flushed shortly after, so check the callback too.
    assert!(
        wait_for(
            || {
                status_of(&a.handle, addr(9062)) == Some(NodeStatus::Left)
                    || a.recorder
                        .saw_transition(addr(9062), NodeStatus::Alive, NodeStatus::Left)
            },
            Duration::from_secs(2),
        )
        .await,
        "departing node should gossip a terminal left update"
    );

    a.handle.stop().unwrap();
}
