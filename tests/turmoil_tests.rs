//! Turmoil-based simulation tests: full nodes over simulated TCP, with
//! connection failures, message latency and peer outages.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use maekawa::{
    BackoffConfig, Connector, LockError, MessageCodec, MutexNode, NodeConfig, Phase, ProcessId,
    Sleep, voting_groups,
};
use tokio_util::codec::Framed;
use turmoil::Builder;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for this crate).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("maekawa=debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

const MUTEX_PORT: u16 = 9999;

// --- Turmoil Sleep Implementation ---

#[derive(Clone, Copy, Default)]
struct TurmoilSleep;

impl Sleep for TurmoilSleep {
    async fn sleep(&self, duration: Duration) {
        // Turmoil intercepts tokio::time, so tokio's sleep advances sim time
        tokio::time::sleep(duration).await;
    }
}

// --- Turmoil Connector ---

type TurmoilConn = Framed<turmoil::net::TcpStream, MessageCodec>;

#[derive(Clone, Copy, Default)]
struct TurmoilConnector;

impl Connector for TurmoilConnector {
    type Connection = TurmoilConn;
    type Error = io::Error;
    type ConnectFuture =
        Pin<Box<dyn std::future::Future<Output = io::Result<TurmoilConn>> + Send>>;

    fn connect(&mut self, addr: &SocketAddr) -> Self::ConnectFuture {
        let addr = *addr;
        Box::pin(async move {
            let stream = turmoil::net::TcpStream::connect(addr).await?;
            Ok(Framed::new(stream, MessageCodec::new()))
        })
    }
}

type SimNode = MutexNode<TurmoilConnector, TurmoilSleep>;

/// Convert hostnames to SocketAddrs using turmoil's DNS lookup
fn peer_addrs(names: &[&str]) -> Vec<SocketAddr> {
    names
        .iter()
        .map(|name| SocketAddr::new(turmoil::lookup(*name), MUTEX_PORT))
        .collect()
}

/// Node config with a per-node seed for deterministic, asymmetric jitter.
fn sim_config(seed: u64) -> NodeConfig {
    NodeConfig {
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(200),
            multiplier: 2.0,
        },
        max_send_attempts: 20,
        rng_seed: seed,
    }
}

/// Accept inbound connections forever, one task per connection.
async fn serve(node: SimNode) -> io::Result<()> {
    let listener = turmoil::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, MUTEX_PORT)).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            node.serve_connection(Framed::new(stream, MessageCodec::new()))
                .await;
        });
    }
}

// --- Critical Section Log ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Enter(ProcessId),
    Exit(ProcessId),
}

type EventLog = Arc<Mutex<Vec<Event>>>;

/// Every Enter must be followed by the matching Exit before anyone else
/// enters.
fn assert_exclusive(events: &[Event]) {
    let mut inside: Option<ProcessId> = None;
    for event in events {
        match *event {
            Event::Enter(id) => {
                assert!(
                    inside.is_none(),
                    "{id} entered the critical section while {inside:?} was inside"
                );
                inside = Some(id);
            }
            Event::Exit(id) => {
                assert_eq!(inside, Some(id), "exit without matching enter");
                inside = None;
            }
        }
    }
    assert!(inside.is_none(), "critical section never exited");
}

/// One Maekawa process as a sim host: listener plus a lock/unlock driver.
/// Bumps `done` when its rounds are finished, then keeps serving votes.
fn start_node(
    sim: &mut turmoil::Sim<'_>,
    names: &'static [&'static str],
    id: ProcessId,
    rounds: usize,
    events: EventLog,
    done: Arc<Mutex<usize>>,
) {
    sim.host(names[id as usize], move || {
        let events = events.clone();
        let done = done.clone();
        async move {
            let addrs = peer_addrs(names);
            let groups = voting_groups(addrs.len()).expect("valid cluster size");
            let node = SimNode::with_sleep(
                id,
                addrs,
                TurmoilConnector,
                sim_config(u64::from(id)),
                TurmoilSleep,
            );
            node.init_epoch(groups[id as usize].clone());

            let acceptor = node.clone();
            tokio::spawn(async move {
                let _ = serve(acceptor).await;
            });

            // Stagger the first requests so the listeners are all up.
            tokio::time::sleep(Duration::from_millis(20 + 30 * u64::from(id))).await;

            for _round in 0..rounds {
                loop {
                    // Per-node deadlines break symmetric request deadlock:
                    // the loser withdraws, freeing its votes, and retries.
                    let deadline = Duration::from_millis(400 + 90 * u64::from(id));
                    match node.lock_timeout(deadline).await {
                        Ok(()) => break,
                        Err(report) => {
                            assert_eq!(*report.current_context(), LockError::Timeout, "{report:?}");
                        }
                    }
                }

                events.lock().unwrap().push(Event::Enter(id));
                tokio::time::sleep(Duration::from_millis(10)).await;
                events.lock().unwrap().push(Event::Exit(id));
                node.unlock().expect("lock should be held");

                tokio::time::sleep(Duration::from_millis(5 + 15 * u64::from(id))).await;
            }

            *done.lock().unwrap() += 1;
            // Keep the listener alive for peers still acquiring.
            std::future::pending::<()>().await;
            Ok(())
        }
    });
}

/// Client that ends the simulation once every node finished its rounds.
fn start_observer(sim: &mut turmoil::Sim<'_>, nodes: usize, done: Arc<Mutex<usize>>) {
    sim.client("observer", async move {
        while *done.lock().unwrap() < nodes {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    });
}

// --- Turmoil Tests ---

#[test]
fn turmoil_two_nodes_alternate_exclusively() {
    let _guard = init_tracing();
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(120))
        .build();

    const NAMES: &[&str] = &["proc-0", "proc-1"];
    const ROUNDS: usize = 3;

    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Mutex::new(0));
    for id in 0..NAMES.len() as ProcessId {
        start_node(&mut sim, NAMES, id, ROUNDS, events.clone(), done.clone());
    }
    start_observer(&mut sim, NAMES.len(), done);

    sim.run().unwrap();

    let events = events.lock().unwrap();
    assert_exclusive(&events);
    for id in 0..NAMES.len() as ProcessId {
        let entries = events.iter().filter(|e| **e == Event::Enter(id)).count();
        assert_eq!(entries, ROUNDS, "process {id} acquisitions");
    }
}

#[test]
fn turmoil_grid_quorum_contention() {
    let _guard = init_tracing();
    // Four nodes, 3-member voting groups, with message latency.
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(120))
        .min_message_latency(Duration::from_millis(1))
        .max_message_latency(Duration::from_millis(10))
        .build();

    const NAMES: &[&str] = &["proc-0", "proc-1", "proc-2", "proc-3"];
    const ROUNDS: usize = 2;

    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Mutex::new(0));
    for id in 0..NAMES.len() as ProcessId {
        start_node(&mut sim, NAMES, id, ROUNDS, events.clone(), done.clone());
    }
    start_observer(&mut sim, NAMES.len(), done);

    sim.run().unwrap();

    let events = events.lock().unwrap();
    assert_exclusive(&events);
    for id in 0..NAMES.len() as ProcessId {
        let entries = events.iter().filter(|e| **e == Event::Enter(id)).count();
        assert_eq!(entries, ROUNDS, "process {id} acquisitions");
    }
}

#[test]
fn turmoil_lock_times_out_when_peer_is_down() {
    let _guard = init_tracing();
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(30))
        .build();

    const NAMES: &[&str] = &["proc-0", "proc-1"];

    // proc-1 is on the network but never binds its listener, so every
    // vote request to it is refused.
    sim.host("proc-1", || async {
        std::future::pending::<()>().await;
        Ok(())
    });

    sim.client("proc-0", async move {
        let addrs = peer_addrs(NAMES);
        let groups = voting_groups(addrs.len()).unwrap();
        let node = SimNode::with_sleep(0, addrs, TurmoilConnector, sim_config(0), TurmoilSleep);
        node.init_epoch(groups[0].clone());

        let start = tokio::time::Instant::now();
        let report = node
            .lock_timeout(Duration::from_secs(1))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(*report.current_context(), LockError::Timeout);
        assert!(
            elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1500),
            "gave up after {elapsed:?}"
        );
        // The request was withdrawn; the node is reusable.
        assert_eq!(node.phase(), Phase::Idle);
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn turmoil_single_process_locks_without_a_network() {
    let _guard = init_tracing();
    let mut sim = Builder::new().build();

    sim.client("solo", async move {
        let addrs = peer_addrs(&["solo"]);
        let groups = voting_groups(addrs.len()).unwrap();
        let node = SimNode::with_sleep(0, addrs, TurmoilConnector, sim_config(0), TurmoilSleep);
        node.init_epoch(groups[0].clone());

        // Quorum is the node itself; no listener, no messages.
        node.lock().await.unwrap();
        assert_eq!(node.phase(), Phase::Holding);
        node.unlock().unwrap();
        assert_eq!(node.phase(), Phase::Idle);

        node.lock_timeout(Duration::from_millis(10)).await.unwrap();
        node.unlock().unwrap();
        Ok(())
    });

    sim.run().unwrap();
}
