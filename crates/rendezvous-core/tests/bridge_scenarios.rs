//! End-to-end bridge scenarios over the virtual radio medium
//!
//! Each test builds independent bridge instances on one shared `VirtualAir`
//! and drives them through discovery, linking, data exchange and teardown.

use std::future::Future;

use rendezvous_core::{
    Bridge, BridgeConfig, BridgeError, BridgeMode, BridgeState, Fault, InboundMessage, LinkPhase,
    PeerAddress, RadioError, Role, StationOptions, VirtualAir, VirtualCentral, VirtualPeripheral,
    LOCAL_PEER_ID,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

const WINDOW: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);
const SETTLE: Duration = Duration::from_millis(100);

type VirtualBridge = Bridge<VirtualCentral, VirtualPeripheral>;

struct Node {
    address: PeerAddress,
    bridge: VirtualBridge,
    inbox: mpsc::UnboundedReceiver<InboundMessage>,
}

async fn node(air: &VirtualAir, address: &str, options: StationOptions) -> Node {
    let (central, peripheral) = air.station(address, options).await;
    let (tx, inbox) = mpsc::unbounded_channel();
    let config = BridgeConfig::new().with_link_timeout(Duration::from_millis(500));
    let bridge = Bridge::with_config(central, peripheral, tx, config).unwrap();
    Node {
        address: PeerAddress::from(address),
        bridge,
        inbox,
    }
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = timeout(WINDOW, async {
        while !condition().await {
            sleep(POLL).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

async fn has_peer(bridge: &VirtualBridge, address: &PeerAddress, phase: LinkPhase) -> bool {
    bridge
        .peers()
        .await
        .iter()
        .any(|p| &p.address == address && p.phase == phase)
}

async fn recv(node: &mut Node) -> InboundMessage {
    timeout(WINDOW, node.inbox.recv())
        .await
        .expect("no message within the discovery window")
        .expect("sink closed")
}

/// Start X and Y on team1 and wait until each is subscribed to the other
async fn linked_pair(air: &VirtualAir) -> (Node, Node) {
    let x = node(air, "AA:00:00:00:00:01", StationOptions::default()).await;
    let y = node(air, "AA:00:00:00:00:02", StationOptions::default()).await;
    x.bridge.start("team1", "X").await.unwrap();
    y.bridge.start("team1", "Y").await.unwrap();

    let (xb, yb) = (&x.bridge, &y.bridge);
    let (xa, ya) = (&x.address, &y.address);
    eventually("X subscribed to Y", move || async move {
        has_peer(xb, ya, LinkPhase::Subscribed).await
    })
    .await;
    eventually("Y subscribed to X", move || async move {
        has_peer(yb, xa, LinkPhase::Subscribed).await
    })
    .await;
    eventually("both registries populated", move || async move {
        xb.subscriber_count().await == 1 && yb.subscriber_count().await == 1
    })
    .await;

    (x, y)
}

#[tokio::test]
async fn test_ping_reaches_peer_with_same_client_id() {
    let air = VirtualAir::new();
    let (x, mut y) = linked_pair(&air).await;

    x.bridge.send(b"ping").await.unwrap();

    let message = recv(&mut y).await;
    assert_eq!(message.payload, b"ping");
    assert_eq!(message.peer_id, x.address.to_string());
    assert_eq!(message.via, Role::Central);
}

#[tokio::test]
async fn test_other_network_is_isolated() {
    let air = VirtualAir::new();
    let mut z = node(&air, "AA:00:00:00:00:03", StationOptions::default()).await;
    z.bridge.start("team2", "Z").await.unwrap();
    let (x, mut y) = linked_pair(&air).await;

    x.bridge.send(b"ping").await.unwrap();
    assert_eq!(recv(&mut y).await.payload, b"ping");
    sleep(SETTLE).await;

    assert!(z.inbox.try_recv().is_err());
    assert!(x.bridge.peers().await.iter().all(|p| p.address != z.address));
    assert!(z.bridge.peers().await.is_empty());
    assert_eq!(x.bridge.subscriber_count().await, 1);
    assert_eq!(z.bridge.subscriber_count().await, 0);
}

#[tokio::test]
async fn test_repeated_advertisements_open_one_connection() {
    let air = VirtualAir::new();
    let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;
    let y = node(&air, "AA:00:00:00:00:02", StationOptions::default()).await;
    air.set_fault(&y.address, Fault::DelayConnect(Duration::from_millis(150)))
        .await;

    y.bridge.start("team1", "Y").await.unwrap();
    x.bridge.start("team1", "X").await.unwrap();

    let (xb, ya) = (&x.bridge, &y.address);
    eventually("X discovered Y", move || async move {
        has_peer(xb, ya, LinkPhase::Discovered).await
    })
    .await;

    for _ in 0..3 {
        air.rebroadcast(&y.address).await;
    }
    sleep(Duration::from_millis(20)).await;
    assert_eq!(x.bridge.peers().await.len(), 1);

    eventually("X subscribed to Y", move || async move {
        has_peer(xb, ya, LinkPhase::Subscribed).await
    })
    .await;
    air.rebroadcast(&y.address).await;
    sleep(SETTLE).await;

    assert_eq!(x.bridge.peers().await.len(), 1);
    assert_eq!(air.subscribers(&y.address).await, vec![x.address.clone()]);
}

#[tokio::test]
async fn test_own_advertisement_is_ignored() {
    let air = VirtualAir::new();
    let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;
    x.bridge.start("team1", "X").await.unwrap();

    air.rebroadcast(&x.address).await;
    sleep(SETTLE).await;

    assert!(x.bridge.peers().await.is_empty());
    assert!(air.subscribers(&x.address).await.is_empty());
}

#[tokio::test]
async fn test_empty_self_id_excludes_unnamed_advertisements() {
    let air = VirtualAir::new();
    let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;
    let y = node(&air, "AA:00:00:00:00:02", StationOptions::default()).await;
    x.bridge.start("team1", "").await.unwrap();
    y.bridge.start("team1", "Y").await.unwrap();

    let (xb, yb) = (&x.bridge, &y.bridge);
    let (xa, ya) = (&x.address, &y.address);
    eventually("X subscribed to Y", move || async move {
        has_peer(xb, ya, LinkPhase::Subscribed).await
    })
    .await;
    eventually("Y subscribed to X", move || async move {
        has_peer(yb, xa, LinkPhase::Subscribed).await
    })
    .await;

    air.rebroadcast(&x.address).await;
    sleep(SETTLE).await;

    // X advertises without a name and never links to itself
    let peers = x.bridge.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address, y.address);
}

#[tokio::test]
async fn test_stop_clears_tables() {
    let air = VirtualAir::new();
    let (x, y) = linked_pair(&air).await;

    x.bridge.stop().await.unwrap();
    assert_eq!(x.bridge.state(), BridgeState::Stopped);
    assert!(x.bridge.peers().await.is_empty());
    assert_eq!(x.bridge.subscriber_count().await, 0);
    assert!(x.bridge.identity().await.is_none());

    air.rebroadcast(&y.address).await;
    sleep(SETTLE).await;
    assert!(x.bridge.peers().await.is_empty());

    // Y's notification stream from X ended with the withdrawn service
    let yb = &y.bridge;
    eventually("Y dropped X", move || async move { yb.peers().await.is_empty() }).await;
}

#[tokio::test]
async fn test_late_callbacks_after_stop_are_discarded() {
    let air = VirtualAir::new();
    let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;
    let y = node(&air, "AA:00:00:00:00:02", StationOptions::default()).await;
    air.set_fault(&y.address, Fault::DelayConnect(Duration::from_millis(200)))
        .await;

    y.bridge.start("team1", "Y").await.unwrap();
    x.bridge.start("team1", "X").await.unwrap();

    let (xb, ya) = (&x.bridge, &y.address);
    eventually("X discovered Y", move || async move {
        has_peer(xb, ya, LinkPhase::Discovered).await
    })
    .await;

    x.bridge.stop().await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert!(x.bridge.peers().await.is_empty());
    assert!(!air.subscribers(&y.address).await.contains(&x.address));
}

#[tokio::test]
async fn test_failed_link_releases_entry_for_retry() {
    let faults = [
        Fault::RejectConnect,
        Fault::HideService,
        Fault::HideCharacteristic,
        Fault::RejectSubscribe,
    ];

    for fault in faults {
        let air = VirtualAir::new();
        let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;
        let y = node(&air, "AA:00:00:00:00:02", StationOptions::default()).await;
        air.set_fault(&y.address, fault).await;

        y.bridge.start("team1", "Y").await.unwrap();
        x.bridge.start("team1", "X").await.unwrap();
        sleep(SETTLE).await;
        assert!(
            x.bridge.peers().await.iter().all(|p| p.address != y.address),
            "entry retained after {:?}",
            fault
        );

        air.clear_faults(&y.address).await;
        air.rebroadcast(&y.address).await;

        let (xb, ya) = (&x.bridge, &y.address);
        eventually("retry after fault", move || async move {
            has_peer(xb, ya, LinkPhase::Subscribed).await
        })
        .await;
    }
}

#[tokio::test]
async fn test_zero_length_send_is_noop() {
    let air = VirtualAir::new();
    let (x, _y) = linked_pair(&air).await;

    x.bridge.send(&[]).await.unwrap();
    assert_eq!(air.notify_calls(&x.address).await, 0);

    x.bridge.send(b"data").await.unwrap();
    assert_eq!(air.notify_calls(&x.address).await, 1);
}

#[tokio::test]
async fn test_send_before_start_is_noop() {
    let air = VirtualAir::new();
    let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;

    x.bridge.send(b"early").await.unwrap();
    assert!(x.bridge.write_to_peers(b"early").await.delivered.is_empty());
    assert_eq!(air.notify_calls(&x.address).await, 0);
}

#[tokio::test]
async fn test_write_to_peers_reaches_remote_sink() {
    let air = VirtualAir::new();
    let (mut x, y) = linked_pair(&air).await;

    let report = y.bridge.write_to_peers(b"hello").await;
    assert!(report.is_complete());
    assert_eq!(report.delivered, vec![x.address.clone()]);

    let message = recv(&mut x).await;
    assert_eq!(message.peer_id, LOCAL_PEER_ID);
    assert_eq!(message.payload, b"hello");
    assert_eq!(message.via, Role::Peripheral);
}

#[tokio::test]
async fn test_central_only_host_still_receives() {
    let air = VirtualAir::new();
    let mut x = node(&air, "AA:00:00:00:00:01", StationOptions::central_only()).await;
    let y = node(&air, "AA:00:00:00:00:02", StationOptions::default()).await;

    assert_eq!(
        x.bridge.start("team1", "X").await.unwrap(),
        BridgeMode::CentralOnly
    );
    assert_eq!(
        x.bridge.state(),
        BridgeState::Running(BridgeMode::CentralOnly)
    );
    y.bridge.start("team1", "Y").await.unwrap();

    let yb = &y.bridge;
    eventually("X subscribed to Y", move || async move {
        yb.subscriber_count().await == 1
    })
    .await;

    y.bridge.send(b"hi").await.unwrap();
    assert_eq!(recv(&mut x).await.payload, b"hi");

    // Nothing to notify from a central-only host
    x.bridge.send(b"back").await.unwrap();
    assert_eq!(air.notify_calls(&x.address).await, 0);
    assert!(!air.is_advertising(&x.address).await);
}

#[tokio::test]
async fn test_central_failure_fails_start() {
    let air = VirtualAir::new();
    let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;
    air.power_off(&x.address).await;

    let err = x.bridge.start("team1", "X").await.unwrap_err();
    assert_eq!(err, BridgeError::CentralStart(RadioError::AdapterUnavailable));
    assert_eq!(x.bridge.state(), BridgeState::Stopped);
    assert!(!x.bridge.is_running());
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let air = VirtualAir::new();
    let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;
    let mut states = x.bridge.subscribe_state();

    x.bridge.stop().await.unwrap();
    assert_eq!(x.bridge.state(), BridgeState::Stopped);

    assert_eq!(
        x.bridge.start("team1", "X").await.unwrap(),
        BridgeMode::DualRole
    );
    assert!(states.has_changed().unwrap());
    assert_eq!(
        *states.borrow_and_update(),
        BridgeState::Running(BridgeMode::DualRole)
    );

    // A second start keeps the first session
    x.bridge.start("team2", "Other").await.unwrap();
    let identity = x.bridge.identity().await.unwrap();
    assert_eq!(identity, rendezvous_core::Identity::derive("team1"));

    x.bridge.stop().await.unwrap();
    x.bridge.stop().await.unwrap();
    assert_eq!(*states.borrow_and_update(), BridgeState::Stopped);
    assert!(!air.is_scanning(&x.address).await);
}

#[tokio::test]
async fn test_lost_peer_is_removed() {
    let air = VirtualAir::new();
    let (x, y) = linked_pair(&air).await;

    air.power_off(&y.address).await;

    let (xb, ya) = (&x.bridge, &y.address);
    eventually("X dropped Y", move || async move {
        xb.peers().await.iter().all(|p| &p.address != ya)
    })
    .await;
    eventually("X registry dropped Y", move || async move {
        xb.subscriber_count().await == 0
    })
    .await;
}

#[tokio::test]
async fn test_timed_out_link_is_released_for_retry() {
    let air = VirtualAir::new();
    let x = node(&air, "AA:00:00:00:00:01", StationOptions::default()).await;
    let y = node(&air, "AA:00:00:00:00:02", StationOptions::default()).await;
    // Longer than the 500ms link timeout of every node
    air.set_fault(&y.address, Fault::DelayConnect(Duration::from_millis(1500)))
        .await;

    y.bridge.start("team1", "Y").await.unwrap();
    x.bridge.start("team1", "X").await.unwrap();

    let (xb, ya) = (&x.bridge, &y.address);
    eventually("X discovered Y", move || async move {
        has_peer(xb, ya, LinkPhase::Discovered).await
    })
    .await;
    eventually("X released Y after the connect timeout", move || async move {
        xb.peers().await.iter().all(|p| &p.address != ya)
    })
    .await;
    assert!(!air.subscribers(&y.address).await.contains(&x.address));

    air.clear_faults(&y.address).await;
    air.rebroadcast(&y.address).await;

    eventually("retry after timeout", move || async move {
        has_peer(xb, ya, LinkPhase::Subscribed).await
    })
    .await;
}

#[tokio::test]
async fn test_stalled_write_does_not_block_stop() {
    let air = VirtualAir::new();
    let (x, y) = linked_pair(&air).await;
    air.set_fault(&x.address, Fault::StallWrites).await;

    let (report, stopped) = tokio::join!(y.bridge.write_to_peers(b"hi"), async {
        sleep(Duration::from_millis(50)).await;
        timeout(Duration::from_millis(250), y.bridge.stop()).await
    });

    assert!(matches!(stopped, Ok(Ok(()))), "stop waited on the write");
    assert_eq!(y.bridge.state(), BridgeState::Stopped);
    assert!(report.delivered.is_empty());
    assert_eq!(
        report.failed,
        vec![(
            x.address.clone(),
            RadioError::TimedOut(Duration::from_millis(500))
        )]
    );
}

#[tokio::test]
async fn test_send_survives_departed_subscriber() {
    let air = VirtualAir::new();
    let (x, mut y) = linked_pair(&air).await;
    let z = node(&air, "AA:00:00:00:00:03", StationOptions::default()).await;
    z.bridge.start("team1", "Z").await.unwrap();

    let xb = &x.bridge;
    eventually("Z subscribed to X", move || async move {
        xb.subscriber_count().await == 2
    })
    .await;

    z.bridge.stop().await.unwrap();
    drop(z);

    // Whether or not Z's departure was seen yet, Y is still reached
    x.bridge.send(b"still here").await.unwrap();
    assert_eq!(recv(&mut y).await.payload, b"still here");

    eventually("X pruned Z", move || async move {
        xb.subscriber_count().await == 1
    })
    .await;
    x.bridge.send(b"again").await.unwrap();
    assert_eq!(recv(&mut y).await.payload, b"again");
}
