//! Bluetooth topology controller driven through its dispatcher.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;

use junction_core::config::BluetoothConfig;
use junction_core::message::FrameCodec;
use junction_core::session::{transport, FindReply};
use junction_core::{BusError, Header, MessageType};
use junction_router::bt::{
    register_with_bus, BluetoothDeviceInterface, BtBusAddress, BtDispatcher, BtHandle, BtNode, BtRole,
    BusTopologyLink, Delegation, DeviceInfo, NodeAdvert, NodeState, SetStateReply, SetStateRequest, TopologyLink,
    TopologyRole, TopologySignal, TopologySnapshot,
};
use junction_router::ifaces::{BT_CONTROLLER_IFACE, BT_CONTROLLER_PATH};
use junction_router::{DaemonRouter, EndpointOptions, EndpointRouter, NameService, RemoteEndpoint};

use crate::{daemon, Client, WAIT};

const PSM: u16 = 0x1003;

fn addr(n: u64) -> BtBusAddress {
    BtBusAddress::new(n, PSM)
}

fn me() -> BtBusAddress {
    addr(0x10)
}

/// Radio that always works and logs what it was told.
#[derive(Default)]
struct Radio {
    log: Mutex<Vec<String>>,
}

impl Radio {
    fn saw(&self, entry: &str) -> bool {
        self.log.lock().iter().any(|e| e == entry)
    }

    fn note(&self, entry: String) {
        self.log.lock().push(entry);
    }
}

#[async_trait]
impl BluetoothDeviceInterface for Radio {
    async fn start_find(&self, ignore_addrs: &[u64], _duration: Duration) -> Result<(), BusError> {
        self.note(format!("find {ignore_addrs:x?}"));
        Ok(())
    }

    async fn stop_find(&self) -> Result<(), BusError> {
        self.note("stop find".into());
        Ok(())
    }

    async fn start_advertise(
        &self,
        _uuid_rev: u32,
        _addr: BtBusAddress,
        ad_info: &[NodeAdvert],
        _duration: Duration,
    ) -> Result<(), BusError> {
        let names: Vec<&str> = ad_info.iter().flat_map(|a| a.names.iter().map(String::as_str)).collect();
        self.note(format!("advertise {names:?}"));
        Ok(())
    }

    async fn stop_advertise(&self) -> Result<(), BusError> {
        self.note("stop advertise".into());
        Ok(())
    }

    fn found_names_change(&self, _guid: &str, names: &[String], _addr: BtBusAddress, lost: bool) {
        self.note(format!("{} {names:?}", if lost { "lost" } else { "found" }));
    }

    async fn start_listen(&self) -> Result<BtBusAddress, BusError> {
        self.note("listen".into());
        Ok(me())
    }

    async fn stop_listen(&self) {
        self.note("stop listen".into());
    }

    async fn get_device_info(&self, _addr: u64) -> Result<DeviceInfo, BusError> {
        Err(BusError::DeviceUnavailable)
    }

    async fn disconnect(&self, unique_name: &str) -> Result<(), BusError> {
        self.note(format!("disconnect {unique_name}"));
        Ok(())
    }

    fn lookup_endpoint(&self, _unique_name: &str) -> Option<RemoteEndpoint> {
        let router: Weak<dyn EndpointRouter> = Weak::<DaemonRouter>::new();
        let opts = EndpointOptions {
            bus_to_bus: true,
            ..EndpointOptions::default()
        };
        Some(RemoteEndpoint::new(router, Arc::new(FrameCodec::default()), opts))
    }

    fn return_endpoint(&self, _ep: RemoteEndpoint) {}

    async fn is_master(&self, _addr: u64) -> Result<bool, BusError> {
        Ok(true)
    }

    async fn request_bt_role(&self, _addr: u64, _role: BtRole) {}

    fn is_eir_capable(&self) -> bool {
        false
    }
}

/// Peer link that records signals and never gets a `SetState` answer.
#[derive(Default)]
struct Link {
    signals: Mutex<Vec<(BtBusAddress, TopologySignal)>>,
}

#[async_trait]
impl TopologyLink for Link {
    async fn set_state(&self, _to: &BtNode, _req: SetStateRequest) -> Result<SetStateReply, BusError> {
        Err(BusError::Timeout)
    }

    async fn signal(&self, to: &BtNode, sig: TopologySignal) -> Result<(), BusError> {
        self.signals.lock().push((to.addr, sig));
        Ok(())
    }
}

struct Harness {
    radio: Arc<Radio>,
    link: Arc<Link>,
    handle: BtHandle,
    shutdown: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn start() -> Harness {
    let radio = Arc::new(Radio::default());
    let link = Arc::new(Link::default());
    let (shutdown, rx) = broadcast::channel(1);
    let mut local = BtNode::new(me(), ":me.1");
    local.guid = "me".into();
    let (dispatcher, handle) = BtDispatcher::new(BluetoothConfig::default(), local, radio.clone(), link.clone(), rx);
    let task = tokio::spawn(dispatcher.run());
    Harness {
        radio,
        link,
        handle,
        shutdown,
        task,
    }
}

/// Snapshot once `cond` holds, or the last one seen.
async fn settle(handle: &BtHandle, cond: impl Fn(&TopologySnapshot) -> bool) -> TopologySnapshot {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snap = handle.snapshot().await.expect("dispatcher running");
        if cond(&snap) || tokio::time::Instant::now() >= deadline {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn join_request(n: u64, unique_name: &str) -> SetStateRequest {
    SetStateRequest {
        direct_minions: 0,
        eir_capable: false,
        uuid_rev: 500,
        addr: addr(n),
        node_states: vec![NodeState {
            guid: format!("g{n:x}"),
            unique_name: unique_name.to_string(),
            addr: addr(n),
            advertise_names: vec![],
            find_names: vec![],
            eir_capable: false,
        }],
        found_nodes: vec![],
    }
}

#[tokio::test]
async fn lone_node_is_master_and_finds_locally() {
    let h = start();
    h.handle.device_available(true);
    h.handle.enable_discovery("org.example");

    let snap = settle(&h.handle, |s| s.find.active).await;
    assert_eq!(snap.role, TopologyRole::Master);
    assert_eq!(snap.find, Delegation { minion: me(), active: true });
    assert!(snap.listening);
    assert!(h.radio.saw("listen"));
    assert!(h.radio.saw("find [10]"));
}

#[tokio::test]
async fn find_follows_a_minion_and_returns_when_it_leaves() {
    let h = start();
    h.handle.device_available(true);
    h.handle.enable_discovery("org.example");
    settle(&h.handle, |s| s.find.active).await;

    let reply = h.handle.set_state(":n20.1", 0, join_request(0x20, ":n20.1")).await.unwrap();
    assert!(reply.node_states.is_empty(), "we stay master");

    let snap = settle(&h.handle, |s| s.find.minion == addr(0x20)).await;
    assert_eq!(snap.role, TopologyRole::Master);
    assert_eq!(snap.num_minions, 1);
    assert_eq!(snap.find, Delegation { minion: addr(0x20), active: true });
    assert!(h.radio.saw("stop find"));
    assert!(h
        .link
        .signals
        .lock()
        .iter()
        .any(|(to, sig)| *to == addr(0x20) && matches!(sig, TopologySignal::DelegateFind(Some(_)))));

    h.handle.lost_last_connection(addr(0x20));
    let snap = settle(&h.handle, |s| s.find.minion == me()).await;
    assert_eq!(snap.nodes, vec![me()]);
    assert_eq!(snap.num_minions, 0);
    assert_eq!(snap.find, Delegation { minion: me(), active: true });
}

#[tokio::test]
async fn shutdown_quiets_the_radio_and_ends_the_dispatcher() {
    let h = start();
    h.handle.device_available(true);
    h.handle.enable_advertisement("org.example.Svc");
    settle(&h.handle, |s| s.advertise.active).await;
    assert!(h.radio.saw("advertise [\"org.example.Svc\"]"));

    h.shutdown.send(()).unwrap();
    tokio::time::timeout(WAIT, h.task)
        .await
        .expect("dispatcher stops")
        .unwrap()
        .unwrap();
    assert!(h.radio.saw("stop advertise"));
    assert!(h.handle.snapshot().await.is_none());
    assert_eq!(
        h.handle.set_state(":n20.1", 0, join_request(0x20, ":n20.1")).await,
        Err(BusError::Stopping)
    );
}

#[tokio::test]
async fn peer_controllers_talk_through_the_bus() {
    let router = daemon();
    let controller = router.core().controller_name().to_string();
    let radio = Arc::new(Radio::default());
    let link = Arc::new(BusTopologyLink::new(router.bus(), WAIT));
    let (_shutdown, rx) = broadcast::channel(1);
    let mut local = BtNode::new(me(), &controller);
    local.guid = router.core().guid().to_string();
    let (dispatcher, handle) = BtDispatcher::new(BluetoothConfig::default(), local, radio.clone(), link, rx);
    tokio::spawn(dispatcher.run());
    register_with_bus(router.bus(), &handle);
    handle.device_available(true);

    // The "peer" plays the far controller of a freshly connected node.
    let mut peer = Client::connect(&router).await.unwrap();
    let req = serde_json::to_value(join_request(0x20, &peer.name)).unwrap();
    let serial = peer
        .send(
            Header::method_call(&controller, BT_CONTROLLER_PATH, BT_CONTROLLER_IFACE, "SetState"),
            vec![req],
        )
        .await
        .unwrap();
    let reply = peer.reply_to(serial).await.unwrap();
    assert_eq!(reply.msg_type(), MessageType::MethodReturn);
    let state: SetStateReply = reply.typed_arg(0).unwrap();
    assert!(state.node_states.is_empty(), "we stay master");
    assert_eq!(state.addr, me());

    // Bluetooth is now a discovery transport; the search goes to the minion.
    let mut app = Client::connect(&router).await.unwrap();
    let found = app
        .bus_call(
            "FindAdvertisedNameByTransport",
            vec![json!("org.example"), json!(transport::BLUETOOTH)],
        )
        .await
        .unwrap();
    assert_eq!(found.u64_arg(0).unwrap(), FindReply::Success.code() as u64);

    let delegated = peer.expect_member("DelegateFind").await.unwrap();
    let sig: TopologySignal = delegated.typed_arg(0).unwrap();
    assert!(matches!(sig, TopologySignal::DelegateFind(Some(ref args)) if args.ignore_addrs.contains(&0x20)));
    let snap = settle(&handle, |s| s.find.minion == addr(0x20)).await;
    assert_eq!(snap.num_minions, 1);
}
