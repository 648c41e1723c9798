//! Name ownership and advertisement discovery.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use junction_core::session::{transport, AdvertiseReply, FindReply};
use junction_core::MessageType;
use junction_router::name_table::{request_flags, RequestNameReply};
use junction_router::NameService;

use crate::{daemon, eventually, Client};

const SVC: &str = "org.example.Svc";

#[tokio::test]
async fn ownership_passes_down_the_queue() {
    let router = daemon();
    let mut a = Client::connect(&router).await.unwrap();
    let mut b = Client::connect(&router).await.unwrap();

    let reply = a.dbus_call("RequestName", vec![json!(SVC), json!(0)]).await.unwrap();
    assert_eq!(reply.u64_arg(0).unwrap(), RequestNameReply::PrimaryOwner as u64);

    let changed = b
        .expect(|m| m.member() == "NameOwnerChanged" && m.str_arg(0).ok() == Some(SVC))
        .await
        .unwrap();
    assert_eq!(changed.str_arg(1).unwrap(), "");
    assert_eq!(changed.str_arg(2).unwrap(), a.name);

    let queued = b.dbus_call("RequestName", vec![json!(SVC), json!(0)]).await.unwrap();
    assert_eq!(queued.u64_arg(0).unwrap(), RequestNameReply::InQueue as u64);
    let refused = b
        .dbus_call("RequestName", vec![json!(SVC), json!(request_flags::DO_NOT_QUEUE)])
        .await
        .unwrap();
    assert_eq!(refused.u64_arg(0).unwrap(), RequestNameReply::Exists as u64);

    let owner = b.dbus_call("GetNameOwner", vec![json!(SVC)]).await.unwrap();
    assert_eq!(owner.str_arg(0).unwrap(), a.name);

    // The DO_NOT_QUEUE request dropped b from the queue.
    b.dbus_call("RequestName", vec![json!(SVC), json!(0)]).await.unwrap();
    let a_name = a.name.clone();
    a.disconnect().await.unwrap();

    let handed = b
        .expect(|m| {
            m.member() == "NameOwnerChanged" && m.str_arg(0).ok() == Some(SVC) && m.str_arg(1).ok() == Some(a_name.as_str())
        })
        .await
        .unwrap();
    assert_eq!(handed.str_arg(2).unwrap(), b.name);
}

#[tokio::test]
async fn unowned_name_lookup_is_an_error() {
    let router = daemon();
    let mut a = Client::connect(&router).await.unwrap();
    let reply = a.dbus_call("GetNameOwner", vec![json!("org.example.Nobody")]).await.unwrap();
    assert_eq!(reply.msg_type(), MessageType::Error);

    let own = a.name.clone();
    let has = a.dbus_call("NameHasOwner", vec![json!(own)]).await.unwrap();
    assert_eq!(has.arg(0).and_then(|v| v.as_bool()), Some(true));
}

/// Name service that records what the controller asked of it.
#[derive(Default)]
struct RecordingService {
    calls: Mutex<Vec<String>>,
}

impl NameService for RecordingService {
    fn transports(&self) -> transport::TransportMask {
        transport::TCP
    }

    fn enable_advertisement(&self, name: &str) {
        self.calls.lock().push(format!("+adv {name}"));
    }

    fn disable_advertisement(&self, name: &str) {
        self.calls.lock().push(format!("-adv {name}"));
    }

    fn enable_discovery(&self, prefix: &str) {
        self.calls.lock().push(format!("+find {prefix}"));
    }

    fn disable_discovery(&self, prefix: &str) {
        self.calls.lock().push(format!("-find {prefix}"));
    }
}

#[tokio::test]
async fn advertising_reaches_the_transport_once() {
    let router = daemon();
    let ns = Arc::new(RecordingService::default());
    router.bus().register_name_service(ns.clone());
    let mut a = Client::connect(&router).await.unwrap();
    let mut b = Client::connect(&router).await.unwrap();

    let ok = a.bus_call("AdvertiseName", vec![json!(SVC), json!(transport::TCP)]).await.unwrap();
    assert_eq!(ok.u64_arg(0).unwrap(), AdvertiseReply::Success.code() as u64);
    let again = b.bus_call("AdvertiseName", vec![json!(SVC), json!(transport::TCP)]).await.unwrap();
    assert_eq!(again.u64_arg(0).unwrap(), AdvertiseReply::Success.code() as u64);
    let bt = a
        .bus_call("AdvertiseName", vec![json!("org.example.Bt"), json!(transport::BLUETOOTH)])
        .await
        .unwrap();
    assert_eq!(bt.u64_arg(0).unwrap(), AdvertiseReply::TransportNotAvailable.code() as u64);

    assert_eq!(*ns.calls.lock(), vec![format!("+adv {SVC}")]);

    a.bus_call("CancelAdvertiseName", vec![json!(SVC)]).await.unwrap();
    assert_eq!(ns.calls.lock().len(), 1, "b still advertises");
    b.disconnect().await.unwrap();
    let seen = ns.clone();
    assert!(eventually(|| seen.calls.lock().contains(&format!("-adv {SVC}"))).await);
}

#[tokio::test]
async fn discovery_replays_cache_and_reports_loss() {
    let router = daemon();
    let ns = Arc::new(RecordingService::default());
    router.bus().register_name_service(ns.clone());
    let mut a = Client::connect(&router).await.unwrap();

    let names = vec!["org.example.Chat".to_string()];
    router
        .bus()
        .found_names("tcp:addr=192.0.2.7,port=9955", "0123456789abcdef", transport::TCP, Some(&names), 120);

    let reply = a.bus_call("FindAdvertisedName", vec![json!("org.example")]).await.unwrap();
    assert_eq!(reply.u64_arg(0).unwrap(), FindReply::Success.code() as u64);
    assert!(ns.calls.lock().contains(&"+find org.example".to_string()));

    let found = a.expect_member("FoundAdvertisedName").await.unwrap();
    assert_eq!(found.str_arg(0).unwrap(), "org.example.Chat");
    assert_eq!(found.u64_arg(1).unwrap(), transport::TCP as u64);
    assert_eq!(found.str_arg(2).unwrap(), "org.example");

    router
        .bus()
        .found_names("tcp:addr=192.0.2.7,port=9955", "0123456789abcdef", transport::TCP, None, 0);
    let lost = a.expect_member("LostAdvertisedName").await.unwrap();
    assert_eq!(lost.str_arg(0).unwrap(), "org.example.Chat");
}
