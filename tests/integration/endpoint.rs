//! Endpoint behaviour seen from connected applications.

use std::time::Duration;

use serde_json::json;

use junction_core::BusError;

use crate::{attach_raw, daemon, eventually, Client, WAIT};

#[tokio::test]
async fn messages_arrive_in_send_order() {
    let router = daemon();
    let a = Client::connect(&router).await.unwrap();
    let mut b = Client::connect(&router).await.unwrap();

    for i in 0..100u32 {
        a.signal_to(&b.name, "Tick", 0, vec![json!(i)]).await.unwrap();
    }
    for i in 0..100u64 {
        let msg = b.expect_member("Tick").await.unwrap();
        assert_eq!(msg.u64_arg(0).unwrap(), i);
        assert_eq!(msg.sender(), a.name);
    }
}

#[tokio::test]
async fn payloads_cross_a_narrow_pipe_intact() {
    let router = daemon();
    let a = Client::connect(&router).await.unwrap();
    // Smaller than the largest frame, so writes land in pieces.
    let mut b = Client::connect_with(&router, true, 1024).await.unwrap();

    for size in [10usize, 4096, 1] {
        let payload = "x".repeat(size);
        a.signal_to(&b.name, "Blob", 0, vec![json!(payload)]).await.unwrap();
        let msg = b.expect_member("Blob").await.unwrap();
        assert_eq!(msg.str_arg(0).unwrap().len(), size);
    }
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let router = daemon();
    let mut a = Client::connect(&router).await.unwrap();
    let mut b = Client::connect(&router).await.unwrap();
    let mut c = Client::connect(&router).await.unwrap();

    a.signal_to("", "Announce", 0, vec![json!("hi")]).await.unwrap();
    b.expect_member("Announce").await.unwrap();
    c.expect_member("Announce").await.unwrap();
    assert!(a.stays_quiet(Duration::from_millis(100), |m| m.member() == "Announce").await);
}

#[tokio::test]
async fn unroutable_messages_do_not_drop_the_connection() {
    let router = daemon();
    let a = Client::connect(&router).await.unwrap();
    let mut b = Client::connect(&router).await.unwrap();

    a.signal_to(":deadbeef.9", "Lost", 0, vec![]).await.unwrap();
    a.signal_to(&b.name, "StillHere", 0, vec![]).await.unwrap();
    b.expect_member("StillHere").await.unwrap();
    assert!(a.ep.is_accepting());
}

#[tokio::test]
async fn closed_client_is_unregistered() {
    let router = daemon();
    let a = Client::connect(&router).await.unwrap();
    let name = a.name.clone();
    let ep = a.ep.clone();
    assert!(router.core().endpoint(&name).is_some());

    a.disconnect().await.unwrap();
    ep.join(WAIT).await;

    assert!(ep.lifecycle().is_terminal());
    assert_eq!(ep.disconnect_status(), Some(BusError::OtherEndClosed));
    let core = router.core().clone();
    assert!(eventually(|| core.endpoint(&name).is_none()).await);
}

#[tokio::test]
async fn local_stop_is_idempotent_and_join_bounded() {
    let router = daemon();
    let a = Client::connect(&router).await.unwrap();
    let ep = a.ep.clone();

    ep.stop();
    ep.stop();
    tokio::time::timeout(WAIT * 2, ep.join(Duration::from_millis(200)))
        .await
        .expect("join must be bounded");
    assert!(ep.lifecycle().is_terminal());

    // Further stops and joins are no-ops.
    ep.stop();
    ep.join(Duration::from_millis(10)).await;
    let core = router.core().clone();
    let name = a.name.clone();
    assert!(eventually(|| core.endpoint(&name).is_none()).await);
}

#[tokio::test]
async fn join_is_bounded_while_the_destination_is_backed_up() {
    let router = daemon();
    let a = Client::connect(&router).await.unwrap();
    // Nothing reads b's pipe, so its queue fills and stays full.
    let (b, _unread) = attach_raw(&router, 64).await.unwrap();

    for i in 0..20u32 {
        a.signal_to(b.unique_name(), "Flood", 0, vec![json!(i)]).await.unwrap();
    }
    let backed_up = b.clone();
    assert!(eventually(|| !backed_up.tx_is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(WAIT, a.ep.join(Duration::from_millis(50)))
        .await
        .expect("join must escalate to an abort");
    assert!(a.ep.lifecycle().is_terminal());
    b.abort();
}
