//! Session binding, joining and leaving through the bus controller.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use junction_core::session::{BindReply, JoinReply, LeaveReply, SessionId, SessionOpts, SessionPort};
use junction_core::MessageType;

use crate::{daemon, Client};

const PORT: u64 = 42;

async fn bind(host: &mut Client, opts: SessionOpts) -> Result<u64> {
    let reply = host.bus_call("BindSessionPort", vec![json!(PORT), json!(opts)]).await?;
    Ok(reply.u64_arg(0)?)
}

/// Join `host` on `PORT`, returning the reply code and session id.
async fn join(joiner: &mut Client, host: &str, opts: SessionOpts) -> Result<(u64, SessionId)> {
    let reply = joiner
        .bus_call("JoinSession", vec![json!(host), json!(PORT), json!(opts)])
        .await?;
    Ok((reply.u64_arg(0)?, reply.u64_arg(1)? as SessionId))
}

#[tokio::test]
async fn point_to_point_join_and_traffic() {
    let router = daemon();
    let mut host = Client::connect(&router).await.unwrap();
    let mut joiner = Client::connect(&router).await.unwrap();

    assert_eq!(bind(&mut host, SessionOpts::default()).await.unwrap(), BindReply::Success.code() as u64);
    let (code, id) = join(&mut joiner, &host.name, SessionOpts::default()).await.unwrap();
    assert_eq!(code, JoinReply::Success.code() as u64);
    assert_ne!(id, 0);

    let joined = host.expect_member("SessionJoined").await.unwrap();
    assert_eq!(joined.u64_arg(0).unwrap(), PORT);
    assert_eq!(joined.u64_arg(1).unwrap(), id as u64);
    assert_eq!(joined.str_arg(2).unwrap(), joiner.name);

    host.signal_to(&joiner.name, "Data", id, vec![json!("payload")]).await.unwrap();
    let data = joiner.expect_member("Data").await.unwrap();
    assert_eq!(data.session_id(), id);
    assert_eq!(data.str_arg(0).unwrap(), "payload");
}

#[tokio::test]
async fn second_bind_of_a_port_is_refused() {
    let router = daemon();
    let mut host = Client::connect(&router).await.unwrap();
    bind(&mut host, SessionOpts::default()).await.unwrap();
    assert_eq!(
        bind(&mut host, SessionOpts::default()).await.unwrap(),
        BindReply::AlreadyExists.code() as u64
    );
}

#[tokio::test]
async fn join_without_binding_finds_no_session() {
    let router = daemon();
    let host = Client::connect(&router).await.unwrap();
    let mut joiner = Client::connect(&router).await.unwrap();
    let (code, id) = join(&mut joiner, &host.name, SessionOpts::default()).await.unwrap();
    assert_eq!(code, JoinReply::NoSession.code() as u64);
    assert_eq!(id, 0);
}

#[tokio::test]
async fn rejected_join_leaves_no_trace() {
    let router = daemon();
    let mut host = Client::connect_with(&router, false, 64 * 1024).await.unwrap();
    let mut joiner = Client::connect(&router).await.unwrap();

    bind(&mut host, SessionOpts::default()).await.unwrap();
    let (code, _) = join(&mut joiner, &host.name, SessionOpts::default()).await.unwrap();
    assert_eq!(code, JoinReply::Rejected.code() as u64);
    assert!(
        host.stays_quiet(Duration::from_millis(100), |m| m.member() == "SessionJoined")
            .await
    );
}

#[tokio::test]
async fn multipoint_members_learn_about_each_other() {
    let router = daemon();
    let mut host = Client::connect(&router).await.unwrap();
    let mut j1 = Client::connect(&router).await.unwrap();
    let mut j2 = Client::connect(&router).await.unwrap();

    bind(&mut host, SessionOpts::multipoint()).await.unwrap();
    let (code1, id1) = join(&mut j1, &host.name, SessionOpts::multipoint()).await.unwrap();
    let (code2, id2) = join(&mut j2, &host.name, SessionOpts::multipoint()).await.unwrap();
    assert_eq!(code1, JoinReply::Success.code() as u64);
    assert_eq!(code2, JoinReply::Success.code() as u64);
    assert_eq!(id1, id2, "multipoint joins share one session");

    let j2_name = j2.name.clone();
    let added = j1
        .expect(|m| m.member() == "MPSessionChanged" && m.str_arg(1).ok() == Some(j2_name.as_str()))
        .await
        .unwrap();
    assert_eq!(added.arg(2).and_then(|v| v.as_bool()), Some(true));

    let j1_name = j1.name.clone();
    j2.expect(|m| m.member() == "MPSessionChanged" && m.str_arg(1).ok() == Some(j1_name.as_str()))
        .await
        .unwrap();

    // Session broadcast: every other participant, never the sender.
    j1.signal_to("", "Chat", id1, vec![json!("hello")]).await.unwrap();
    host.expect_member("Chat").await.unwrap();
    j2.expect_member("Chat").await.unwrap();
    assert!(j1.stays_quiet(Duration::from_millis(100), |m| m.member() == "Chat").await);
}

#[tokio::test]
async fn leaving_tells_the_host() {
    let router = daemon();
    let mut host = Client::connect(&router).await.unwrap();
    let mut joiner = Client::connect(&router).await.unwrap();
    bind(&mut host, SessionOpts::default()).await.unwrap();
    let (_, id) = join(&mut joiner, &host.name, SessionOpts::default()).await.unwrap();

    let reply = joiner.bus_call("LeaveSession", vec![json!(id)]).await.unwrap();
    assert_eq!(reply.msg_type(), MessageType::MethodReturn);
    assert_eq!(reply.u64_arg(0).unwrap(), LeaveReply::Success.code() as u64);

    let lost = host.expect_member("SessionLost").await.unwrap();
    assert_eq!(lost.u64_arg(0).unwrap(), id as u64);

    let again = joiner.bus_call("LeaveSession", vec![json!(id)]).await.unwrap();
    assert_eq!(again.u64_arg(0).unwrap(), LeaveReply::NoSession.code() as u64);
}

#[tokio::test]
async fn disconnecting_joiner_ends_the_session() {
    let router = daemon();
    let mut host = Client::connect(&router).await.unwrap();
    let mut joiner = Client::connect(&router).await.unwrap();
    bind(&mut host, SessionOpts::default()).await.unwrap();
    let (_, id) = join(&mut joiner, &host.name, SessionOpts::default()).await.unwrap();
    host.expect_member("SessionJoined").await.unwrap();

    joiner.disconnect().await.unwrap();
    let lost = host.expect_member("SessionLost").await.unwrap();
    assert_eq!(lost.u64_arg(0).unwrap(), id as u64);
}

#[tokio::test]
async fn simultaneous_multipoint_joins_share_one_session() {
    let router = daemon();
    let mut host = Client::connect(&router).await.unwrap();
    let mut j1 = Client::connect(&router).await.unwrap();
    let mut j2 = Client::connect(&router).await.unwrap();
    let host_name = host.name.clone();

    bind(&mut host, SessionOpts::multipoint()).await.unwrap();
    let (r1, r2) = tokio::join!(
        join(&mut j1, &host_name, SessionOpts::multipoint()),
        join(&mut j2, &host_name, SessionOpts::multipoint()),
    );
    let (code1, id1) = r1.unwrap();
    let (code2, id2) = r2.unwrap();
    assert_eq!(code1, JoinReply::Success.code() as u64);
    assert_eq!(code2, JoinReply::Success.code() as u64);
    assert_eq!(id1, id2);

    let mut joined = Vec::new();
    for _ in 0..2 {
        let msg = host.expect_member("SessionJoined").await.unwrap();
        assert_eq!(msg.u64_arg(1).unwrap(), id1 as u64);
        joined.push(msg.str_arg(2).unwrap().to_string());
    }
    joined.sort();
    let mut expected = vec![j1.name.clone(), j2.name.clone()];
    expected.sort();
    assert_eq!(joined, expected);
    assert!(
        host.stays_quiet(Duration::from_millis(100), |m| m.member() == "SessionJoined")
            .await
    );
}

#[tokio::test]
async fn joiner_gone_by_acceptance_is_refused() {
    let router = daemon();
    let mut host = Client::connect(&router).await.unwrap();
    bind(&mut host, SessionOpts::default()).await.unwrap();

    // A name the daemon handed out whose connection no longer exists.
    let gone = router.core().new_unique_name();
    let outcome = router
        .bus()
        .join_session(&gone, &host.name, PORT as SessionPort, SessionOpts::default())
        .await;
    assert_eq!(outcome.reply, JoinReply::Failed);
    assert_eq!(outcome.id, 0);
    assert!(
        host.stays_quiet(Duration::from_millis(100), |m| m.member() == "SessionJoined")
            .await
    );

    // The binding is untouched and a live joiner still gets in.
    let mut joiner = Client::connect(&router).await.unwrap();
    let (code, id) = join(&mut joiner, &host.name, SessionOpts::default()).await.unwrap();
    assert_eq!(code, JoinReply::Success.code() as u64);
    let joined = host.expect_member("SessionJoined").await.unwrap();
    assert_eq!(joined.u64_arg(1).unwrap(), id as u64);
    assert_eq!(joined.str_arg(2).unwrap(), joiner.name);
}
