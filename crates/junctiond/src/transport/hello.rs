//! Establish step for new connections.
//!
//! The first frame decides what the connection is: a `Hello` from a client
//! application or a `BusHello` from another daemon. Frames are read with
//! exact-length reads so nothing past the hello is consumed before the
//! endpoint's own read pump takes over.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use junction_core::message::{FrameCodec, MAX_FRAME_LEN};
use junction_core::session::PROTOCOL_VERSION;
use junction_core::{BusError, Guid128, Header, Message, MessageType, WireCodec};
use junction_router::endpoint::BusStream;
use junction_router::ifaces::{errors, BUS_IFACE, BUS_NAME, BUS_PATH, DBUS_IFACE};
use junction_router::{DaemonRouter, EndpointOptions, EndpointRouter, EndpointTimeouts, RemoteEndpoint, Role};

pub const HELLO: &str = "Hello";
pub const BUS_HELLO: &str = "BusHello";

/// What the first frame announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hello {
    Client { allow_remote: bool },
    Bus { guid: Guid128, protocol_version: u32 },
}

impl Hello {
    pub fn parse(msg: &Message) -> Result<Self, BusError> {
        if msg.msg_type() != MessageType::MethodCall {
            return Err(BusError::NotAllowed("connection must open with a hello".into()));
        }
        match (msg.interface(), msg.member()) {
            (DBUS_IFACE, HELLO) => Ok(Hello::Client {
                allow_remote: msg.arg(0).and_then(|v| v.as_bool()).unwrap_or(false),
            }),
            (BUS_IFACE, BUS_HELLO) => {
                let guid = msg.str_arg(0)?.parse().map_err(BusError::Malformed)?;
                let protocol_version = u32::try_from(msg.u64_arg(1)?)
                    .map_err(|_| BusError::Malformed("protocol version out of range".into()))?;
                Ok(Hello::Bus { guid, protocol_version })
            }
            (iface, member) => Err(BusError::NotAllowed(format!("{iface}.{member} before hello"))),
        }
    }
}

pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, codec: &FrameCodec) -> Result<Message, BusError> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(BusError::Malformed(format!("frame length {len} exceeds {MAX_FRAME_LEN}")));
    }
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    buf.resize(4 + len, 0);
    stream.read_exact(&mut buf[4..]).await?;
    codec
        .decode(&mut buf)?
        .ok_or_else(|| BusError::Malformed("incomplete frame".into()))
}

pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, codec: &FrameCodec, msg: &Message) -> Result<(), BusError> {
    let mut buf = BytesMut::new();
    codec.encode(msg, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

fn router_weak(router: &Arc<DaemonRouter>) -> Weak<dyn EndpointRouter> {
    Arc::downgrade(router) as Weak<dyn EndpointRouter>
}

fn b2b_options(router: &DaemonRouter, guid: Guid128, protocol_version: u32) -> EndpointOptions {
    EndpointOptions {
        role: Role::Router,
        bus_to_bus: true,
        allow_remote: true,
        protocol_version,
        remote_name: format!("{}1", guid.unique_prefix()),
        remote_guid: Some(guid),
        local_sender: router.core().controller_name().to_string(),
        ..EndpointOptions::default()
    }
}

/// Answer the hello on an accepted connection and start its endpoint.
pub async fn accept<S: BusStream>(
    mut stream: S,
    router: &Arc<DaemonRouter>,
    timeouts: EndpointTimeouts,
    hello_timeout: Duration,
) -> Result<RemoteEndpoint> {
    let codec = FrameCodec::default();
    let hello = tokio::time::timeout(hello_timeout, read_frame(&mut stream, &codec))
        .await
        .context("no hello before timeout")??;
    let core = router.core();

    let kind = match Hello::parse(&hello) {
        Ok(kind) => kind,
        Err(e) => {
            let refusal = Message::new(
                Header::error_to(&hello, errors::FAILED)
                    .sender(core.controller_name())
                    .serial(core.next_serial()),
                vec![json!(e.to_string())],
            );
            let _ = write_frame(&mut stream, &codec, &refusal).await;
            bail!(e);
        }
    };

    let unique_name = core.new_unique_name();
    let (opts, args) = match &kind {
        Hello::Client { allow_remote } => (
            EndpointOptions {
                role: Role::Router,
                allow_remote: *allow_remote,
                local_sender: core.controller_name().to_string(),
                ..EndpointOptions::default()
            },
            vec![json!(unique_name), json!(core.guid().to_string())],
        ),
        Hello::Bus { guid, protocol_version } => {
            if *guid == core.guid() {
                bail!("peer daemon has our own guid {guid}");
            }
            (
                b2b_options(router, *guid, (*protocol_version).min(PROTOCOL_VERSION)),
                vec![json!(unique_name), json!(core.guid().to_string()), json!(PROTOCOL_VERSION)],
            )
        }
    };

    let reply = Message::new(
        Header::reply_to(&hello)
            .sender(core.controller_name())
            .serial(core.next_serial()),
        args,
    );
    write_frame(&mut stream, &codec, &reply).await.context("hello reply")?;

    let ep = RemoteEndpoint::new(router_weak(router), Arc::new(codec), opts);
    ep.set_unique_name(unique_name)?;
    ep.start(stream, timeouts)?;
    tracing::info!(endpoint = %ep.unique_name(), hello = ?kind, "connection established");
    Ok(ep)
}

/// Say `BusHello` on an outbound connection and start the bus-to-bus
/// endpoint.
pub async fn connect<S: BusStream>(
    mut stream: S,
    router: &Arc<DaemonRouter>,
    timeouts: EndpointTimeouts,
    hello_timeout: Duration,
) -> Result<RemoteEndpoint> {
    let codec = FrameCodec::default();
    let core = router.core();
    let hello = Message::new(
        Header::method_call(BUS_NAME, BUS_PATH, BUS_IFACE, BUS_HELLO)
            .sender(core.controller_name())
            .serial(core.next_serial()),
        vec![json!(core.guid().to_string()), json!(PROTOCOL_VERSION)],
    );
    write_frame(&mut stream, &codec, &hello).await.context("send BusHello")?;

    let reply = tokio::time::timeout(hello_timeout, read_frame(&mut stream, &codec))
        .await
        .context("no BusHello reply before timeout")??;
    if reply.msg_type() != MessageType::MethodReturn {
        bail!("BusHello refused: {} {:?}", reply.error_name(), reply.arg(0));
    }
    let guid: Guid128 = reply.str_arg(1)?.parse().map_err(BusError::Malformed)?;
    let protocol_version = u32::try_from(reply.u64_arg(2)?).unwrap_or(PROTOCOL_VERSION);

    let ep = RemoteEndpoint::new(
        router_weak(router),
        Arc::new(codec),
        b2b_options(router, guid, protocol_version.min(PROTOCOL_VERSION)),
    );
    ep.set_unique_name(core.new_unique_name())?;
    ep.start(stream, timeouts)?;
    tracing::info!(endpoint = %ep.unique_name(), remote = %guid, "bus-to-bus link established");
    Ok(ep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use junction_core::config::RouterConfig;
    use junction_router::ifaces::{DBUS_NAME, DBUS_PATH};

    #[test]
    fn hello_kinds() {
        let client = Message::new(Header::method_call(DBUS_NAME, DBUS_PATH, DBUS_IFACE, HELLO), vec![json!(true)]);
        assert_eq!(Hello::parse(&client), Ok(Hello::Client { allow_remote: true }));

        let guid = Guid128::generate();
        let bus = Message::new(
            Header::method_call(BUS_NAME, BUS_PATH, BUS_IFACE, BUS_HELLO),
            vec![json!(guid.to_string()), json!(11)],
        );
        assert_eq!(
            Hello::parse(&bus),
            Ok(Hello::Bus {
                guid,
                protocol_version: 11
            })
        );

        let other = Message::new(Header::method_call(BUS_NAME, BUS_PATH, BUS_IFACE, "JoinSession"), vec![]);
        assert!(matches!(Hello::parse(&other), Err(BusError::NotAllowed(_))));
    }

    #[tokio::test]
    async fn frames_are_read_exactly() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let first = Message::new(Header::method_call(DBUS_NAME, DBUS_PATH, DBUS_IFACE, HELLO), vec![]);
        let second = Message::new(Header::method_call(DBUS_NAME, DBUS_PATH, DBUS_IFACE, "Ping"), vec![]);
        write_frame(&mut a, &codec, &first).await.unwrap();
        write_frame(&mut a, &codec, &second).await.unwrap();

        assert_eq!(read_frame(&mut b, &codec).await.unwrap().member(), HELLO);
        assert_eq!(read_frame(&mut b, &codec).await.unwrap().member(), "Ping");
    }

    #[tokio::test]
    async fn client_hello_assigns_a_unique_name() {
        let router = DaemonRouter::new(Guid128::generate(), RouterConfig::default());
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let accepting = {
            let router = router.clone();
            tokio::spawn(async move {
                accept(server, &router, EndpointTimeouts::default(), Duration::from_secs(1)).await
            })
        };

        let codec = FrameCodec::default();
        let hello = Message::new(Header::method_call(DBUS_NAME, DBUS_PATH, DBUS_IFACE, HELLO), vec![]);
        write_frame(&mut client, &codec, &hello).await.unwrap();
        let reply = read_frame(&mut client, &codec).await.unwrap();
        assert_eq!(reply.msg_type(), MessageType::MethodReturn);

        let ep = accepting.await.unwrap().unwrap();
        assert_eq!(reply.str_arg(0).unwrap(), ep.unique_name());
        assert!(router.core().is_local_name(ep.unique_name()));
        assert!(!ep.is_bus_to_bus());

        ep.stop();
        ep.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let router = DaemonRouter::new(Guid128::generate(), RouterConfig::default());
        let (_client, server) = tokio::io::duplex(1024);
        let result = accept(server, &router, EndpointTimeouts::default(), Duration::from_millis(20)).await;
        assert!(result.is_err());
    }
}
