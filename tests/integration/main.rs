//! Junction integration test harness.
//!
//! Each test runs a daemon router in-process. Clients reach it over
//! in-memory pipes carrying the same length-prefixed frames a TCP
//! connection would, so the endpoint pumps, the router and the bus
//! controller all run for real.
//!
//!   cargo test --test integration

mod endpoint;
mod names;
mod sessions;
mod topology;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

use junction_core::config::RouterConfig;
use junction_core::message::FrameCodec;
use junction_core::{Guid128, Header, Message, MessageType, WireCodec};
use junction_router::ifaces::{BUS_IFACE, BUS_NAME, BUS_PATH, DBUS_IFACE, DBUS_NAME, DBUS_PATH, DBUS_PEER_IFACE};
use junction_router::{DaemonRouter, EndpointOptions, EndpointRouter, EndpointTimeouts, RemoteEndpoint};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(2);

pub fn daemon() -> Arc<DaemonRouter> {
    DaemonRouter::new(Guid128::generate(), RouterConfig::default())
}

/// Poll `cond` until it holds or `WAIT` runs out.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Attach a daemon-side endpoint and hand back the application's end of
/// the pipe untouched. Nothing reads it unless the test does.
pub async fn attach_raw(router: &Arc<DaemonRouter>, pipe: usize) -> Result<(RemoteEndpoint, DuplexStream)> {
    let name = router.core().new_unique_name();
    let weak: Weak<dyn EndpointRouter> = Arc::downgrade(router) as Weak<dyn EndpointRouter>;
    let opts = EndpointOptions {
        allow_remote: true,
        local_sender: router.core().controller_name().to_string(),
        ..EndpointOptions::default()
    };
    let ep = RemoteEndpoint::new(weak, Arc::new(FrameCodec::default()), opts);
    ep.set_unique_name(name)?;

    let (daemon_side, client_side) = tokio::io::duplex(pipe);
    ep.start(daemon_side, EndpointTimeouts::default())?;
    tokio::time::timeout(WAIT, ep.started())
        .await
        .context("endpoint never started")?;
    Ok((ep, client_side))
}

type Writer = Arc<Mutex<WriteHalf<DuplexStream>>>;

/// An application attached to the daemon through a pipe.
///
/// A background task answers `AcceptSession` and keep-alive pings; every
/// other inbound message lands in the inbox.
pub struct Client {
    pub name: String,
    pub ep: RemoteEndpoint,
    writer: Writer,
    serial: Arc<AtomicU32>,
    inbox: mpsc::UnboundedReceiver<Message>,
    held: VecDeque<Message>,
}

impl Client {
    pub async fn connect(router: &Arc<DaemonRouter>) -> Result<Self> {
        Self::connect_with(router, true, 64 * 1024).await
    }

    /// `accept` is the answer given to every `AcceptSession`; `pipe` is the
    /// in-memory buffer size between the endpoint and the client.
    pub async fn connect_with(router: &Arc<DaemonRouter>, accept: bool, pipe: usize) -> Result<Self> {
        let (ep, client_side) = attach_raw(router, pipe).await?;
        let name = ep.unique_name().to_string();

        let (rd, wr) = tokio::io::split(client_side);
        let writer: Writer = Arc::new(Mutex::new(wr));
        let serial = Arc::new(AtomicU32::new(0));
        let (tx, inbox) = mpsc::unbounded_channel();
        tokio::spawn(client_pump(rd, writer.clone(), serial.clone(), name.clone(), accept, tx));

        Ok(Self {
            name,
            ep,
            writer,
            serial,
            inbox,
            held: VecDeque::new(),
        })
    }

    /// Send `header` with `args`, stamped with our name and the next serial.
    pub async fn send(&self, header: Header, args: Vec<Value>) -> Result<u32> {
        send_stamped(&self.writer, &self.serial, &self.name, header, args).await
    }

    /// Signal addressed to `dest` on a test interface.
    pub async fn signal_to(&self, dest: &str, member: &str, session: u32, args: Vec<Value>) -> Result<u32> {
        let header = Header::signal(dest, "/org/example/Test", "org.example.Test", member).session(session);
        self.send(header, args).await
    }

    /// Method call to the bus controller, waiting for its reply.
    pub async fn bus_call(&mut self, member: &str, args: Vec<Value>) -> Result<Message> {
        let serial = self
            .send(Header::method_call(BUS_NAME, BUS_PATH, BUS_IFACE, member), args)
            .await?;
        self.reply_to(serial).await
    }

    /// Method call on the DBus interface, waiting for its reply.
    pub async fn dbus_call(&mut self, member: &str, args: Vec<Value>) -> Result<Message> {
        let serial = self
            .send(Header::method_call(DBUS_NAME, DBUS_PATH, DBUS_IFACE, member), args)
            .await?;
        self.reply_to(serial).await
    }

    pub async fn reply_to(&mut self, serial: u32) -> Result<Message> {
        self.expect(|m| {
            matches!(m.msg_type(), MessageType::MethodReturn | MessageType::Error) && m.reply_serial() == serial
        })
        .await
    }

    /// Next message with `member`, keeping anything else for later.
    pub async fn expect_member(&mut self, member: &str) -> Result<Message> {
        let member = member.to_string();
        self.expect(move |m| m.member() == member).await
    }

    pub async fn expect(&mut self, pred: impl Fn(&Message) -> bool) -> Result<Message> {
        if let Some(pos) = self.held.iter().position(&pred) {
            if let Some(msg) = self.held.remove(pos) {
                return Ok(msg);
            }
        }
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => bail!("{} lost its connection", self.name),
                Err(_) => bail!("{} timed out; holding {:?}", self.name, self.held_members()),
            };
            if pred(&msg) {
                return Ok(msg);
            }
            self.held.push_back(msg);
        }
    }

    /// True when nothing matching `pred` arrives within `quiet`.
    pub async fn stays_quiet(&mut self, quiet: Duration, pred: impl Fn(&Message) -> bool) -> bool {
        if self.held.iter().any(&pred) {
            return false;
        }
        let deadline = tokio::time::Instant::now() + quiet;
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, self.inbox.recv()).await {
            if pred(&msg) {
                return false;
            }
            self.held.push_back(msg);
        }
        true
    }

    fn held_members(&self) -> Vec<String> {
        self.held.iter().map(|m| m.member().to_string()).collect()
    }

    /// Close our half of the pipe, as an application exiting would.
    pub async fn disconnect(self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

async fn send_stamped(writer: &Writer, serial: &AtomicU32, name: &str, header: Header, args: Vec<Value>) -> Result<u32> {
    let mut wr = writer.lock().await;
    // Allocated under the lock so serials hit the wire in order.
    let serial = serial.fetch_add(1, Ordering::Relaxed) + 1;
    let msg = Message::new(header.sender(name).serial(serial), args);
    let mut buf = BytesMut::new();
    FrameCodec::default().encode(&msg, &mut buf)?;
    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(serial)
}

pub async fn read_frame(rd: &mut ReadHalf<DuplexStream>) -> Result<Message> {
    let len = rd.read_u32().await?;
    let mut buf = BytesMut::with_capacity(4 + len as usize);
    buf.put_u32(len);
    buf.resize(4 + len as usize, 0);
    rd.read_exact(&mut buf[4..]).await?;
    FrameCodec::default()
        .decode(&mut buf)?
        .context("incomplete frame")
}

async fn client_pump(
    mut rd: ReadHalf<DuplexStream>,
    writer: Writer,
    serial: Arc<AtomicU32>,
    name: String,
    accept: bool,
    tx: mpsc::UnboundedSender<Message>,
) {
    while let Ok(msg) = read_frame(&mut rd).await {
        if msg.msg_type() == MessageType::MethodCall {
            let answer = match (msg.interface(), msg.member()) {
                (_, "AcceptSession") => Some(vec![json!(accept)]),
                (DBUS_PEER_IFACE, "Ping") => Some(vec![]),
                _ => None,
            };
            if let Some(args) = answer {
                let header = Header::reply_to(&msg);
                if send_stamped(&writer, &serial, &name, header, args).await.is_err() {
                    break;
                }
                continue;
            }
        }
        if tx.send(msg).is_err() {
            break;
        }
    }
}
