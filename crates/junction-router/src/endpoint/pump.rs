//! Read and write pumps.
//!
//! Both run inside the endpoint's task and return when the stream is done
//! or the endpoint is aborted. Neither reports an error upward: fatal
//! conditions are recorded as the disconnect status before returning.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;

use junction_core::{BusError, Header, Message, MessageType};

use super::state::StreamState;
use super::{EndpointTimeouts, RemoteEndpoint, Role};
use crate::ifaces::{DAEMON_IFACE, DAEMON_PATH, DBUS_NAME, DBUS_PEER_IFACE, PROBE_ACK, PROBE_REQ};

const READ_CHUNK: usize = 8 * 1024;

/// Resolves once the endpoint's abort flag is raised.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|a| *a).await;
}

enum Next {
    Write(Message),
    Drained,
    Idle,
}

pub(super) async fn write_pump<W: AsyncWrite + Unpin>(ep: &RemoteEndpoint, mut writer: W, timeouts: &EndpointTimeouts) {
    let inner = &ep.0;
    let mut abort = ep.abort_rx();
    let mut buf = BytesMut::new();

    loop {
        if *abort.borrow() {
            inner.tx.lock().finish_write();
            return;
        }

        let next = {
            let mut tx = inner.tx.lock();
            match tx.take_head() {
                Some(msg) => Next::Write(msg),
                None if tx.is_closed() => Next::Drained,
                None => Next::Idle,
            }
        };

        let msg = match next {
            Next::Write(msg) => msg,
            Next::Idle => {
                tokio::select! {
                    _ = inner.tx_ready.notified() => {}
                    _ = aborted(&mut abort) => {}
                }
                continue;
            }
            Next::Drained => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(endpoint = %ep.unique_name(), error = %e, "shutdown of write half failed");
                }
                return;
            }
        };

        buf.clear();
        if let Err(e) = inner.codec.encode(&msg, &mut buf) {
            tracing::warn!(endpoint = %ep.unique_name(), error = %e, member = msg.member(), "dropping unencodable message");
            inner.tx.lock().finish_write();
            inner.tx_space.notify_waiters();
            continue;
        }

        let result = tokio::select! {
            r = write_frame(&mut writer, &buf, timeouts) => r,
            _ = aborted(&mut abort) => {
                inner.tx.lock().finish_write();
                return;
            }
        };

        inner.tx.lock().finish_write();
        inner.tx_space.notify_waiters();

        if let Err(e) = result {
            ep.abort_with(e);
            return;
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8], timeouts: &EndpointTimeouts) -> Result<(), BusError> {
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    if timeouts.send.is_zero() {
        return Ok(write.await?);
    }
    match tokio::time::timeout(timeouts.send, write).await {
        Ok(r) => Ok(r?),
        Err(_) => Err(BusError::Timeout),
    }
}

/// Per-sender serial window. A serial must move forward, modulo wrap.
#[derive(Debug, Default)]
pub(super) struct SerialTracker {
    last: HashMap<String, u32>,
}

impl SerialTracker {
    pub(super) fn accept(&mut self, sender: &str, serial: u32) -> bool {
        if serial == 0 {
            return false;
        }
        match self.last.get_mut(sender) {
            Some(last) => {
                if (serial.wrapping_sub(*last) as i32) <= 0 {
                    return false;
                }
                *last = serial;
                true
            }
            None => {
                self.last.insert(sender.to_string(), serial);
                true
            }
        }
    }
}

enum IdleAction {
    Probe,
    GiveUp,
}

struct IdleProbe {
    probes: u32,
    max_probes: u32,
    /// Serial of the outstanding keep-alive `Ping`, 0 when none.
    ping_serial: u32,
}

impl IdleProbe {
    fn fire(&mut self) -> IdleAction {
        if self.probes >= self.max_probes {
            return IdleAction::GiveUp;
        }
        self.probes += 1;
        IdleAction::Probe
    }
}

struct ReadContext {
    serials: SerialTracker,
    idle: IdleProbe,
    session_msg_seen: bool,
}

impl ReadContext {
    fn new(max_idle_probes: u32) -> Self {
        Self {
            serials: SerialTracker::default(),
            idle: IdleProbe {
                probes: 0,
                max_probes: max_idle_probes,
                ping_serial: 0,
            },
            session_msg_seen: false,
        }
    }
}

pub(super) async fn read_pump<R: AsyncRead + Unpin>(ep: &RemoteEndpoint, mut reader: R, timeouts: &EndpointTimeouts) {
    let mut abort = ep.abort_rx();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut ctx = ReadContext::new(timeouts.max_idle_probes);
    let idle_enabled = !timeouts.idle.is_zero();
    let sleep = tokio::time::sleep(timeouts.idle);
    tokio::pin!(sleep);

    loop {
        buf.reserve(READ_CHUNK);
        tokio::select! {
            _ = aborted(&mut abort) => return,

            _ = &mut sleep, if idle_enabled => {
                match ctx.idle.fire() {
                    IdleAction::GiveUp => {
                        ep.abort_with(BusError::Timeout);
                        return;
                    }
                    IdleAction::Probe => {
                        tracing::debug!(endpoint = %ep.unique_name(), probe = ctx.idle.probes, "link idle, probing");
                        send_probe(ep, &mut ctx.idle);
                    }
                }
                sleep.as_mut().reset(Instant::now() + timeouts.probe);
            }

            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        peer_closed(ep);
                        return;
                    }
                    Ok(_) => {
                        ctx.idle.probes = 0;
                        if idle_enabled {
                            sleep.as_mut().reset(Instant::now() + timeouts.idle);
                        }
                    }
                    Err(e) => {
                        ep.abort_with(e.into());
                        return;
                    }
                }

                loop {
                    match ep.0.codec.decode(&mut buf) {
                        Ok(Some(msg)) => {
                            // The router hand-off can park behind a full
                            // destination queue; an abort must still win.
                            let handled = tokio::select! {
                                r = handle_message(ep, msg, &mut ctx, timeouts) => r,
                                _ = aborted(&mut abort) => return,
                            };
                            if let Err(e) = handled {
                                ep.abort_with(e);
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(BusError::SignatureMismatch) => {
                            tracing::debug!(endpoint = %ep.unique_name(), "discarding frame with bad signature");
                        }
                        Err(e) => {
                            ep.abort_with(e);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Peer EOF. Implies a local stop so the write half drains and closes.
fn peer_closed(ep: &RemoteEndpoint) {
    let we_stopped_first = ep.lifecycle().state() == StreamState::StopWait;
    ep.0.lifecycle.send_if_modified(|l| l.peer_eof());
    if !we_stopped_first {
        ep.record_disconnect(BusError::OtherEndClosed);
    }
    tracing::debug!(endpoint = %ep.unique_name(), "peer closed its half");
    ep.stop();
}

fn send_probe(ep: &RemoteEndpoint, idle: &mut IdleProbe) {
    let sender = ep.options().local_sender.as_str();
    let msg = if ep.is_bus_to_bus() {
        Message::new(
            Header::signal("", DAEMON_PATH, DAEMON_IFACE, PROBE_REQ)
                .sender(sender)
                .serial(ep.next_serial()),
            vec![],
        )
    } else {
        let serial = ep.next_serial();
        idle.ping_serial = serial;
        let dest = match ep.role() {
            Role::Router => ep.unique_name().to_string(),
            Role::Leaf => DBUS_NAME.to_string(),
        };
        Message::new(
            Header::method_call(&dest, "/", DBUS_PEER_IFACE, "Ping")
                .sender(sender)
                .serial(serial),
            vec![],
        )
    };
    spawn_push(ep, msg);
}

/// Queue from the read side without stalling it behind the tx queue.
fn spawn_push(ep: &RemoteEndpoint, msg: Message) {
    let ep = ep.clone();
    tokio::spawn(async move {
        if let Err(e) = ep.push_message(msg).await {
            tracing::debug!(endpoint = %ep.unique_name(), error = %e, "keep-alive not sent");
        }
    });
}

async fn handle_message(
    ep: &RemoteEndpoint,
    msg: Message,
    ctx: &mut ReadContext,
    timeouts: &EndpointTimeouts,
) -> Result<(), BusError> {
    if ctx.idle.ping_serial != 0
        && msg.msg_type() == MessageType::MethodReturn
        && msg.reply_serial() == ctx.idle.ping_serial
    {
        ctx.idle.ping_serial = 0;
        return Ok(());
    }

    if ep.is_bus_to_bus() && msg.interface() == DAEMON_IFACE {
        match msg.member() {
            PROBE_REQ => {
                let ack = Message::new(
                    Header::signal("", DAEMON_PATH, DAEMON_IFACE, PROBE_ACK)
                        .sender(&ep.options().local_sender)
                        .serial(ep.next_serial()),
                    vec![],
                );
                spawn_push(ep, ack);
                return Ok(());
            }
            PROBE_ACK => return Ok(()),
            _ => {}
        }
    }

    if msg.is_expired() {
        tracing::debug!(endpoint = %ep.unique_name(), serial = msg.serial(), "discarding expired message");
        return Ok(());
    }

    if !ctx.serials.accept(msg.sender(), msg.serial()) {
        if msg.is_unreliable() || msg.is_broadcast_signal() || msg.is_control() {
            tracing::debug!(
                endpoint = %ep.unique_name(),
                sender = msg.sender(),
                serial = msg.serial(),
                "discarding message with stale serial"
            );
            return Ok(());
        }
        return Err(BusError::InvalidHeaderSerial);
    }

    let router = ep.0.router.upgrade().ok_or(BusError::Stopping)?;
    let in_session = msg.session_id() != 0;
    let mut retries = 0;
    loop {
        match router.push_message(msg.clone(), ep).await {
            Ok(()) => {
                if in_session {
                    ctx.session_msg_seen = true;
                }
                return Ok(());
            }
            Err(BusError::NoRoute)
                if in_session && !ctx.session_msg_seen && retries < timeouts.no_route_retries =>
            {
                retries += 1;
                tokio::time::sleep(timeouts.no_route_retry).await;
            }
            Err(e) => return route_failure(ep, &msg, e),
        }
    }
}

/// Decide whether a routing failure ends the connection.
fn route_failure(ep: &RemoteEndpoint, msg: &Message, err: BusError) -> Result<(), BusError> {
    let discard = matches!(
        err,
        BusError::SignatureMismatch | BusError::UnmatchedReplySerial | BusError::EndpointClosing
    ) || (ep.role() == Role::Router && !ep.is_bus_to_bus());

    if discard {
        tracing::debug!(
            endpoint = %ep.unique_name(),
            destination = msg.destination(),
            member = msg.member(),
            error = %err,
            "discarding unroutable message"
        );
        return Ok(());
    }
    Err(err)
}
