//! Transmit queue and waiter list for one endpoint.
//!
//! All fields are guarded by the endpoint's tx lock. The queue is FIFO;
//! the write pump takes the head as the in-flight message and releases
//! the slot once the write completes.

use std::collections::VecDeque;
use std::time::Duration;

use junction_core::Message;

use super::Role;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Queued,
    /// No room; the caller must wait its turn.
    Full,
    /// Control allowance exhausted. The endpoint must be stopped.
    Overflow,
}

#[derive(Debug)]
pub struct TxQueue {
    role: Role,
    queue: VecDeque<Message>,
    /// `Some(is_control)` while the write pump holds a message.
    in_flight: Option<bool>,
    num_control: usize,
    max_control: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    closed: bool,
}

impl TxQueue {
    pub fn new(role: Role, max_control: usize) -> Self {
        Self {
            role,
            queue: VecDeque::new(),
            in_flight: None,
            num_control: 0,
            max_control,
            waiters: VecDeque::new(),
            next_ticket: 0,
            closed: false,
        }
    }

    pub fn set_max_control(&mut self, max_control: usize) {
        self.max_control = max_control;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Nothing queued and nothing being written.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Daemon-side control messages skip the waiter list entirely.
    pub fn bypasses_waiters(&self, msg: &Message) -> bool {
        self.role == Role::Router && msg.is_control()
    }

    /// Try to place `msg` at the tail.
    pub fn admit(&mut self, msg: &Message) -> Admit {
        if self.bypasses_waiters(msg) {
            if self.num_control >= self.max_control {
                return Admit::Overflow;
            }
            self.num_control += 1;
            self.queue.push_back(msg.clone());
            return Admit::Queued;
        }
        if !self.has_room() {
            return Admit::Full;
        }
        self.queue.push_back(msg.clone());
        Admit::Queued
    }

    /// Depth 1 for data, counting the message being written.
    fn has_room(&self) -> bool {
        let depth = match self.role {
            Role::Router => {
                let queued_data = self.queue.len() - self.num_control;
                queued_data + usize::from(self.in_flight == Some(false))
            }
            Role::Leaf => self.queue.len() + usize::from(self.in_flight.is_some()),
        };
        depth < 1
    }

    /// Hand the head to the write pump.
    pub fn take_head(&mut self) -> Option<Message> {
        let msg = self.queue.pop_front()?;
        let control = self.bypasses_waiters(&msg);
        if control {
            self.num_control -= 1;
        }
        self.in_flight = Some(control);
        Some(msg)
    }

    /// The in-flight write finished or was abandoned.
    pub fn finish_write(&mut self) {
        self.in_flight = None;
    }

    /// Drop queued messages whose TTL ran out. Returns how many.
    pub fn purge_expired(&mut self) -> usize {
        let before = self.queue.len();
        let role = self.role;
        let mut purged_control = 0;
        self.queue.retain(|m| {
            if m.is_expired() {
                if role == Role::Router && m.is_control() {
                    purged_control += 1;
                }
                false
            } else {
                true
            }
        });
        self.num_control -= purged_control;
        before - self.queue.len()
    }

    /// Time until the soonest queued message expires.
    pub fn nearest_expiry(&self) -> Option<Duration> {
        self.queue.iter().filter_map(Message::expires_in).min()
    }

    // ── Waiters ──────────────────────────────────────────────────────────────

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn enqueue_waiter(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.push_back(ticket);
        ticket
    }

    pub fn is_head_waiter(&self, ticket: u64) -> bool {
        self.waiters.front() == Some(&ticket)
    }

    /// Remove `ticket`. Returns true when it was the head.
    pub fn remove_waiter(&mut self, ticket: u64) -> bool {
        match self.waiters.iter().position(|t| *t == ticket) {
            Some(pos) => {
                self.waiters.remove(pos);
                pos == 0
            }
            None => false,
        }
    }
}
