//! Per-operation delegation state for find and advertise.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::dispatch::DispatchInfo;
use super::node::BtBusAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameOp {
    Find,
    Advertise,
}

impl NameOp {
    pub fn other(self) -> Self {
        match self {
            NameOp::Find => NameOp::Advertise,
            NameOp::Advertise => NameOp::Find,
        }
    }
}

impl fmt::Display for NameOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NameOp::Find => "find",
            NameOp::Advertise => "advertise",
        })
    }
}

/// Who performs an operation and whether it is running.
#[derive(Debug)]
pub struct NameArgInfo {
    pub op: NameOp,
    /// Node doing the work: ourselves or one minion.
    pub minion: BtBusAddress,
    pub active: bool,
    /// Name list changed since the device or delegate was last told.
    pub dirty: bool,
    generation: u64,
    alarm: Option<JoinHandle<()>>,
}

impl NameArgInfo {
    pub fn new(op: NameOp, self_addr: BtBusAddress) -> Self {
        Self {
            op,
            minion: self_addr,
            active: false,
            dirty: false,
            generation: 0,
            alarm: None,
        }
    }

    /// Read and clear the dirty flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Arm the rotation alarm. A previous alarm is cancelled.
    pub fn arm(&mut self, after: Duration, tx: &mpsc::UnboundedSender<DispatchInfo>) {
        self.disarm();
        let op = self.op;
        let generation = self.generation;
        let tx = tx.clone();
        self.alarm = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(DispatchInfo::RotateDelegate { op, generation });
        }));
    }

    pub fn disarm(&mut self) {
        self.generation += 1;
        if let Some(alarm) = self.alarm.take() {
            alarm.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.alarm.is_some()
    }

    /// An alarm that fired after being cancelled or re-armed is stale.
    pub fn is_current(&self, generation: u64) -> bool {
        self.alarm.is_some() && self.generation == generation
    }

    /// Forget the delegate: the work falls back to us on the next update.
    pub fn reset(&mut self, self_addr: BtBusAddress) {
        self.disarm();
        self.active = false;
        self.minion = self_addr;
        self.dirty = true;
    }
}

impl Drop for NameArgInfo {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rotation_alarm_fires_once_and_goes_stale_on_rearm() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let me = BtBusAddress::new(1, 1);
        let mut info = NameArgInfo::new(NameOp::Find, me);

        info.arm(Duration::from_millis(5), &tx);
        let first = match rx.recv().await {
            Some(DispatchInfo::RotateDelegate { generation, .. }) => generation,
            other => panic!("unexpected dispatch: {other:?}"),
        };
        assert!(info.is_current(first));

        info.arm(Duration::from_millis(5), &tx);
        assert!(!info.is_current(first));

        info.reset(me);
        assert!(!info.active);
        assert!(info.dirty);
        assert!(!info.is_armed());
        assert!(info.take_changed());
        assert!(!info.take_changed());
    }
}
