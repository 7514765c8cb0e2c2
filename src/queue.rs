//! The userspace queue contract and an in-memory driver.
//!
//! The kernel side delivers diverted packets as a FIFO; every dequeued
//! packet owes the kernel exactly one verdict. Drivers are synchronous and
//! live on blocking worker threads.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;

/// Decision returned to the kernel for one dequeued packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Let the original packet continue.
    Accept,
    /// Discard the original packet.
    Drop,
    /// Let the packet continue with replacement bytes.
    Mangle(Vec<u8>),
}

/// One diverted packet awaiting a verdict. The id is driver-local.
#[derive(Clone, Debug)]
pub struct QueuedPacket {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Contract the per-test runtime drives; one driver per bound queue number.
pub trait QueueDriver: Send {
    /// Wait up to `timeout` for the next packet; `None` on timeout.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<QueuedPacket>>;

    /// Deliver the verdict for a previously dequeued packet.
    fn verdict(&mut self, id: u32, verdict: Verdict) -> Result<()>;
}

/// Channel-fed driver used by tests and local experiments. Verdicts are
/// recorded instead of reaching any kernel.
pub struct ChannelDriver {
    rx: Receiver<Vec<u8>>,
    next_id: u32,
    verdicts: Arc<Mutex<Vec<(u32, Verdict)>>>,
}

impl ChannelDriver {
    /// Returns the driver, the feed side, and the verdict log.
    #[allow(clippy::type_complexity)]
    pub fn new() -> (Self, Sender<Vec<u8>>, Arc<Mutex<Vec<(u32, Verdict)>>>) {
        let (tx, rx) = mpsc::channel();
        let verdicts = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                rx,
                next_id: 0,
                verdicts: verdicts.clone(),
            },
            tx,
            verdicts,
        )
    }
}

impl QueueDriver for ChannelDriver {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<QueuedPacket>> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => {
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1);
                Ok(Some(QueuedPacket { id, payload }))
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn verdict(&mut self, id: u32, verdict: Verdict) -> Result<()> {
        self.verdicts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, verdict));
        Ok(())
    }
}
