//! NFQUEUE-backed queue driver (Linux).
//!
//! Thin realisation of the [`QueueDriver`] contract over the kernel's
//! netfilter queue. The socket runs non-blocking; `recv_timeout` polls in
//! small slices so the worker can notice its stop flag.

use std::time::{Duration, Instant};

use nfq::{Queue, Verdict as NfVerdict};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::queue::{QueueDriver, QueuedPacket, Verdict};

const POLL_SLICE: Duration = Duration::from_millis(5);

pub struct NfqDriver {
    queue: Queue,
    qnum: u16,
    next_id: u32,
    pending: FxHashMap<u32, nfq::Message>,
}

impl NfqDriver {
    /// Bind a driver to one queue number.
    pub fn open(qnum: u16) -> Result<Self> {
        let mut queue =
            Queue::open().map_err(|err| Error::setup(format!("open nfqueue: {err}")))?;
        queue
            .bind(qnum)
            .map_err(|err| Error::setup(format!("bind nfqueue {qnum}: {err}")))?;
        queue.set_nonblocking(true);
        Ok(Self {
            queue,
            qnum,
            next_id: 0,
            pending: FxHashMap::default(),
        })
    }
}

impl QueueDriver for NfqDriver {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<QueuedPacket>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.queue.recv() {
                Ok(msg) => {
                    let id = self.next_id;
                    self.next_id = self.next_id.wrapping_add(1);
                    let payload = msg.get_payload().to_vec();
                    self.pending.insert(id, msg);
                    return Ok(Some(QueuedPacket { id, payload }));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(POLL_SLICE);
                }
                Err(err) => {
                    return Err(Error::setup(format!("nfqueue {} recv: {err}", self.qnum)));
                }
            }
        }
    }

    fn verdict(&mut self, id: u32, verdict: Verdict) -> Result<()> {
        let mut msg = self
            .pending
            .remove(&id)
            .ok_or_else(|| Error::internal(format!("verdict for unknown packet {id}")))?;
        match verdict {
            Verdict::Accept => msg.set_verdict(NfVerdict::Accept),
            Verdict::Drop => msg.set_verdict(NfVerdict::Drop),
            Verdict::Mangle(bytes) => {
                msg.set_payload(bytes);
                msg.set_verdict(NfVerdict::Accept);
            }
        }
        self.queue
            .verdict(msg)
            .map_err(|err| Error::setup(format!("nfqueue {} verdict: {err}", self.qnum)))
    }
}

impl Drop for NfqDriver {
    fn drop(&mut self) {
        // Anything still pending gets accepted so the kernel backlog clears.
        for (_, mut msg) in self.pending.drain() {
            msg.set_verdict(NfVerdict::Accept);
            let _ = self.queue.verdict(msg);
        }
        let _ = self.queue.unbind(self.qnum);
    }
}
