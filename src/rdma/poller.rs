use std::collections::{HashSet, VecDeque};
use std::hint;
use std::time::Duration;

use quanta::Instant;

use super::provider::CompletionQueue;
use super::type_alias::WrId;
use super::wc::Wc;
use crate::error::{Error, Result, TransferCause};

/// How many completions are taken from the queue per poll call.
const POLL_BATCH: usize = 16;

/// Busy-polls a completion queue shared by both directions.
///
/// Completions are matched by work request ID. Anything polled while waiting
/// for a different ID is kept, in arrival order, for a later wait.
pub(crate) struct Poller {
    cq: Box<dyn CompletionQueue>,
    backlog: VecDeque<Wc>,
    abandoned: HashSet<WrId>,
    timeout: Option<Duration>,
    batch: Vec<Wc>,
}

impl Poller {
    pub fn new(cq: Box<dyn CompletionQueue>, timeout: Option<Duration>) -> Self {
        let batch = vec![Wc::default(); POLL_BATCH.min(cq.capacity().max(1) as usize)];
        Self {
            cq,
            backlog: VecDeque::new(),
            abandoned: HashSet::new(),
            timeout,
            batch,
        }
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[inline]
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Stop waiting for `wr_id`; its completion is discarded when it shows up.
    pub fn abandon(&mut self, wr_id: WrId) {
        if let Some(pos) = self.backlog.iter().position(|wc| wc.wr_id == wr_id) {
            self.backlog.remove(pos);
        } else {
            self.abandoned.insert(wr_id);
        }
    }

    /// Busy-poll until the completion of `wr_id` arrives or the timeout passes.
    ///
    /// It is the caller's responsibility to check the status of the returned
    /// work completion entry.
    pub fn wait(&mut self, op: &'static str, wr_id: WrId) -> Result<Wc> {
        if let Some(pos) = self.backlog.iter().position(|wc| wc.wr_id == wr_id) {
            if let Some(wc) = self.backlog.remove(pos) {
                return Ok(wc);
            }
        }

        let start = Instant::now();
        #[cfg(feature = "warned_spin")]
        let mut warn_at = Duration::from_secs(1);

        loop {
            let n = self
                .cq
                .poll(&mut self.batch)
                .map_err(|e| Error::transfer(op, TransferCause::Poll(e)))?;

            let mut found = None;
            for wc in &self.batch[..n] {
                log::trace!("polled {:?}", wc);
                if self.abandoned.remove(&wc.wr_id) {
                    if wc.ok().is_err() {
                        log::warn!("abandoned work request failed: {:?}", wc);
                    } else {
                        log::debug!("dropping completion of abandoned work request {:#x}", wc.wr_id);
                    }
                    continue;
                }
                if found.is_none() && wc.wr_id == wr_id {
                    found = Some(*wc);
                } else {
                    self.backlog.push_back(*wc);
                }
            }
            if let Some(wc) = found {
                return Ok(wc);
            }

            let waited = start.elapsed();
            if self.timeout.is_some_and(|t| waited >= t) {
                return Err(Error::Timeout { op, waited });
            }

            #[cfg(feature = "warned_spin")]
            if waited >= warn_at {
                log::warn!("{}: still waiting for work request {:#x} after {:?}", op, wr_id, waited);
                warn_at *= 2;
            }
            if n == 0 {
                hint::spin_loop();
            }
        }
    }
}
