use std::collections::BTreeMap;
use std::ops::AddAssign;
use tracing::{debug, warn};

use crate::error::Result;
use crate::state::Uid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub downloaded: usize,
    /// Requested but missing from the server's response.
    pub skipped: usize,
    /// Returned by the server but could not be decoded or written.
    pub failed: usize,
}

impl AddAssign for BatchStats {
    fn add_assign(&mut self, other: Self) {
        self.downloaded += other.downloaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Pages through a download list, checkpointing after every page.
///
/// A page is the unit of recovery: if the run stops half way through a page,
/// the whole page is fetched again next time, so handlers must tolerate
/// seeing a message twice.
#[derive(Debug)]
pub struct BatchFetcher {
    page_size: usize,
    stats: BatchStats,
}

impl BatchFetcher {
    pub fn new(page_size: usize) -> Self {
        BatchFetcher {
            page_size: page_size.max(1),
            stats: BatchStats::default(),
        }
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    /// Runs `fetch`, then `handle` for each returned message, then
    /// `checkpoint`, for every page in order. A failing `handle` only costs
    /// that message; a failing `fetch` or `checkpoint` stops the run and is
    /// returned, leaving earlier checkpoints in place.
    pub fn run<F, H, C>(
        &mut self,
        to_download: &[Uid],
        mut fetch: F,
        mut handle: H,
        mut checkpoint: C,
    ) -> Result<()>
    where
        F: FnMut(&[Uid]) -> Result<BTreeMap<Uid, Vec<u8>>>,
        H: FnMut(Uid, &[u8]) -> Result<()>,
        C: FnMut(&[Uid]) -> Result<()>,
    {
        for batch in to_download.chunks(self.page_size) {
            debug!(
                first = batch[0],
                last = batch[batch.len() - 1],
                count = batch.len(),
                "fetching batch"
            );
            let mut bodies = fetch(batch)?;
            for &uid in batch {
                match bodies.remove(&uid) {
                    Some(body) => match handle(uid, &body) {
                        Ok(()) => self.stats.downloaded += 1,
                        Err(err) => {
                            warn!(uid, error = %err, "message skipped");
                            self.stats.failed += 1;
                        }
                    },
                    None => {
                        warn!(uid, "message missing from fetch response");
                        self.stats.skipped += 1;
                    }
                }
            }
            if !bodies.is_empty() {
                debug!(count = bodies.len(), "ignoring unrequested messages");
            }
            checkpoint(batch)?;
        }
        Ok(())
    }
}
