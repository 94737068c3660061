use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub type Uid = u32;

pub const STATE_DIR: &str = ".meta";
pub const STATE_VERSION: u32 = 1;

const STATE_EXTENSION: &str = "json";
const LEGACY_EXTENSION: &str = "meta";

/// Identifiers in `[low, high)` that were listed by the server but are not
/// archived yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct Segment {
    pub high: u64,
    pub low: u64,
}

impl Segment {
    pub fn new(high: u64, low: u64) -> Self {
        Segment { high, low }
    }

    pub fn contains(&self, uid: Uid) -> bool {
        let uid = u64::from(uid);
        self.low <= uid && uid < self.high
    }

    pub fn is_empty(&self) -> bool {
        self.low >= self.high
    }
}

impl From<(u64, u64)> for Segment {
    fn from((high, low): (u64, u64)) -> Self {
        Segment { high, low }
    }
}

impl From<Segment> for (u64, u64) {
    fn from(segment: Segment) -> Self {
        (segment.high, segment.low)
    }
}

/// Sync progress of one mailbox.
///
/// Everything up to and including `newest` is archived, except the
/// identifiers covered by `segments`. Segments are kept sorted by their low
/// bound, are disjoint, and never reach above `newest`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub uid_validity: Option<u32>,
    pub newest: Option<Uid>,
    pub segments: Vec<Segment>,
}

impl SyncCursor {
    /// Builds a cursor from a plain set of downloaded identifiers. Holes in
    /// the set, including the range below its smallest member, become
    /// pending segments.
    pub fn from_downloaded(downloaded: &BTreeSet<Uid>) -> Self {
        let mut cursor = SyncCursor::default();
        let mut prev: Option<Uid> = None;
        for &uid in downloaded {
            let low = prev.map_or(1, |p| u64::from(p) + 1);
            let segment = Segment::new(u64::from(uid), low);
            if !segment.is_empty() {
                cursor.segments.push(segment);
            }
            prev = Some(uid);
        }
        cursor.newest = prev;
        cursor
    }

    pub fn is_archived(&self, uid: Uid) -> bool {
        match self.newest {
            Some(newest) => uid <= newest && !self.segments.iter().any(|s| s.contains(uid)),
            None => false,
        }
    }

    /// Shrinks the pending segments after `batch` has been archived. Within a
    /// segment identifiers are archived in ascending order, so everything up
    /// to the largest archived one is done.
    pub fn mark_archived(&mut self, batch: &[Uid]) {
        for segment in self.segments.iter_mut() {
            let done = batch.iter().filter(|&&uid| segment.contains(uid)).max();
            if let Some(&uid) = done {
                segment.low = u64::from(uid) + 1;
            }
        }
        self.segments.retain(|s| !s.is_empty());
    }

    /// Drops segments that no longer cover any identifier on the server.
    pub fn retain_listed(&mut self, listed: &[Uid]) {
        self.segments
            .retain(|s| listed.iter().any(|&uid| s.contains(uid)));
    }

    fn check(&self) -> std::result::Result<(), String> {
        let mut last_high = 0;
        for segment in &self.segments {
            if segment.is_empty() {
                return Err(format!("empty segment {:?}", segment));
            }
            if segment.low < last_high {
                return Err(format!("overlapping or unsorted segment {:?}", segment));
            }
            let newest = self.newest.map_or(0, u64::from);
            if segment.high > newest + 1 {
                return Err(format!("segment {:?} above newest {}", segment, newest));
            }
            last_high = segment.high;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub account: String,
    pub mailbox: String,
}

impl StateKey {
    pub fn new(account: impl Into<String>, mailbox: impl Into<String>) -> Self {
        StateKey {
            account: account.into(),
            mailbox: mailbox.into(),
        }
    }

    fn file_stem(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.account.as_bytes());
        hasher.update([0]);
        hasher.update(self.mailbox.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..24].to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    version: u32,
    account: String,
    mailbox: String,
    #[serde(default)]
    uid_validity: Option<u32>,
    newest: Option<Uid>,
    #[serde(default)]
    segments: Vec<Segment>,
}

/// One versioned JSON file per (account, mailbox) under `<root>/.meta`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join(STATE_DIR);
        fs::create_dir_all(&dir).map_err(|e| Error::write(&dir, e))?;
        Ok(StateStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &StateKey) -> PathBuf {
        self.dir
            .join(key.file_stem())
            .with_extension(STATE_EXTENSION)
    }

    /// Reads every record in the state directory. Records that cannot be
    /// understood are logged and left out, so their mailbox is backfilled.
    pub fn load(&self) -> Result<HashMap<StateKey, SyncCursor>> {
        let mut cursors = HashMap::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::read(&self.dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| Error::read(&self.dir, e))?.path();
            if path.extension().map_or(true, |ext| ext != STATE_EXTENSION) {
                continue;
            }
            match self.read_record(&path) {
                Ok((key, cursor)) => {
                    cursors.insert(key, cursor);
                }
                Err(err) => warn!(error = %err, "ignoring sync state"),
            }
        }
        info!(records = cursors.len(), dir = %self.dir.display(), "sync state loaded");
        Ok(cursors)
    }

    fn read_record(&self, path: &Path) -> Result<(StateKey, SyncCursor)> {
        let data = fs::read(path).map_err(|e| Error::corrupt(path, e))?;
        let record: StateRecord =
            serde_json::from_slice(&data).map_err(|e| Error::corrupt(path, e))?;
        if record.version != STATE_VERSION {
            return Err(Error::corrupt(
                path,
                format!("unsupported version {}", record.version),
            ));
        }
        let key = StateKey::new(record.account, record.mailbox);
        if self.path_for(&key) != path {
            return Err(Error::corrupt(path, "file name does not match its key"));
        }
        let cursor = SyncCursor {
            uid_validity: record.uid_validity,
            newest: record.newest,
            segments: record.segments,
        };
        cursor.check().map_err(|reason| Error::corrupt(path, reason))?;
        Ok((key, cursor))
    }

    /// Looks for an old-style `<account>-<mailbox>.meta` file holding a
    /// comma separated set of downloaded identifiers.
    pub fn legacy(&self, key: &StateKey) -> Option<SyncCursor> {
        let path = self.dir.join(format!(
            "{}-{}.{}",
            key.account, key.mailbox, LEGACY_EXTENSION
        ));
        let content = fs::read_to_string(&path).ok()?;
        let downloaded: BTreeSet<Uid> = content
            .split(',')
            .filter_map(|item| item.trim().parse().ok())
            .filter(|&uid| uid > 0)
            .collect();
        debug!(path = %path.display(), count = downloaded.len(), "importing legacy state");
        Some(SyncCursor::from_downloaded(&downloaded))
    }

    /// Atomically replaces the record of `key`.
    pub fn checkpoint(&self, key: &StateKey, cursor: &SyncCursor) -> Result<()> {
        let path = self.path_for(key);
        let record = StateRecord {
            version: STATE_VERSION,
            account: key.account.clone(),
            mailbox: key.mailbox.clone(),
            uid_validity: cursor.uid_validity,
            newest: cursor.newest,
            segments: cursor.segments.clone(),
        };
        let data = serde_json::to_vec_pretty(&record)
            .map_err(|e| Error::write(&path, io::Error::from(e)))?;

        let tmp_path = path.with_extension("json.tmp");
        write_synced(&tmp_path, &data).map_err(|e| Error::write(&tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| Error::write(&path, e))?;
        Ok(())
    }

    /// Checkpoints every cursor, reporting the first failure after trying
    /// all of them.
    pub fn flush_all<'a, I>(&self, cursors: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a StateKey, &'a SyncCursor)>,
    {
        let mut first_error = None;
        for (key, cursor) in cursors {
            if let Err(err) = self.checkpoint(key, cursor) {
                warn!(account = %key.account, mailbox = %key.mailbox, error = %err, "flush failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}
