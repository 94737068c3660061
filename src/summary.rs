use mailparse::{MailAddr, SingleInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::archive::fix_name;
use crate::error::{Error, Result};

pub const SUMMARY_DIR: &str = "summary";
pub const SENDERS_FILE: &str = "senders.txt";
pub const RECIPIENTS_FILE: &str = "recipients.txt";
pub const LOGIN_FAILURES_FILE: &str = "login-failures.txt";

/// Reduces one address to its tally key: `Name <addr@host>` gives
/// `addr@host`, anything without angle brackets is used as it is.
pub fn normalize_address(value: &str) -> Option<String> {
    let value = value.trim();
    let addr = match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim(),
        _ => value,
    };
    if addr.is_empty() {
        None
    } else if addr.contains('@') {
        Some(addr.to_lowercase())
    } else {
        Some(addr.to_string())
    }
}

/// Splits a header value into normalized addresses.
pub fn extract_addresses(value: &str) -> Vec<String> {
    fn push(out: &mut Vec<String>, single: &SingleInfo) {
        if let Some(addr) = normalize_address(&single.addr) {
            out.push(addr);
        }
    }

    let mut out = Vec::new();
    match mailparse::addrparse(value) {
        Ok(list) => {
            for addr in list.iter() {
                match addr {
                    MailAddr::Single(single) => push(&mut out, single),
                    MailAddr::Group(group) => {
                        for member in group.addrs.iter() {
                            push(&mut out, member);
                        }
                    }
                }
            }
        }
        Err(_) => out.extend(normalize_address(value)),
    }
    out
}

/// Running correspondent counts of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub senders: BTreeMap<String, u64>,
    pub recipients: BTreeMap<String, u64>,
}

impl Tally {
    /// Counts each distinct sender and recipient of one message once.
    pub fn record(&mut self, from: &[String], recipients: &[String]) {
        let from: BTreeSet<String> = from.iter().flat_map(|v| extract_addresses(v)).collect();
        for addr in from {
            *self.senders.entry(addr).or_insert(0) += 1;
        }
        let recipients: BTreeSet<String> = recipients
            .iter()
            .flat_map(|v| extract_addresses(v))
            .collect();
        for addr in recipients {
            *self.recipients.entry(addr).or_insert(0) += 1;
        }
    }
}

/// Per-account summary files under `<root>/summary`.
#[derive(Debug, Clone)]
pub struct SummaryStore {
    dir: PathBuf,
}

impl SummaryStore {
    pub fn new(root: &Path) -> Self {
        SummaryStore {
            dir: root.join(SUMMARY_DIR),
        }
    }

    pub fn account_dir(&self, account: &str) -> PathBuf {
        self.dir.join(fix_name(account))
    }

    /// Reads the counts of earlier runs so they keep accumulating.
    pub fn load(&self, account: &str) -> Tally {
        let dir = self.account_dir(account);
        Tally {
            senders: read_counts(&dir.join(SENDERS_FILE)),
            recipients: read_counts(&dir.join(RECIPIENTS_FILE)),
        }
    }

    /// Replaces the summary files of `account` with the current counts.
    pub fn flush(&self, account: &str, tally: &Tally) -> Result<()> {
        let dir = self.account_dir(account);
        fs::create_dir_all(&dir).map_err(|e| Error::write(&dir, e))?;
        write_counts(&dir.join(SENDERS_FILE), &tally.senders)?;
        write_counts(&dir.join(RECIPIENTS_FILE), &tally.recipients)?;
        debug!(account, senders = tally.senders.len(), recipients = tally.recipients.len(), "summary flushed");
        Ok(())
    }

    /// Adds accounts to the login-failure ledger, keeping earlier entries.
    pub fn record_login_failures<'a, I>(&self, accounts: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let path = self.dir.join(LOGIN_FAILURES_FILE);
        let mut ledger: BTreeSet<String> = self.login_failures().into_iter().collect();
        ledger.extend(accounts.into_iter().map(str::to_string));
        fs::create_dir_all(&self.dir).map_err(|e| Error::write(&self.dir, e))?;
        let content: String = ledger.iter().map(|a| format!("{}\n", a)).collect();
        replace_file(&path, content.as_bytes()).map_err(|e| Error::write(&path, e))
    }

    pub fn login_failures(&self) -> Vec<String> {
        fs::read_to_string(self.dir.join(LOGIN_FAILURES_FILE))
            .map(|content| {
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn read_counts(path: &Path) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "cannot read summary");
            }
            return counts;
        }
    };
    for line in content.lines() {
        let parsed = line
            .rsplit_once(':')
            .and_then(|(addr, count)| Some((addr.trim(), count.trim().parse::<u64>().ok()?)));
        match parsed {
            Some((addr, count)) if !addr.is_empty() => {
                *counts.entry(addr.to_string()).or_insert(0) += count;
            }
            _ => debug!(path = %path.display(), line, "skipping summary line"),
        }
    }
    counts
}

fn write_counts(path: &Path, counts: &BTreeMap<String, u64>) -> Result<()> {
    let content: String = counts
        .iter()
        .map(|(addr, count)| format!("{}:{}\n", addr, count))
        .collect();
    replace_file(path, content.as_bytes()).map_err(|e| Error::write(path, e))
}

fn replace_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)
}
