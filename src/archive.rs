use chrono::NaiveDate;
use std::fs::{self, File};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::state::Uid;

pub const ARCHIVE_DIR: &str = "email";
/// File name used when the subject cannot be decoded or written.
pub const INVALID_SUBJECT: &str = "invalid-subject";
/// Date directory for messages without a usable Date header.
pub const UNKNOWN_DATE: &str = "unknown";

const PATH_SPECIAL_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// One fetched message on its way to disk.
#[derive(Debug, Clone, Copy)]
pub struct ArchivedMessage<'a> {
    pub account: &'a str,
    pub group: Option<&'a str>,
    pub mailbox: &'a str,
    pub date: Option<NaiveDate>,
    pub uid_validity: Option<u32>,
    pub uid: Uid,
    /// `None` when the subject could not be decoded.
    pub subject: Option<&'a str>,
    pub body: &'a [u8],
}

pub fn fix_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if PATH_SPECIAL_CHARS.contains(&c) || c.is_control() {
                '-'
            } else {
                c
            }
        })
        .collect()
}

fn fix_component(name: &str) -> String {
    match name {
        "." | ".." => "-".to_string(),
        _ => fix_name(name),
    }
}

fn get_date_name(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| UNKNOWN_DATE.to_string())
}

/// Writes messages to
/// `<root>/email/[<group>/]<account>/<mailbox>/<YYYY-MM-DD>/<uid>-<subject>.eml`.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    dir: PathBuf,
}

impl ArchiveWriter {
    pub fn new(root: &Path) -> Self {
        ArchiveWriter {
            dir: root.join(ARCHIVE_DIR),
        }
    }

    pub fn account_dir(&self, account: &str, group: Option<&str>) -> PathBuf {
        let mut path = self.dir.clone();
        if let Some(group) = group {
            path.push(fix_component(group));
        }
        path.push(fix_component(account));
        path
    }

    pub fn message_dir(&self, message: &ArchivedMessage) -> PathBuf {
        let mut path = self.account_dir(message.account, message.group);
        // Hierarchical mailboxes become nested directories.
        for part in message.mailbox.split('/').filter(|p| !p.is_empty()) {
            path.push(fix_component(part));
        }
        path.push(get_date_name(message.date));
        path
    }

    /// Writes the message, replacing an earlier copy of the same message.
    /// When the derived file name cannot be written the fallback name is
    /// tried once.
    pub fn write(&self, message: &ArchivedMessage) -> Result<PathBuf> {
        let dir = self.message_dir(message);
        fs::create_dir_all(&dir).map_err(|e| Error::write(&dir, e))?;

        let name = match message.subject {
            Some(subject) => fix_name(subject),
            None => INVALID_SUBJECT.to_string(),
        };
        let path = target_path(&dir, message, &name);
        let err = match write_message(&path, message.body) {
            Ok(()) => return Ok(path),
            Err(err) => err,
        };
        warn!(
            path = %path.display(),
            uid = message.uid,
            error = %err,
            "write failed, retrying with fallback name"
        );

        let fallback = target_path(&dir, message, INVALID_SUBJECT);
        match write_message(&fallback, message.body) {
            Ok(()) => Ok(fallback),
            Err(err) => {
                error!(path = %fallback.display(), uid = message.uid, error = %err, "message lost");
                Err(Error::write(fallback, err))
            }
        }
    }
}

/// `<uid>-<name>.eml`, unless that file already holds a different message.
/// A UID only names one message per UIDVALIDITY, so a different body there
/// was archived before the mailbox was renumbered and is kept; the new one
/// goes to `<uid>-<uidvalidity>-<name>.eml`.
fn target_path(dir: &Path, message: &ArchivedMessage, name: &str) -> PathBuf {
    let path = dir.join(format!("{}-{}.eml", message.uid, name));
    let uid_validity = match message.uid_validity {
        Some(uid_validity) => uid_validity,
        None => return path,
    };
    match fs::read(&path) {
        Ok(existing) if existing != message.body => {
            let renamed = dir.join(format!("{}-{}-{}.eml", message.uid, uid_validity, name));
            warn!(
                existing = %path.display(),
                path = %renamed.display(),
                "archived copy holds another message, keeping both"
            );
            renamed
        }
        _ => path,
    }
}

#[cfg(unix)]
fn set_message_permission(file: &File) -> io::Result<()> {
    let mut perms = file.metadata()?.permissions();
    let mode = (perms.mode() & !0o777) | 0o600;
    perms.set_mode(mode);
    file.set_permissions(perms)
}

fn write_message(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);
    let result = write_synced(&tmp_path, body).and_then(|()| fs::rename(&tmp_path, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_synced(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    #[cfg(unix)]
    set_message_permission(&file)?;
    file.write_all(body)?;
    file.sync_all()
}
