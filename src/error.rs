use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::state::Uid;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unreadable configuration. Aborts the run before any sync.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("login failed for {account}: {reason}")]
    Auth { account: String, reason: String },

    /// Network or protocol failure talking to the server. Aborts the
    /// current mailbox; the backlog is kept for the next run.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("cannot decode message {uid}: {reason}")]
    Decode { uid: Uid, reason: String },

    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt sync state in {}: {reason}", path.display())]
    StateCorruption { path: PathBuf, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn auth(account: impl Into<String>, reason: impl ToString) -> Self {
        Self::Auth {
            account: account.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(msg: impl ToString) -> Self {
        Self::Transport(msg.to_string())
    }

    pub fn decode(uid: Uid, reason: impl ToString) -> Self {
        Self::Decode {
            uid,
            reason: reason.to_string(),
        }
    }

    pub fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::StateCorruption {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

impl From<::imap::Error> for Error {
    fn from(value: ::imap::Error) -> Self {
        Self::transport(value)
    }
}

impl From<native_tls::Error> for Error {
    fn from(value: native_tls::Error) -> Self {
        Self::transport(value)
    }
}
