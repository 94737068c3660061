pub mod archive;
pub mod config;
pub mod error;
pub mod fetch;
pub mod imap;
pub mod message;
pub mod reconcile;
pub mod remote;
pub mod state;
pub mod summary;
pub mod sync;
mod utils;

pub use crate::config::{AccountConfig, Config};
pub use crate::error::{Error, Result};
pub use crate::sync::{synchronize, RunOptions, RunReport};
