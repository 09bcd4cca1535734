mod blocks;
mod fork_file;
mod snapshot;

pub use {
  blocks::BlockLog,
  fork_file::{load_fork_db, save_fork_db},
  snapshot::{read_snapshot, write_snapshot, Snapshot, SNAPSHOT_VERSION},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("database error: {0}")]
  Db(#[from] sled::Error),

  #[error("codec error: {0}")]
  Codec(#[from] bincode::Error),

  #[error("block log gap: appending {num}, head is {head}")]
  LogGap { num: u32, head: u32 },

  #[error("snapshot chain id mismatch")]
  ChainIdMismatch,

  #[error("unsupported snapshot version {0}")]
  UnsupportedVersion(u32),

  #[error("corrupt {0} section")]
  CorruptSection(&'static str),
}
