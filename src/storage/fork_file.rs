//! Fork database persistence.
//!
//! On clean shutdown the not-yet-irreversible blocks are written out
//! so a restart can re-validate them without the network. The file
//! holds signed blocks only; their states are rebuilt by
//! re-execution, which makes a stale or corrupt file safe to discard.

use {
  super::StorageError,
  crate::chain::{ForkDatabase, SignedBlock},
  std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
  },
  tracing::{info, warn},
};

const FORK_FILE_MAGIC: u32 = 0x56464442; // "VFDB"
const FORK_FILE_VERSION: u32 = 1;

pub fn save_fork_db(
  path: &Path,
  fork_db: &ForkDatabase,
) -> Result<(), StorageError> {
  let active = fork_db.active();
  let mut blocks: Vec<SignedBlock> = active
    .fetch_branch(active.head().id(), None)
    .into_iter()
    .map(|b| (*b.block).clone())
    .collect();
  blocks.reverse();

  let file = File::create(path)?;
  let mut writer = BufWriter::new(file);
  bincode::serialize_into(&mut writer, &(FORK_FILE_MAGIC, FORK_FILE_VERSION))?;
  bincode::serialize_into(&mut writer, &blocks)?;
  writer.flush()?;
  info!("wrote {} in-flight block(s) to {}", blocks.len(), path.display());
  Ok(())
}

/// Loads the saved branch, oldest first. Missing or unreadable files
/// yield an empty branch; the node simply rebuilds from peers.
pub fn load_fork_db(path: &Path) -> Vec<SignedBlock> {
  let Ok(file) = File::open(path) else {
    return vec![];
  };
  let mut reader = BufReader::new(file);
  let header: Result<(u32, u32), _> = bincode::deserialize_from(&mut reader);
  match header {
    Ok((FORK_FILE_MAGIC, FORK_FILE_VERSION)) => {}
    _ => {
      warn!("discarding unrecognized fork database file {}", path.display());
      return vec![];
    }
  }
  match bincode::deserialize_from(&mut reader) {
    Ok(blocks) => blocks,
    Err(e) => {
      warn!("discarding corrupt fork database file: {e}");
      vec![]
    }
  }
}
