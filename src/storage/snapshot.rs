//! Sectioned snapshots of chain state.
//!
//! A snapshot is a bincode stream of a header followed by
//! per-section payloads, each carrying its own version so sections
//! can evolve independently. Reading a snapshot into a fresh node
//! must reproduce the integrity hash of the node that wrote it.

use {
  super::StorageError,
  crate::{
    chain::{block::SignedBlock, genesis::Genesis, header_state::HeaderState},
    primitives::Digest,
  },
  serde::{Deserialize, Serialize},
  std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
  },
  tracing::info,
};

const SNAPSHOT_MAGIC: u32 = 0x56454c54; // "VELT"
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
  magic: u32,
  version: u32,
  chain_id: Digest,
}

#[derive(Serialize, Deserialize)]
struct Section<T> {
  version: u32,
  payload: T,
}

/// Everything needed to boot a node at a block boundary.
#[derive(Serialize, Deserialize)]
pub struct Snapshot {
  pub genesis: Genesis,
  pub head_state: HeaderState,
  pub head_block: SignedBlock,
  pub state_entries: Vec<(Vec<u8>, Vec<u8>)>,
}

pub fn write_snapshot(
  path: &Path,
  chain_id: Digest,
  snapshot: &Snapshot,
) -> Result<(), StorageError> {
  let file = File::create(path)?;
  let mut writer = BufWriter::new(file);

  bincode::serialize_into(
    &mut writer,
    &SnapshotHeader { magic: SNAPSHOT_MAGIC, version: SNAPSHOT_VERSION, chain_id },
  )?;
  bincode::serialize_into(
    &mut writer,
    &Section { version: 1, payload: &snapshot.genesis },
  )?;
  bincode::serialize_into(
    &mut writer,
    &Section {
      version: 1,
      payload: (&snapshot.head_state, &snapshot.head_block),
    },
  )?;
  bincode::serialize_into(
    &mut writer,
    &Section { version: 1, payload: &snapshot.state_entries },
  )?;
  writer.flush()?;
  info!(
    "wrote snapshot at block {} to {}",
    snapshot.head_state.block_num(),
    path.display()
  );
  Ok(())
}

pub fn read_snapshot(
  path: &Path,
  expected_chain_id: Option<Digest>,
) -> Result<Snapshot, StorageError> {
  let file = File::open(path)?;
  let mut reader = BufReader::new(file);

  let header: SnapshotHeader = bincode::deserialize_from(&mut reader)?;
  if header.magic != SNAPSHOT_MAGIC {
    return Err(StorageError::CorruptSection("header"));
  }
  if header.version != SNAPSHOT_VERSION {
    return Err(StorageError::UnsupportedVersion(header.version));
  }
  if let Some(chain_id) = expected_chain_id {
    if header.chain_id != chain_id {
      return Err(StorageError::ChainIdMismatch);
    }
  }

  let genesis: Section<Genesis> = bincode::deserialize_from(&mut reader)?;
  let head: Section<(HeaderState, SignedBlock)> =
    bincode::deserialize_from(&mut reader)?;
  let state: Section<Vec<(Vec<u8>, Vec<u8>)>> =
    bincode::deserialize_from(&mut reader)?;

  Ok(Snapshot {
    genesis: genesis.payload,
    head_state: head.payload.0,
    head_block: head.payload.1,
    state_entries: state.payload,
  })
}
