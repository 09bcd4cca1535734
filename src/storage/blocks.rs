//! The block log: every irreversible block in height order.
//!
//! Two trees: `blocks` keyed by big-endian height (lexicographic order
//! equals numeric order) and `index` mapping block id to height.
//! Appends are flushed before they are acknowledged, because the fork
//! database root must never run ahead of the log.

use {
  super::StorageError,
  crate::{
    chain::block::SignedBlock,
    primitives::BlockId,
  },
  std::path::Path,
  tracing::info,
};

#[derive(Clone)]
pub struct BlockLog {
  db: sled::Db,
  blocks: sled::Tree,
  index: sled::Tree,
}

impl BlockLog {
  pub fn open(directory: &Path) -> Result<Self, StorageError> {
    let mut directory = directory.to_path_buf();
    directory.push("blocks");
    std::fs::create_dir_all(&directory)?;

    let db = sled::Config::new().path(&directory).open()?;
    let blocks = db.open_tree("blocks")?;
    let index = db.open_tree("index")?;
    Ok(Self { db, blocks, index })
  }

  /// An ephemeral log for tests and snapshot-born nodes.
  pub fn temporary() -> Result<Self, StorageError> {
    let db = sled::Config::new().temporary(true).open()?;
    let blocks = db.open_tree("blocks")?;
    let index = db.open_tree("index")?;
    Ok(Self { db, blocks, index })
  }

  /// Height of the newest appended block, if any.
  pub fn head_num(&self) -> Result<Option<u32>, StorageError> {
    Ok(
      self
        .blocks
        .last()?
        .map(|(k, _)| u32::from_be_bytes(k.as_ref().try_into().expect("4-byte key"))),
    )
  }

  pub fn head(&self) -> Result<Option<SignedBlock>, StorageError> {
    match self.blocks.last()? {
      Some((_, bytes)) => Ok(Some(bincode::deserialize(&bytes)?)),
      None => Ok(None),
    }
  }

  /// Appends the next irreversible block. Heights must be gapless and
  /// monotonic.
  pub fn append(&self, block: &SignedBlock) -> Result<(), StorageError> {
    let num = block.block_num();
    if let Some(head) = self.head_num()? {
      if num != head + 1 {
        return Err(StorageError::LogGap { num, head });
      }
    }
    self
      .blocks
      .insert(num.to_be_bytes(), bincode::serialize(block)?)?;
    self
      .index
      .insert(block.id().to_bytes(), &num.to_be_bytes())?;
    self.db.flush()?;
    Ok(())
  }

  pub fn read_by_num(
    &self,
    num: u32,
  ) -> Result<Option<SignedBlock>, StorageError> {
    match self.blocks.get(num.to_be_bytes())? {
      Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
      None => Ok(None),
    }
  }

  pub fn read_by_id(
    &self,
    id: &BlockId,
  ) -> Result<Option<SignedBlock>, StorageError> {
    match self.index.get(id.to_bytes())? {
      Some(num) => self.read_by_num(u32::from_be_bytes(
        num.as_ref().try_into().expect("4-byte value"),
      )),
      None => Ok(None),
    }
  }

  pub fn contains(&self, id: &BlockId) -> Result<bool, StorageError> {
    Ok(self.index.contains_key(id.to_bytes())?)
  }

  /// Drops everything; used when a snapshot replaces history.
  pub fn reset(&self) -> Result<(), StorageError> {
    info!("resetting block log");
    self.blocks.clear()?;
    self.index.clear()?;
    self.db.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::header::{BlockHeader, SignedBlockHeader},
      primitives::{BlockTimestamp, Digest, Keypair},
    },
  };

  fn block(previous: BlockId, slot: u32) -> SignedBlock {
    use ed25519_dalek::Signer;
    let keypair: Keypair = "9wkzHU5nqzvAdGPjvXZCsEkUwiHExdE9mTCYLVMzgm81"
      .parse()
      .unwrap();
    let header = BlockHeader {
      timestamp: BlockTimestamp(slot),
      producer: "prod".into(),
      confirmed: 0,
      previous,
      transaction_mroot: Digest::default(),
      action_mroot: Digest::default(),
      schedule_version: 1,
      new_producers: None,
      header_extensions: vec![],
    };
    let producer_signature = keypair.sign(header.digest().as_ref());
    SignedBlock {
      signed_header: SignedBlockHeader { header, producer_signature },
      transactions: vec![],
      block_extensions: vec![],
    }
  }

  #[test]
  fn append_and_read_back() {
    let log = BlockLog::temporary().unwrap();
    assert_eq!(log.head_num().unwrap(), None);

    let b1 = block(BlockId::new(Digest::hash(b"genesis"), 0), 1);
    let b2 = block(b1.id(), 2);
    log.append(&b1).unwrap();
    log.append(&b2).unwrap();

    assert_eq!(log.head_num().unwrap(), Some(2));
    assert_eq!(log.read_by_num(1).unwrap().unwrap(), b1);
    assert_eq!(log.read_by_id(&b2.id()).unwrap().unwrap(), b2);
    assert!(log.contains(&b1.id()).unwrap());
    assert!(!log.contains(&BlockId::default()).unwrap());
  }

  #[test]
  fn gaps_are_rejected() {
    let log = BlockLog::temporary().unwrap();
    let b1 = block(BlockId::new(Digest::hash(b"genesis"), 0), 1);
    let b3 = block(BlockId::new(Digest::hash(b"other"), 2), 3);
    log.append(&b1).unwrap();
    assert!(matches!(
      log.append(&b3),
      Err(StorageError::LogGap { num: 3, head: 1 })
    ));
  }
}
