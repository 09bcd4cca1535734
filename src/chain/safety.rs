//! Finalizer vote safety.
//!
//! Every local finalizer persists its last vote and its lock. A vote
//! is released only if it cannot conflict with what was promised
//! before: the last vote never regresses (monotony) and a strong vote
//! is only cast on blocks extending the lock (safety). Liveness lets
//! a finalizer vote weak when the chain provably moved past its lock.
//! The record hits disk, fsynced, before the vote leaves the node.

use {
  super::header_state::BlockRef,
  crate::primitives::{BlockTimestamp, BlsKeypair, BlsPubkey},
  serde::{Deserialize, Serialize},
  std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::PathBuf,
  },
  thiserror::Error,
  tracing::info,
};

const SAFETY_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SafetyError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("codec error: {0}")]
  Codec(#[from] bincode::Error),

  #[error("unsupported safety file version {0}")]
  UnsupportedVersion(u32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerSafetyInfo {
  pub last_vote: Option<BlockRef>,
  pub lock: Option<BlockRef>,
}

#[derive(Serialize, Deserialize)]
struct SafetyFileContents {
  version: u32,
  records: BTreeMap<Vec<u8>, FinalizerSafetyInfo>,
}

/// The outcome of a vote decision.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VoteDecision {
  Strong,
  Weak,
  NoVote,
}

/// The local finalizer keys and their persistent safety records.
pub struct LocalFinalizers {
  keys: Vec<BlsKeypair>,
  records: BTreeMap<Vec<u8>, FinalizerSafetyInfo>,
  path: Option<PathBuf>,
}

impl LocalFinalizers {
  pub fn new(
    keys: Vec<BlsKeypair>,
    directory: Option<PathBuf>,
  ) -> Result<Self, SafetyError> {
    let path = match directory {
      Some(mut dir) => {
        std::fs::create_dir_all(&dir)?;
        dir.push("safety.dat");
        Some(dir)
      }
      None => None,
    };

    let mut records = BTreeMap::new();
    if let Some(path) = &path {
      if path.exists() {
        let mut bytes = vec![];
        File::open(path)?.read_to_end(&mut bytes)?;
        let contents: SafetyFileContents = bincode::deserialize(&bytes)?;
        if contents.version != SAFETY_FILE_VERSION {
          return Err(SafetyError::UnsupportedVersion(contents.version));
        }
        records = contents.records;
        info!("loaded {} finalizer safety record(s)", records.len());
      }
    }

    Ok(Self { keys, records, path })
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  pub fn keys(&self) -> &[BlsKeypair] {
    &self.keys
  }

  pub fn record(&self, key: &BlsPubkey) -> FinalizerSafetyInfo {
    self.records.get(&key.0).cloned().unwrap_or_default()
  }

  /// Decides whether the finalizer owning `key` may vote on a block.
  ///
  /// `block` identifies the proposal, `extends_lock` says whether the
  /// proposal descends from the locked block, and `claimed_timestamp`
  /// is the timestamp of the block the proposal's QC claim points at
  /// (the liveness witness).
  pub fn decide_vote(
    &self,
    key: &BlsPubkey,
    block: &BlockRef,
    extends_lock: bool,
    claimed_timestamp: BlockTimestamp,
  ) -> VoteDecision {
    let record = self.record(key);

    // monotony: never vote backwards
    if let Some(last) = &record.last_vote {
      if block.timestamp <= last.timestamp {
        return VoteDecision::NoVote;
      }
    }

    match &record.lock {
      None => {
        // an unlocked finalizer may only witness liveness
        VoteDecision::Weak
      }
      Some(lock) => {
        if extends_lock {
          VoteDecision::Strong
        } else if claimed_timestamp > lock.timestamp {
          // the network has provably moved past the lock
          VoteDecision::Weak
        } else {
          VoteDecision::NoVote
        }
      }
    }
  }

  /// Records a released vote and persists before returning. A strong
  /// vote moves the lock to the proposal's claimed ancestor.
  pub fn record_vote(
    &mut self,
    key: &BlsPubkey,
    block: BlockRef,
    decision: VoteDecision,
    claimed_ref: Option<BlockRef>,
  ) -> Result<(), SafetyError> {
    let record = self.records.entry(key.0.clone()).or_default();
    record.last_vote = Some(block);
    if decision == VoteDecision::Strong {
      if let Some(claimed) = claimed_ref {
        record.lock = Some(claimed);
      }
    }
    self.persist()
  }

  /// Gives finalizers with no history at all an initial lock, so a
  /// chain that starts under Savanna can cast strong votes from its
  /// first block. Existing records are left alone.
  pub fn ensure_locked(
    &mut self,
    default_ref: BlockRef,
  ) -> Result<(), SafetyError> {
    let mut changed = false;
    for keypair in &self.keys {
      let record =
        self.records.entry(keypair.public().0.clone()).or_default();
      if record.lock.is_none() && record.last_vote.is_none() {
        record.lock = Some(default_ref.clone());
        changed = true;
      }
    }
    if changed {
      self.persist()?;
    }
    Ok(())
  }

  /// Resets every local finalizer to the transition post-condition:
  /// lock on the transition block, empty last vote.
  pub fn reset_at_transition(
    &mut self,
    transition_ref: BlockRef,
  ) -> Result<(), SafetyError> {
    for keypair in &self.keys {
      let record =
        self.records.entry(keypair.public().0.clone()).or_default();
      record.lock = Some(transition_ref.clone());
      record.last_vote = None;
    }
    self.persist()?;

    // the transition must leave no finalizer in any other state
    debug_assert!(self.keys.iter().all(|k| {
      let r = self.record(k.public());
      r.last_vote.is_none() && r.lock.as_ref() == Some(&transition_ref)
    }));
    Ok(())
  }

  fn persist(&self) -> Result<(), SafetyError> {
    let Some(path) = &self.path else {
      return Ok(());
    };
    let contents = SafetyFileContents {
      version: SAFETY_FILE_VERSION,
      records: self.records.clone(),
    };
    let mut file = OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(true)
      .open(path)?;
    file.write_all(&bincode::serialize(&contents)?)?;
    // a vote must never leave the node before its record is durable
    file.sync_all()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::{BlockId, Digest},
  };

  fn make_ref(num: u32) -> BlockRef {
    BlockRef {
      block_id: BlockId::new(Digest::hash(num.to_le_bytes()), num),
      timestamp: BlockTimestamp(num),
      finality_digest: Digest::default(),
    }
  }

  fn finalizers() -> LocalFinalizers {
    let mut rng = rand::thread_rng();
    LocalFinalizers::new(vec![BlsKeypair::generate(&mut rng)], None).unwrap()
  }

  #[test]
  fn monotony_blocks_regressing_votes() {
    let mut finalizers = finalizers();
    let key = finalizers.keys()[0].public().clone();

    finalizers
      .record_vote(&key, make_ref(10), VoteDecision::Weak, None)
      .unwrap();
    assert_eq!(
      finalizers.decide_vote(&key, &make_ref(10), true, BlockTimestamp(9)),
      VoteDecision::NoVote
    );
    assert_ne!(
      finalizers.decide_vote(&key, &make_ref(11), true, BlockTimestamp(9)),
      VoteDecision::NoVote
    );
  }

  #[test]
  fn lock_gates_strong_votes() {
    let mut finalizers = finalizers();
    let key = finalizers.keys()[0].public().clone();

    finalizers.reset_at_transition(make_ref(5)).unwrap();
    // extends the lock: strong
    assert_eq!(
      finalizers.decide_vote(&key, &make_ref(6), true, BlockTimestamp(5)),
      VoteDecision::Strong
    );
    // conflicting branch, but liveness witnessed past the lock: weak
    assert_eq!(
      finalizers.decide_vote(&key, &make_ref(7), false, BlockTimestamp(6)),
      VoteDecision::Weak
    );
    // conflicting branch, no liveness: abstain
    assert_eq!(
      finalizers.decide_vote(&key, &make_ref(7), false, BlockTimestamp(4)),
      VoteDecision::NoVote
    );
  }

  #[test]
  fn strong_vote_moves_the_lock() {
    let mut finalizers = finalizers();
    let key = finalizers.keys()[0].public().clone();

    finalizers.reset_at_transition(make_ref(5)).unwrap();
    finalizers
      .record_vote(&key, make_ref(8), VoteDecision::Strong, Some(make_ref(7)))
      .unwrap();
    let record = finalizers.record(&key);
    assert_eq!(record.lock.unwrap().block_num(), 7);
    assert_eq!(record.last_vote.unwrap().block_num(), 8);
  }

  #[test]
  fn safety_file_roundtrip() {
    let dir = std::env::temp_dir().join(format!(
      "veldt-safety-{}",
      std::process::id()
    ));
    let mut rng = rand::thread_rng();
    let keypair = BlsKeypair::generate(&mut rng);
    let key = keypair.public().clone();

    {
      let mut finalizers =
        LocalFinalizers::new(vec![keypair.clone()], Some(dir.clone()))
          .unwrap();
      finalizers
        .record_vote(&key, make_ref(42), VoteDecision::Weak, None)
        .unwrap();
    }

    let reloaded =
      LocalFinalizers::new(vec![keypair], Some(dir.clone())).unwrap();
    assert_eq!(reloaded.record(&key).last_vote.unwrap().block_num(), 42);
    let _ = std::fs::remove_dir_all(dir);
  }
}
