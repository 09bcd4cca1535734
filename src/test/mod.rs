//! Test fixtures: deterministic keys, genesis builders and a small
//! in-process node harness used by the scenario tests.

mod scenarios;

use {
  crate::{
    chain::{
      Action,
      ApplyResult,
      BlockState,
      BlockStatus,
      ChainError,
      Config,
      Controller,
      FinalizerAuthority,
      FinalizerPolicy,
      Genesis,
      KvExecutor,
      PackedTransaction,
      ProducerAuthority,
      ProducerSchedule,
      SignedTransaction,
      StartBlockParams,
      Transaction,
      TransactionMetadata,
    },
    primitives::{
      AccountName,
      BlockTimestamp,
      BlsKeypair,
      Digest,
      Keypair,
      TimePoint,
      TransactionId,
    },
  },
  chrono::{TimeZone, Utc},
  std::{collections::HashMap, sync::Arc, time::Duration},
};

/// Deterministic ed25519 key for a numbered test identity.
pub fn keypair(seed: u8) -> Keypair {
  Keypair::try_from(&[seed.max(1); 32][..]).expect("valid secret")
}

/// Deterministic BLS key; scans for the first seed variant below the
/// scalar modulus.
pub fn bls_keypair(seed: u8) -> BlsKeypair {
  let mut bytes = [0u8; 32];
  bytes[0] = seed.max(1);
  for filler in 0u8..=255 {
    bytes[31] = filler;
    if let Ok(keypair) = BlsKeypair::try_from(&bytes[..]) {
      return keypair;
    }
  }
  unreachable!("some variant is a valid scalar");
}

/// A single-producer legacy genesis.
pub fn legacy_genesis(producers: &[(&str, &Keypair)]) -> Genesis {
  Genesis {
    name: "veldt-testnet".into(),
    genesis_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
    initial_schedule: ProducerSchedule {
      version: 0,
      producers: producers
        .iter()
        .map(|(name, key)| ProducerAuthority {
          producer_name: (*name).into(),
          signing_key: key.public(),
        })
        .collect(),
    },
    initial_finalizer_policy: None,
  }
}

pub fn finalizer_policy(keys: &[BlsKeypair], threshold: u64) -> FinalizerPolicy {
  FinalizerPolicy {
    generation: 1,
    threshold,
    finalizers: keys
      .iter()
      .enumerate()
      .map(|(i, key)| FinalizerAuthority {
        description: format!("finalizer-{i}"),
        weight: 1,
        public_key: key.public().clone(),
      })
      .collect(),
  }
}

/// A genesis that starts directly under Savanna.
pub fn savanna_genesis(
  producers: &[(&str, &Keypair)],
  finalizers: &[BlsKeypair],
  threshold: u64,
) -> Genesis {
  Genesis {
    initial_finalizer_policy: Some(finalizer_policy(finalizers, threshold)),
    ..legacy_genesis(producers)
  }
}

pub fn test_config() -> Config {
  Config {
    // scenario blocks carry historic timestamps; recency must not
    // suppress their votes
    vote_recency: Duration::from_secs(60 * 60 * 24 * 365 * 100),
    ..Config::default()
  }
}

/// An in-process node: a controller plus the signing keys of every
/// producer it may impersonate.
pub struct TestNode {
  pub controller: Controller,
  pub producer_keys: HashMap<AccountName, Keypair>,
}

impl TestNode {
  pub fn new(
    genesis: Genesis,
    producers: &[(&str, &Keypair)],
    finalizer_keys: Vec<BlsKeypair>,
  ) -> Self {
    Self::with_config(genesis, producers, finalizer_keys, test_config())
  }

  pub fn with_config(
    genesis: Genesis,
    producers: &[(&str, &Keypair)],
    finalizer_keys: Vec<BlsKeypair>,
    config: Config,
  ) -> Self {
    let controller =
      Controller::new(genesis, config, Arc::new(KvExecutor), finalizer_keys)
        .expect("controller boots");
    Self {
      controller,
      producer_keys: producers
        .iter()
        .map(|(name, key)| (AccountName::from(*name), (*key).clone()))
        .collect(),
    }
  }

  pub fn head_num(&self) -> u32 {
    self.controller.head().block_num()
  }

  /// The next slot after the current head.
  pub fn next_slot(&self) -> BlockTimestamp {
    self.controller.head().timestamp().next()
  }

  /// Produces one block at the given slot, pushing the given
  /// transactions.
  pub fn produce_at(
    &mut self,
    slot: BlockTimestamp,
    transactions: &[Arc<TransactionMetadata>],
    feature_activations: Vec<Digest>,
  ) -> Result<Arc<BlockState>, ChainError> {
    let schedule =
      self.controller.head().header_state.producer_schedule().clone();
    let producer = schedule.producer_for(slot).producer_name.clone();
    let key = self
      .producer_keys
      .get(&producer)
      .unwrap_or_else(|| panic!("no key for producer {producer}"))
      .clone();

    self.controller.start_block(StartBlockParams {
      when: slot,
      confirm_count: 0,
      feature_activations,
      status: BlockStatus::Incomplete,
      producer_block_id: None,
      deadline: TimePoint::now() + Duration::from_secs(10),
    })?;
    for meta in transactions {
      let trace = self
        .controller
        .push_transaction(meta.clone(), TimePoint::now() + Duration::from_secs(10))?;
      if let Some(except) = trace.except {
        self.controller.abort_block();
        return Err(ChainError::Storage(format!(
          "transaction rejected: {except}"
        )));
      }
    }
    self.controller.assemble_and_complete_block(&key)?;
    let bsp = self.controller.commit_block()?;
    self.controller.log_irreversible()?;
    Ok(bsp)
  }

  pub fn produce(&mut self) -> Result<Arc<BlockState>, ChainError> {
    self.produce_at(self.next_slot(), &[], vec![])
  }

  /// Accepts a peer block and runs the apply loop, returning the
  /// transactions handed back by fork switches.
  pub fn feed(
    &mut self,
    block: crate::chain::SignedBlock,
  ) -> Result<Vec<Arc<TransactionMetadata>>, ChainError> {
    self.controller.accept_block(block)?;
    self.apply_all()
  }

  pub fn apply_all(
    &mut self,
  ) -> Result<Vec<Arc<TransactionMetadata>>, ChainError> {
    let lookup = |_: &TransactionId| None;
    let mut forked = vec![];
    loop {
      let result = self
        .controller
        .apply_blocks(&mut |metas| forked.extend(metas), &lookup)?;
      if result != ApplyResult::Incomplete {
        return Ok(forked);
      }
    }
  }

  /// Builds a signed transaction with one opaque action, authorized
  /// and signed by the derived key of `account`.
  pub fn make_transaction(
    &self,
    account: &str,
    payload: &[u8],
    expiration: TimePoint,
  ) -> Arc<TransactionMetadata> {
    make_transaction(self.controller.chain_id(), account, payload, expiration)
  }
}

pub fn make_transaction(
  chain_id: Digest,
  account: &str,
  payload: &[u8],
  expiration: TimePoint,
) -> Arc<TransactionMetadata> {
  let key = keypair(account.len() as u8 + payload.len() as u8);
  let transaction = Transaction {
    expiration,
    ref_block_num: 0,
    authorizers: vec![key.public()],
    actions: vec![Action {
      account: account.into(),
      name: "store".into(),
      authorizer: account.into(),
      data: payload.to_vec(),
    }],
  };
  use ed25519_dalek::Signer;
  let digest = transaction.signing_digest(&chain_id);
  let signatures = vec![key.sign(digest.as_ref())];
  TransactionMetadata::recover_keys(
    PackedTransaction(SignedTransaction { transaction, signatures }),
    &chain_id,
  )
  .expect("valid signature")
}

/// A throwaway directory under the system tempdir.
pub fn scratch_dir(tag: &str) -> std::path::PathBuf {
  let dir = std::env::temp_dir().join(format!(
    "veldt-{tag}-{}-{:x}",
    std::process::id(),
    rand::random::<u32>()
  ));
  std::fs::create_dir_all(&dir).expect("scratch dir");
  dir
}
