//! The orchestrator of the block lifecycle.
//!
//! The controller owns the chain head, the pending block, the fork
//! database, the state store and the block log. Every mutation goes
//! through `&mut self`, which pins all state transitions to the one
//! task driving the controller; other threads observe the fork
//! database through its read lock and the event stream.

use {
  super::{
    block::{
      Action,
      PackedTransaction,
      ReceiptTransaction,
      SignedBlock,
      SignedTransaction,
      Transaction,
      TransactionMetadata,
      TransactionReceipt,
      TransactionStatus,
    },
    block_state::{BlockState, ValidBlock},
    error::{
      ChainError,
      FeatureError,
      QcError,
      TransactionError,
      ValidationError,
    },
    exec::{
      ExecClass,
      ExecFailure,
      ExecTimer,
      InterruptKind,
      TransactionExecutor,
      TransactionTrace,
    },
    features::{ProtocolFeatureSet, DISABLE_DEFERRED_TRXS_FEATURE, SAVANNA_FEATURE},
    fork_db::{AddResult, ForkDatabase, InUse},
    genesis::Genesis,
    header::{
      BlockHeader,
      FinalityExtension,
      HeaderExtension,
      SignedBlockHeader,
      SAVANNA_SCHEDULE_VERSION,
    },
    header_state::{
      HeaderState,
      LegacyHeaderState,
      SavannaHeaderState,
      SavannaNextInput,
    },
    pending::{
      AssembledBlock,
      BlockStatus,
      BuildingBlock,
      CompletedBlock,
      PendingBlock,
      PendingStage,
    },
    policy::{FinalizerPolicy, FinalizerPolicyDiff, ProposerPolicy},
    qc::{Qc, QcClaim, VoteMessage, VoteStatus},
    safety::{LocalFinalizers, VoteDecision},
  },
  crate::{
    primitives::{
      canonical_merkle,
      legacy_merkle,
      BlockId,
      BlockTimestamp,
      Digest,
      Keypair,
      TimePoint,
      TransactionId,
    },
    state::StateStore,
    storage::{read_snapshot, write_snapshot, BlockLog, Snapshot},
  },
  std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{Duration, Instant},
  },
  tokio::sync::broadcast,
  tracing::{debug, error, info, warn},
};

const DEDUP_PREFIX: &[u8] = b"dedup/";
const SCHEDULED_PREFIX: &[u8] = b"sched/";

/// How far the controller applies ahead of irreversibility.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadMode {
  Head,
  Speculative,
  Irreversible,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValidationMode {
  Full,
  Light,
}

/// Result of one `apply_blocks` round.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ApplyResult {
  /// Chain head reached the best known block.
  Complete,
  /// Yielded on the cooperative time slice; call again.
  Incomplete,
  /// Stopped at a pause or terminate boundary.
  Paused,
}

#[derive(Clone, Debug)]
pub struct Config {
  pub state_dir: Option<PathBuf>,
  pub blocks_dir: Option<PathBuf>,
  pub finalizers_dir: Option<PathBuf>,
  pub read_mode: ReadMode,
  pub validation_mode: ValidationMode,
  pub force_all_checks: bool,
  pub terminate_at_block: Option<u32>,
  pub chain_thread_pool_size: usize,
  /// How old a block may be and still get a vote.
  pub vote_recency: Duration,
  /// Cooperative yield threshold for `apply_blocks` and
  /// `log_irreversible`.
  pub apply_time_slice: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      state_dir: None,
      blocks_dir: None,
      finalizers_dir: None,
      read_mode: ReadMode::Head,
      validation_mode: ValidationMode::Full,
      force_all_checks: false,
      terminate_at_block: None,
      chain_thread_pool_size: 4,
      vote_recency: Duration::from_secs(30),
      apply_time_slice: Duration::from_millis(500),
    }
  }
}

/// Everything the controller announces to the rest of the node.
/// Subscribers must not block; slow consumers lose events.
#[derive(Clone, Debug)]
pub enum ChainEvent {
  AcceptedBlockHeader(Arc<BlockState>),
  AcceptedBlock(Arc<BlockState>),
  IrreversibleBlock(Arc<BlockState>),
  AppliedTransaction(Arc<TransactionTrace>),
  VotedBlock(VoteMessage),
  AggregatedVote { block_id: BlockId, strong: bool },
}

pub struct StartBlockParams {
  pub when: BlockTimestamp,
  pub confirm_count: u16,
  pub feature_activations: Vec<Digest>,
  pub status: BlockStatus,
  pub producer_block_id: Option<BlockId>,
  pub deadline: TimePoint,
}

pub struct Controller {
  genesis: Genesis,
  chain_id: Digest,
  config: Config,
  state: StateStore,
  block_log: BlockLog,
  fork_db: Arc<RwLock<ForkDatabase>>,
  head: Arc<BlockState>,
  pending: Option<PendingBlock>,
  features: ProtocolFeatureSet,
  executor: Arc<dyn TransactionExecutor>,
  timer: Arc<ExecTimer>,
  pool: rayon::ThreadPool,
  events: broadcast::Sender<ChainEvent>,
  finalizers: LocalFinalizers,
  read_window: bool,
  pause_at_block: Option<u32>,
  savanna_genesis_num: Option<u32>,
}

impl Controller {
  pub fn new(
    genesis: Genesis,
    config: Config,
    executor: Arc<dyn TransactionExecutor>,
    finalizer_keys: Vec<crate::primitives::BlsKeypair>,
  ) -> Result<Self, ChainError> {
    let chain_id = genesis.chain_id();
    let block_log = match &config.blocks_dir {
      Some(dir) => BlockLog::open(dir).map_err(storage_err)?,
      None => BlockLog::temporary().map_err(storage_err)?,
    };
    let finalizers =
      LocalFinalizers::new(finalizer_keys, config.finalizers_dir.clone())
        .map_err(|e| ChainError::Storage(e.to_string()))?;
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(config.chain_thread_pool_size)
      .build()
      .map_err(|e| ChainError::Storage(e.to_string()))?;
    let (events, _) = broadcast::channel(1024);

    let genesis_bsp = Self::genesis_block_state(&genesis, chain_id);
    let fork_db = if genesis.initial_finalizer_policy.is_some() {
      ForkDatabase::new_savanna(genesis_bsp.clone())
    } else {
      ForkDatabase::new_legacy(genesis_bsp.clone())
    };

    let mut state = StateStore::new();
    state.set_revision(0).expect("fresh store");

    let mut controller = Self {
      savanna_genesis_num: genesis
        .initial_finalizer_policy
        .as_ref()
        .map(|_| 0),
      genesis,
      chain_id,
      config,
      state,
      block_log,
      fork_db: Arc::new(RwLock::new(fork_db)),
      head: genesis_bsp,
      pending: None,
      features: ProtocolFeatureSet::with_builtins(),
      executor,
      timer: Arc::new(ExecTimer::default()),
      pool,
      events,
      finalizers,
      read_window: false,
      pause_at_block: None,
    };

    if let HeaderState::Savanna(_) = &controller.head.header_state {
      // chains born under Savanna lock their finalizers on genesis
      let genesis_ref = controller.head.block_ref();
      controller
        .finalizers
        .ensure_locked(genesis_ref)
        .map_err(|e| ChainError::Storage(e.to_string()))?;
    }

    controller.replay_block_log()?;
    Ok(controller)
  }

  fn genesis_block_state(genesis: &Genesis, chain_id: Digest) -> Arc<BlockState> {
    let starts_savanna = genesis.initial_finalizer_policy.is_some();
    let header = BlockHeader {
      timestamp: genesis.timestamp(),
      producer: genesis.initial_schedule.producers[0].producer_name.clone(),
      confirmed: 0,
      previous: BlockId::default(),
      transaction_mroot: Digest::default(),
      action_mroot: Digest::default(),
      schedule_version: if starts_savanna {
        SAVANNA_SCHEDULE_VERSION
      } else {
        genesis.initial_schedule.version
      },
      new_producers: None,
      header_extensions: vec![],
    };
    let id = BlockId::new(chain_id, 0);

    let header_state = match &genesis.initial_finalizer_policy {
      Some(policy) => HeaderState::Savanna(SavannaHeaderState::savanna_genesis(
        id,
        header.clone(),
        policy.clone(),
        genesis.initial_schedule.clone(),
      )),
      None => HeaderState::Legacy(LegacyHeaderState {
        id,
        header: header.clone(),
        active_schedule: genesis.initial_schedule.clone(),
        pending_schedule: None,
        dpos_irreversible_blocknum: 0,
        producer_to_last_produced: Default::default(),
        activated_features: vec![],
      }),
    };

    let block = Arc::new(SignedBlock {
      signed_header: SignedBlockHeader {
        header,
        producer_signature: null_signature(),
      },
      transactions: vec![],
      block_extensions: vec![],
    });
    Arc::new(BlockState::new(header_state, block, vec![], true))
  }

  /// Re-executes the committed history after a restart. The chain
  /// head lands back where it was at shutdown without any peer.
  fn replay_block_log(&mut self) -> Result<(), ChainError> {
    let Some(log_head) = self.block_log.head_num().map_err(storage_err)?
    else {
      return Ok(());
    };
    info!("replaying block log through block {log_head}");
    let lookup = |_: &TransactionId| None;
    for num in 1..=log_head {
      let block = self
        .block_log
        .read_by_num(num)
        .map_err(storage_err)?
        .ok_or_else(|| ChainError::Storage(format!("missing block {num}")))?;
      self.accept_block(block)?;
      while self.apply_blocks(&mut |_| {}, &lookup)? == ApplyResult::Incomplete
      {
      }
    }
    info!("replay complete, head {}", self.head.block_num());
    Ok(())
  }

  pub fn head(&self) -> &Arc<BlockState> {
    &self.head
  }

  pub fn chain_id(&self) -> Digest {
    self.chain_id
  }

  pub fn genesis(&self) -> &Genesis {
    &self.genesis
  }

  pub fn fork_db(&self) -> Arc<RwLock<ForkDatabase>> {
    self.fork_db.clone()
  }

  pub fn block_log(&self) -> &BlockLog {
    &self.block_log
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
    self.events.subscribe()
  }

  pub fn event_sender(&self) -> broadcast::Sender<ChainEvent> {
    self.events.clone()
  }

  pub fn timer(&self) -> Arc<ExecTimer> {
    self.timer.clone()
  }

  pub fn read_mode(&self) -> ReadMode {
    self.config.read_mode
  }

  pub fn fork_db_root_num(&self) -> u32 {
    self.fork_db.read().expect("fork db lock").active().root().block_num()
  }

  pub fn fork_db_root_id(&self) -> BlockId {
    self.fork_db.read().expect("fork db lock").active().root().id()
  }

  pub fn fork_db_head_num(&self) -> u32 {
    self.fork_db.read().expect("fork db lock").active().head().block_num()
  }

  pub fn fork_db_head_id(&self) -> BlockId {
    self.fork_db.read().expect("fork db lock").active().head().id()
  }

  pub fn is_building(&self) -> bool {
    matches!(
      self.pending.as_ref().map(|p| &p.stage),
      Some(PendingStage::Building(_))
    )
  }

  pub fn set_pause_at_block(&mut self, num: Option<u32>) {
    self.pause_at_block = num;
  }

  /// Signals the running transaction (of the matching class) to bail
  /// out with an interrupt; the enclosing block aborts cleanly.
  pub fn interrupt_transaction(&self, kind: InterruptKind) {
    self.timer.interrupt(kind);
  }

  pub fn set_to_read_window(&mut self) {
    self.read_window = true;
  }

  pub fn set_to_write_window(&mut self) {
    self.read_window = false;
  }

  pub fn integrity_hash(&self) -> Digest {
    self.state.integrity_hash()
  }

  fn ensure_write_window(&self, action: &'static str) -> Result<(), ChainError> {
    if self.read_window {
      return Err(ChainError::Storage(format!(
        "cannot {action} during a read window"
      )));
    }
    Ok(())
  }

  // ---- block assembly pipeline ------------------------------------

  pub fn start_block(
    &mut self,
    params: StartBlockParams,
  ) -> Result<(), ChainError> {
    self.ensure_write_window("start a block")?;
    if self.pending.is_some() {
      return Err(ChainError::PendingBlockExists { action: "start_block" });
    }
    if let Some(limit) = self.config.terminate_at_block {
      if self.head.block_num() >= limit {
        return Err(ChainError::Storage(format!(
          "terminate-at-block {limit} reached"
        )));
      }
    }
    if self.state.revision() != self.head.block_num() as i64 {
      return Err(ChainError::RevisionMismatch {
        revision: self.state.revision(),
        head_num: self.head.block_num(),
      });
    }

    let parent = self.head.clone();
    let producer = parent
      .header_state
      .producer_schedule()
      .producer_for(params.when)
      .producer_name
      .clone();

    let session_revision = self.state.start_undo_session();

    self.clear_expired_dedup_entries(params.when);

    for digest in &params.feature_activations {
      // activation failures poison the whole block
      if let Err(e) = self.features.activate(&mut self.state, digest) {
        let _ = self.state.undo();
        return Err(ChainError::Feature(e));
      }
    }

    let mut building = BuildingBlock {
      parent,
      timestamp: params.when,
      producer,
      confirmed: params.confirm_count,
      status: params.status,
      producer_block_id: params.producer_block_id,
      new_protocol_features: params.feature_activations,
      receipts: vec![],
      action_digests: vec![],
      trx_metas: vec![],
      proposed_finalizer_policy: None,
      proposed_proposer_policy: None,
      block_deadline: params.deadline,
    };

    // the implicit onblock transaction runs first in every block
    let onblock = self.make_onblock_transaction(&building);
    let class = match params.status {
      BlockStatus::Incomplete => ExecClass::Speculative,
      _ => ExecClass::ApplyBlock,
    };
    match self.execute_transaction(&onblock, class, None, &building.timestamp)
    {
      Ok(output) => {
        building.action_digests.extend(output.action_digests);
      }
      Err(ExecFailure::Interrupted) => {
        let _ = self.state.undo();
        return Err(super::error::InterruptError.into());
      }
      Err(e) => {
        // a failed onblock is tolerated; the block just carries no
        // system actions
        warn!("onblock failed: {e:?}");
      }
    }

    self.pending = Some(PendingBlock {
      session_revision,
      stage: PendingStage::Building(building),
    });
    Ok(())
  }

  fn make_onblock_transaction(&self, building: &BuildingBlock) -> Transaction {
    #[derive(serde::Serialize)]
    struct OnblockData {
      parent_id: BlockId,
      parent_producer: String,
      slot: u32,
    }
    Transaction {
      expiration: building.timestamp.to_time_point(),
      ref_block_num: building.parent.block_num() as u16,
      authorizers: vec![],
      actions: vec![Action {
        account: "veldt".into(),
        name: "onblock".into(),
        authorizer: "veldt".into(),
        data: bincode::serialize(&OnblockData {
          parent_id: building.parent.id(),
          parent_producer: building.parent.producer().to_string(),
          slot: building.timestamp.slot(),
        })
        .expect("onblock serializes"),
      }],
    }
  }

  fn dedup_key(id: &TransactionId) -> Vec<u8> {
    let mut key = DEDUP_PREFIX.to_vec();
    key.extend_from_slice(id.as_ref());
    key
  }

  fn clear_expired_dedup_entries(&mut self, now: BlockTimestamp) {
    let now = now.to_time_point();
    let expired: Vec<Vec<u8>> = self
      .state
      .scan_prefix(DEDUP_PREFIX)
      .filter(|(_, v)| {
        v.as_slice()
          .try_into()
          .map(|bytes: [u8; 8]| TimePoint(i64::from_le_bytes(bytes)) < now)
          .unwrap_or(true)
      })
      .map(|(k, _)| k.clone())
      .collect();
    for key in expired {
      self.state.remove(&key);
    }
  }

  /// Runs a transaction in its own micro-session. On success its
  /// effects are folded into the block session; any failure leaves no
  /// trace in state.
  fn execute_transaction(
    &mut self,
    trx: &Transaction,
    class: ExecClass,
    deadline: Option<TimePoint>,
    block_time: &BlockTimestamp,
  ) -> Result<super::exec::ExecutionOutput, ExecFailure> {
    let implicit = trx.actions.iter().any(|a| a.name == "onblock");
    if !implicit {
      if trx.expiration < block_time.to_time_point() {
        return Err(ExecFailure::Objective(TransactionError::Expired(
          trx.expiration,
        )));
      }
      let key = Self::dedup_key(&trx.id());
      if self.state.get(&key).is_some() {
        return Err(ExecFailure::Objective(TransactionError::Duplicate(
          trx.id(),
        )));
      }
    }

    self.state.start_undo_session();
    if let Some(deadline) = deadline {
      self.timer.set_deadline(deadline);
    }
    let result = self.executor.execute(&mut self.state, trx, &self.timer, class);
    self.timer.clear_deadline();

    match result {
      Ok(output) => {
        if !implicit {
          self.state.put(
            Self::dedup_key(&trx.id()),
            trx.expiration.as_nanos().to_le_bytes().to_vec(),
          );
        }
        self.state.squash().expect("micro session open");
        Ok(output)
      }
      Err(e) => {
        self.state.undo().expect("micro session open");
        Err(e)
      }
    }
  }

  /// Admits one input transaction into the building block.
  pub fn push_transaction(
    &mut self,
    meta: Arc<TransactionMetadata>,
    deadline: TimePoint,
  ) -> Result<TransactionTrace, ChainError> {
    self.ensure_write_window("push a transaction")?;
    let Some(pending) = self.pending.as_mut() else {
      return Err(ChainError::NoPendingBlock { action: "push_transaction" });
    };
    let Some(building) = pending.building() else {
      return Err(ChainError::NoPendingBlock { action: "push_transaction" });
    };
    let block_num = building.parent.block_num() + 1;
    let block_time = building.timestamp;
    let status = building.status;
    let trx = meta.packed.0.transaction.clone();

    let class = match status {
      BlockStatus::Incomplete => ExecClass::Speculative,
      _ => ExecClass::ApplyBlock,
    };
    let exec_deadline = match status {
      BlockStatus::Incomplete => Some(deadline),
      // replay enforces objective limits only
      _ => None,
    };

    match self.execute_transaction(&trx, class, exec_deadline, &block_time) {
      Ok(output) => {
        let receipt = TransactionReceipt {
          status: TransactionStatus::Executed,
          cpu_usage_us: output.cpu_usage_us,
          net_usage_words: output.net_usage_words,
          trx: ReceiptTransaction::Packed(meta.packed.clone()),
        };
        let trace = TransactionTrace {
          id: meta.id,
          block_num,
          status: Some(TransactionStatus::Executed),
          cpu_usage_us: output.cpu_usage_us,
          net_usage_words: output.net_usage_words,
          action_digests: output.action_digests.clone(),
          except: None,
        };
        let building =
          self.pending.as_mut().and_then(|p| p.building()).expect("building");
        building.receipts.push(receipt);
        building.action_digests.extend(output.action_digests);
        building.trx_metas.push(meta);
        let trace = Arc::new(trace);
        let _ = self.events.send(ChainEvent::AppliedTransaction(trace.clone()));
        Ok((*trace).clone())
      }
      Err(ExecFailure::Objective(e)) => {
        // objective failure of an input transaction: rejected, block
        // continues
        Ok(TransactionTrace::failed(meta.id, block_num, e.to_string()))
      }
      Err(ExecFailure::DeadlineExceeded) => {
        if status == BlockStatus::Incomplete {
          Ok(TransactionTrace::failed(
            meta.id,
            block_num,
            "deadline exceeded".into(),
          ))
        } else {
          Err(super::error::SubjectiveError::DeadlineExceeded.into())
        }
      }
      Err(ExecFailure::Interrupted) => Err(super::error::InterruptError.into()),
    }
  }

  /// Stores a deferred transaction for later execution. Rejected once
  /// the disabling protocol feature is active.
  pub fn schedule_transaction(
    &mut self,
    trx: SignedTransaction,
  ) -> Result<TransactionId, ChainError> {
    if ProtocolFeatureSet::is_activated(&self.state, &DISABLE_DEFERRED_TRXS_FEATURE)
    {
      return Err(
        TransactionError::Execution("deferred transactions are disabled".into())
          .into(),
      );
    }
    if self.pending.is_none() {
      return Err(ChainError::NoPendingBlock { action: "schedule" });
    }
    let id = trx.transaction.id();
    let mut key = SCHEDULED_PREFIX.to_vec();
    key.extend_from_slice(id.as_ref());
    self
      .state
      .put(key, bincode::serialize(&trx).map_err(ChainError::from)?);
    Ok(id)
  }

  /// Executes a stored deferred transaction with retry-with-onerror
  /// semantics: an objective failure runs the error handler and
  /// produces a soft_fail receipt, or a hard_fail receipt if the
  /// handler fails too.
  pub fn push_scheduled_transaction(
    &mut self,
    id: TransactionId,
    _deadline: TimePoint,
  ) -> Result<TransactionTrace, ChainError> {
    self.ensure_write_window("push a scheduled transaction")?;
    if ProtocolFeatureSet::is_activated(&self.state, &DISABLE_DEFERRED_TRXS_FEATURE)
    {
      return Err(
        TransactionError::Execution("deferred transactions are disabled".into())
          .into(),
      );
    }
    let Some(pending) = self.pending.as_mut() else {
      return Err(ChainError::NoPendingBlock { action: "push_scheduled" });
    };
    let Some(building) = pending.building() else {
      return Err(ChainError::NoPendingBlock { action: "push_scheduled" });
    };
    let block_time = building.timestamp;
    let block_num = building.parent.block_num() + 1;
    let status = building.status;

    let mut key = SCHEDULED_PREFIX.to_vec();
    key.extend_from_slice(id.as_ref());
    let stored = self.state.get(&key).cloned().ok_or_else(|| {
      ChainError::Transaction(TransactionError::Execution(format!(
        "unknown scheduled transaction {id}"
      )))
    })?;
    let trx: SignedTransaction =
      bincode::deserialize(&stored).map_err(ChainError::from)?;
    self.state.remove(&key);

    let class = match status {
      BlockStatus::Incomplete => ExecClass::Speculative,
      _ => ExecClass::ApplyBlock,
    };

    let (receipt_status, output) = match self.execute_transaction(
      &trx.transaction,
      class,
      None,
      &block_time,
    ) {
      Ok(output) => (TransactionStatus::Executed, output),
      Err(ExecFailure::Interrupted) => {
        return Err(super::error::InterruptError.into())
      }
      Err(_) => {
        // retry with the error handler in place of the transaction
        let onerror = Transaction {
          expiration: trx.transaction.expiration,
          ref_block_num: trx.transaction.ref_block_num,
          authorizers: vec![],
          actions: vec![Action {
            account: "veldt".into(),
            name: "onerror".into(),
            authorizer: "veldt".into(),
            data: id.to_bytes().to_vec(),
          }],
        };
        match self.execute_transaction(&onerror, class, None, &block_time) {
          Ok(output) => (TransactionStatus::SoftFail, output),
          Err(ExecFailure::Interrupted) => {
            return Err(super::error::InterruptError.into())
          }
          Err(_) => (TransactionStatus::HardFail, Default::default()),
        }
      }
    };

    let receipt = TransactionReceipt {
      status: receipt_status,
      cpu_usage_us: output.cpu_usage_us,
      net_usage_words: output.net_usage_words,
      trx: ReceiptTransaction::Id(id),
    };
    let trace = TransactionTrace {
      id,
      block_num,
      status: Some(receipt_status),
      cpu_usage_us: output.cpu_usage_us,
      net_usage_words: output.net_usage_words,
      action_digests: output.action_digests.clone(),
      except: None,
    };
    let building =
      self.pending.as_mut().and_then(|p| p.building()).expect("building");
    building.receipts.push(receipt);
    building.action_digests.extend(output.action_digests);
    Ok(trace)
  }

  /// Queues a finalizer policy change into the block being built.
  pub fn propose_finalizer_policy(
    &mut self,
    policy: FinalizerPolicy,
  ) -> Result<(), ChainError> {
    let building = self
      .pending
      .as_mut()
      .and_then(|p| p.building())
      .ok_or(ChainError::NoPendingBlock { action: "propose policy" })?;
    building.proposed_finalizer_policy = Some(policy);
    Ok(())
  }

  pub fn propose_proposer_policy(
    &mut self,
    policy: ProposerPolicy,
  ) -> Result<(), ChainError> {
    let building = self
      .pending
      .as_mut()
      .and_then(|p| p.building())
      .ok_or(ChainError::NoPendingBlock { action: "propose policy" })?;
    building.proposed_proposer_policy = Some(policy);
    Ok(())
  }

  /// Picks the best certificate available on the parent for the next
  /// block's claim. Returns the inherited claim when nothing better
  /// aggregated.
  fn select_qc_claim(
    parent: &Arc<BlockState>,
  ) -> (QcClaim, Option<Qc>) {
    let HeaderState::Savanna(parent_state) = &parent.header_state else {
      return (QcClaim::default(), None);
    };
    let inherited = parent_state.latest_qc_claim();
    if let Some(qc) = parent.best_qc() {
      let claim = QcClaim {
        block_num: parent.block_num(),
        is_strong: qc.is_strong(&parent_state.active_finalizer_policy),
      };
      if claim.is_better_than(&inherited) {
        return (claim, Some(qc));
      }
    }
    (inherited, None)
  }

  /// Computes merkle roots, selects the QC claim, builds the header
  /// and the successor header state. With `expected` present this is
  /// the validation path and every computed quantity is compared
  /// against the received block.
  pub fn assemble_block(
    &mut self,
    expected: Option<&SignedBlock>,
  ) -> Result<(), ChainError> {
    let Some(pending) = self.pending.take() else {
      return Err(ChainError::NoPendingBlock { action: "assemble_block" });
    };
    let session_revision = pending.session_revision;
    let building = match pending.stage {
      PendingStage::Building(building) => building,
      stage => {
        self.pending = Some(PendingBlock { session_revision, stage });
        return Err(ChainError::NoPendingBlock { action: "assemble_block" });
      }
    };

    let result = self.assemble_block_impl(building, expected);
    match result {
      Ok(assembled) => {
        self.pending = Some(PendingBlock {
          session_revision,
          stage: PendingStage::Assembled(assembled),
        });
        Ok(())
      }
      Err(e) => {
        // assembly failure drops the block and its session
        let _ = self.state.undo();
        Err(e)
      }
    }
  }

  fn assemble_block_impl(
    &mut self,
    building: BuildingBlock,
    expected: Option<&SignedBlock>,
  ) -> Result<AssembledBlock, ChainError> {
    let parent = building.parent.clone();

    // classification follows the parent, not the fork database mode,
    // so that replaying the transition on a fresh node takes the same
    // paths as producing it did
    let parent_is_legacy =
      matches!(parent.header_state, HeaderState::Legacy(_));
    let savanna_genesis = parent_is_legacy
      && !parent.block.header().is_savanna()
      && ProtocolFeatureSet::is_activated(&self.state, &SAVANNA_FEATURE);
    let in_transition =
      parent_is_legacy && parent.block.header().is_savanna();
    let is_savanna_block =
      savanna_genesis || in_transition || !parent_is_legacy;

    let receipt_digests: Vec<Digest> =
      building.receipts.iter().map(|r| r.digest()).collect();
    let action_digests = building.action_digests.clone();

    // both merkle roots computed in parallel on the chain pool
    let (transaction_mroot, action_mroot_legacy) = self.pool.install(|| {
      rayon::join(
        || {
          if is_savanna_block {
            canonical_merkle(receipt_digests.clone())
          } else {
            legacy_merkle(receipt_digests.clone())
          }
        },
        || legacy_merkle(action_digests.clone()),
      )
    });
    let action_mroot_savanna = canonical_merkle(action_digests.clone());

    let mut header_extensions = vec![];
    if !building.new_protocol_features.is_empty() {
      header_extensions.push(HeaderExtension::ProtocolFeatures(
        building.new_protocol_features.clone(),
      ));
    }

    let mut qc_for_block: Option<Qc> = None;
    let mut savanna_parent_state: Option<&SavannaHeaderState> = None;

    let fork = self.fork_db.read().expect("fork db lock");
    let savanna_parent_bsp = if in_transition {
      fork
        .savanna()
        .and_then(|db| db.get_block(&parent.id(), true))
    } else {
      None
    };
    drop(fork);

    let (qc_claim, action_mroot, schedule_version) = if savanna_genesis {
      // the Savanna Genesis block claims a weak QC on itself
      let claim = QcClaim {
        block_num: parent.block_num() + 1,
        is_strong: false,
      };
      (claim, action_mroot_legacy, parent.header_state.producer_schedule().version)
    } else if in_transition {
      let bsp = savanna_parent_bsp.as_ref().ok_or(ChainError::ForkDb(
        super::error::ForkDbError::UnknownBlock { id: parent.id() },
      ))?;
      let (claim, qc) = Self::select_qc_claim(bsp);
      qc_for_block = qc;
      (claim, action_mroot_legacy, parent.header_state.producer_schedule().version)
    } else if let HeaderState::Savanna(parent_state) = &parent.header_state {
      let (claim, qc) = Self::select_qc_claim(&parent);
      qc_for_block = qc;
      savanna_parent_state = Some(parent_state);
      (claim, parent_state.next_finality_mroot(), SAVANNA_SCHEDULE_VERSION)
    } else {
      (QcClaim::default(), action_mroot_legacy, parent.header_state.producer_schedule().version)
    };

    if is_savanna_block {
      // on the validation path the received header already carries
      // the policy diffs; producing derives them from the queued
      // proposals
      let (new_finalizer_policy_diff, new_proposer_policy_diff) =
        if let Some(expected) = expected {
          let ext = expected.header().finality_extension();
          (
            ext.and_then(|e| e.new_finalizer_policy_diff.clone()),
            ext.and_then(|e| e.new_proposer_policy_diff.clone()),
          )
        } else {
          let finalizer_diff = if savanna_genesis {
            let policy = self
              .genesis
              .initial_finalizer_policy
              .clone()
              .or_else(|| building.proposed_finalizer_policy.clone())
              .ok_or_else(|| {
                ChainError::Feature(FeatureError::Unknown(*SAVANNA_FEATURE))
              })?;
            debug_assert_eq!(policy.generation, 1);
            Some(FinalizerPolicyDiff::full(
              &FinalizerPolicy {
                generation: 0,
                threshold: 0,
                finalizers: vec![],
              },
              &policy,
            ))
          } else {
            building.proposed_finalizer_policy.as_ref().map(|next| {
              let base = savanna_parent_state
                .map(|s| (*s.active_finalizer_policy).clone())
                .unwrap_or(FinalizerPolicy {
                  generation: 0,
                  threshold: 0,
                  finalizers: vec![],
                });
              FinalizerPolicyDiff::full(&base, next)
            })
          };
          let proposer_diff =
            building.proposed_proposer_policy.as_ref().map(|next| {
              super::policy::ProposerPolicyDiff::full(
                parent.header_state.producer_schedule(),
                next,
              )
            });
          (finalizer_diff, proposer_diff)
        };
      header_extensions.push(HeaderExtension::Finality(FinalityExtension {
        qc_claim,
        new_finalizer_policy_diff,
        new_proposer_policy_diff,
      }));
    }

    if expected.is_some() {
      // the received block's own certificate rides with it; nothing
      // to embed on replay
      qc_for_block = None;
    }

    let header = BlockHeader {
      timestamp: building.timestamp,
      producer: building.producer.clone(),
      confirmed: building.confirmed,
      previous: parent.id(),
      transaction_mroot,
      action_mroot,
      schedule_version,
      new_producers: None,
      header_extensions,
    };

    // validation compares the replayed header against the received
    // one field by field; merkle mismatches get their own error
    if let Some(expected) = expected {
      let received = expected.header();
      if received.transaction_mroot != header.transaction_mroot {
        return Err(
          ValidationError::MerkleMismatch {
            mroot: "transaction",
            claimed: received.transaction_mroot,
            computed: header.transaction_mroot,
          }
          .into(),
        );
      }
      if received.action_mroot != header.action_mroot {
        return Err(
          ValidationError::MerkleMismatch {
            mroot: "action",
            claimed: received.action_mroot,
            computed: header.action_mroot,
          }
          .into(),
        );
      }
    }

    // the received header (validation) or the freshly built header
    // (production) drives the successor state
    let effective_header = expected.map(|b| b.header().clone()).unwrap_or(header);

    let header_state = match &parent.header_state {
      HeaderState::Legacy(parent_legacy) => {
        HeaderState::Legacy(parent_legacy.next(&effective_header)?)
      }
      HeaderState::Savanna(parent_savanna) => {
        let ext = effective_header.finality_extension();
        HeaderState::Savanna(parent_savanna.next(SavannaNextInput {
          header: &effective_header,
          qc_claim: ext.map(|e| e.qc_claim).unwrap_or_default(),
          new_finalizer_policy: ext
            .and_then(|e| e.new_finalizer_policy_diff.as_ref())
            .map(|d| d.apply(&parent_savanna.active_finalizer_policy)),
          new_proposer_policy: ext
            .and_then(|e| e.new_proposer_policy_diff.as_ref())
            .map(|d| d.apply(&parent_savanna.active_proposer_policy.proposer_schedule)),
        })?)
      }
    };

    // the savanna twin of a transition block
    let savanna_header_state = if savanna_genesis {
      let ext =
        effective_header.finality_extension().ok_or(QcError::MissingQcExtension)?;
      let policy = ext
        .new_finalizer_policy_diff
        .as_ref()
        .map(|d| {
          d.apply(&FinalizerPolicy {
            generation: 0,
            threshold: 0,
            finalizers: vec![],
          })
        })
        .ok_or(QcError::MissingQcExtension)?;
      Some(HeaderState::Savanna(SavannaHeaderState::savanna_genesis(
        effective_header.calculate_id(),
        effective_header.clone(),
        policy,
        parent.header_state.producer_schedule().clone(),
      )))
    } else if let Some(bsp) = &savanna_parent_bsp {
      let HeaderState::Savanna(parent_savanna) = &bsp.header_state else {
        unreachable!("savanna instance holds savanna states");
      };
      let ext = effective_header.finality_extension();
      Some(HeaderState::Savanna(parent_savanna.next(SavannaNextInput {
        header: &effective_header,
        qc_claim: ext.map(|e| e.qc_claim).unwrap_or_default(),
        new_finalizer_policy: ext
          .and_then(|e| e.new_finalizer_policy_diff.as_ref())
          .map(|d| d.apply(&parent_savanna.active_finalizer_policy)),
        new_proposer_policy: ext
          .and_then(|e| e.new_proposer_policy_diff.as_ref())
          .map(|d| {
            d.apply(&parent_savanna.active_proposer_policy.proposer_schedule)
          }),
      })?))
    } else {
      None
    };

    Ok(AssembledBlock {
      parent,
      header: effective_header,
      header_state,
      savanna_header_state,
      action_mroot_savanna: Some(action_mroot_savanna),
      receipts: building.receipts,
      trx_metas: building.trx_metas,
      qc: qc_for_block,
      status: building.status,
      producer_block_id: building.producer_block_id,
    })
  }

  /// Signs the assembled header and freezes the pending block into a
  /// committable block state.
  pub fn complete_block(
    &mut self,
    signer: &dyn Fn(&Digest) -> ed25519_dalek::Signature,
  ) -> Result<Arc<BlockState>, ChainError> {
    let Some(pending) = self.pending.take() else {
      return Err(ChainError::NoPendingBlock { action: "complete_block" });
    };
    let session_revision = pending.session_revision;
    let assembled = match pending.stage {
      PendingStage::Assembled(assembled) => assembled,
      stage => {
        self.pending = Some(PendingBlock { session_revision, stage });
        return Err(ChainError::NoPendingBlock { action: "complete_block" });
      }
    };

    let producer_signature = signer(&assembled.header.digest());
    let mut block_extensions = vec![];
    if let Some(qc) = &assembled.qc {
      block_extensions
        .push(super::block::BlockExtension::QuorumCertificate(qc.clone()));
    }
    let block = Arc::new(SignedBlock {
      signed_header: SignedBlockHeader {
        header: assembled.header.clone(),
        producer_signature,
      },
      transactions: assembled.receipts.clone(),
      block_extensions,
    });

    // the id must match on the validation path
    if let Some(expected_id) = assembled.producer_block_id {
      let assembled_id = block.id();
      if assembled_id != expected_id {
        let _ = self.state.undo();
        return Err(
          ValidationError::IdMismatch {
            received: expected_id,
            assembled: assembled_id,
          }
          .into(),
        );
      }
    }

    let mut block_state = BlockState::new(
      assembled.header_state,
      block.clone(),
      assembled.trx_metas,
      true,
    );
    block_state.action_mroot_savanna = assembled.action_mroot_savanna;
    let block_state = Arc::new(block_state);

    let savanna_block_state = assembled.savanna_header_state.map(|hs| {
      let mut twin = BlockState::new(hs, block.clone(), vec![], true);
      twin.action_mroot_savanna = assembled.action_mroot_savanna;
      Arc::new(twin)
    });

    if let HeaderState::Savanna(s) = &block_state.header_state {
      block_state.set_valid_block(ValidBlock {
        finality_digest: s.finality_digest(),
        finality_mroot: s.core.finality_mroot(),
      });
    }

    self.pending = Some(PendingBlock {
      session_revision,
      stage: PendingStage::Completed(CompletedBlock {
        block_state: block_state.clone(),
        savanna_block_state,
        block,
        status: assembled.status,
      }),
    });
    Ok(block_state)
  }

  /// Production-path shorthand: assemble, sign and return the block
  /// state, leaving the pending block ready to commit.
  pub fn assemble_and_complete_block(
    &mut self,
    signer: &Keypair,
  ) -> Result<Arc<BlockState>, ChainError> {
    self.assemble_block(None)?;
    let keypair = signer.clone();
    self.complete_block(&move |digest: &Digest| {
      use ed25519_dalek::Signer;
      keypair.sign(digest.as_ref())
    })
  }

  /// Inserts the completed block into the fork database, swaps the
  /// chain head, announces it and hands it to the local finalizers.
  pub fn commit_block(&mut self) -> Result<Arc<BlockState>, ChainError> {
    self.ensure_write_window("commit a block")?;
    let Some(pending) = self.pending.take() else {
      return Err(ChainError::NoPendingBlock { action: "commit_block" });
    };
    let session_revision = pending.session_revision;
    let completed = match pending.stage {
      PendingStage::Completed(completed) => completed,
      stage => {
        self.pending = Some(PendingBlock { session_revision, stage });
        return Err(ChainError::NoPendingBlock { action: "commit_block" });
      }
    };

    let bsp = completed.block_state.clone();
    {
      let mut fork = self.fork_db.write().expect("fork db lock");
      match completed.status {
        BlockStatus::Incomplete => {
          // a freshly produced block enters the fork database here
          fork.active_mut().add(bsp.clone(), false)?;
          if let Some(twin) = &completed.savanna_block_state {
            match fork.in_use() {
              InUse::Legacy => fork.open_savanna(twin.clone()),
              InUse::Both => {
                if let Some(savanna) = fork.savanna_mut() {
                  savanna.add(twin.clone(), true)?;
                }
              }
              InUse::Savanna => {}
            }
          }
        }
        BlockStatus::Complete | BlockStatus::Irreversible => {
          // the peer path already placed it; it is now validated
          if let Some(existing) = fork.active().get_block(&bsp.id(), false) {
            existing.set_valid();
            if let Some(valid) =
              bsp.valid.lock().expect("valid lock").clone()
            {
              existing.set_valid_block(valid);
            }
          } else {
            fork.active_mut().add(bsp.clone(), true)?;
            bsp.set_valid();
          }
          // a transition block's savanna twin validates with it
          if fork.in_use() == InUse::Both {
            if let Some(twin) =
              fork.savanna().and_then(|db| db.get_block(&bsp.id(), true))
            {
              twin.set_valid();
            }
          }
        }
      }
    }

    self.head = {
      let fork = self.fork_db.read().expect("fork db lock");
      fork
        .active()
        .get_block(&bsp.id(), true)
        .unwrap_or_else(|| bsp.clone())
    };

    if self.savanna_genesis_num.is_none()
      && self.head.block.header().is_savanna()
    {
      self.savanna_genesis_num = Some(self.head.block_num());
      info!(
        "Savanna transition started at block {}",
        self.head.block_num()
      );
    }

    let _ = self.events.send(ChainEvent::AcceptedBlock(self.head.clone()));

    self.consider_voting();
    Ok(self.head.clone())
  }

  /// Drops the pending block, undoing its session, and returns the
  /// admitted transactions so the caller can requeue them.
  pub fn abort_block(&mut self) -> Vec<Arc<TransactionMetadata>> {
    match self.pending.take() {
      Some(pending) => {
        if self.state.has_sessions() {
          let _ = self.state.undo();
        }
        self.timer.clear_interrupt();
        pending.extract_trx_metas()
      }
      None => vec![],
    }
  }

  // ---- peer block admission ---------------------------------------

  /// Header-validates a received block and places it in the fork
  /// database, unexecuted. Returns what happened plus the new state.
  pub fn accept_block(
    &mut self,
    block: SignedBlock,
  ) -> Result<(AddResult, Option<Arc<BlockState>>), ChainError> {
    self.ensure_write_window("accept a block")?;
    let id = block.id();
    let header = block.header().clone();

    let mut fork = self.fork_db.write().expect("fork db lock");

    if let Some(existing) = fork.active().get_block(&id, true) {
      return Ok((AddResult::Duplicate, Some(existing)));
    }
    if id.block_num() <= fork.active().root().block_num() {
      return Ok((AddResult::Duplicate, None));
    }

    let parent = fork.active().get_block(&header.previous, true).ok_or(
      super::error::ForkDbError::UnlinkableBlock {
        id,
        previous: header.previous,
      },
    )?;

    let in_use = fork.in_use();
    if in_use != InUse::Legacy && !header.is_savanna() {
      return Err(ValidationError::LegacyAfterSavanna.into());
    }

    // slot producer and signature checks
    let schedule = parent.header_state.producer_schedule();
    let expected_producer = schedule.producer_for(header.timestamp);
    if expected_producer.producer_name != header.producer {
      return Err(
        ValidationError::BadProducerSignature { id }.into(),
      );
    }
    let check_signatures = self.config.validation_mode == ValidationMode::Full
      || self.config.force_all_checks;
    if check_signatures {
      let digest = header.digest();
      if !expected_producer
        .signing_key
        .verify(digest.as_ref(), &block.signed_header.producer_signature)
      {
        return Err(ValidationError::BadProducerSignature { id }.into());
      }
    }

    let trx_metas = vec![];
    let block = Arc::new(block);

    let (result, bsp) = match (&parent.header_state, header.finality_extension())
    {
      // plain legacy block
      (HeaderState::Legacy(parent_legacy), None) => {
        let next = parent_legacy.next(&header)?;
        let bsp = Arc::new(BlockState::new(
          HeaderState::Legacy(next),
          block.clone(),
          trx_metas,
          false,
        ));
        let result = fork.active_mut().add(bsp.clone(), true)?;
        (result, bsp)
      }

      // legacy parent carrying a finality extension: either the
      // Savanna Genesis block or a transition block
      (HeaderState::Legacy(parent_legacy), Some(ext)) => {
        let next = parent_legacy.next(&header)?;
        let bsp = Arc::new(BlockState::new(
          HeaderState::Legacy(next),
          block.clone(),
          trx_metas,
          false,
        ));

        match in_use {
          InUse::Legacy => {
            // Savanna Genesis: weak self-claim, generation-1 policy
            let expected_claim = QcClaim {
              block_num: header.block_num(),
              is_strong: false,
            };
            if ext.qc_claim != expected_claim {
              return Err(
                QcError::ClaimMismatch {
                  claim_num: ext.qc_claim.block_num,
                  claim_strong: ext.qc_claim.is_strong,
                }
                .into(),
              );
            }
            let policy = ext
              .new_finalizer_policy_diff
              .as_ref()
              .map(|d| {
                d.apply(&FinalizerPolicy {
                  generation: 0,
                  threshold: 0,
                  finalizers: vec![],
                })
              })
              .ok_or(QcError::MissingQcExtension)?;
            if policy.generation != 1 {
              return Err(QcError::BitsetMismatch.into());
            }
            let genesis_state = SavannaHeaderState::savanna_genesis(
              id,
              header.clone(),
              policy,
              parent.header_state.producer_schedule().clone(),
            );
            let twin = Arc::new(BlockState::new(
              HeaderState::Savanna(genesis_state),
              block.clone(),
              vec![],
              false,
            ));
            let result = fork.active_mut().add(bsp.clone(), true)?;
            fork.open_savanna(twin);
            (result, bsp)
          }
          InUse::Both => {
            let savanna_parent = fork
              .savanna()
              .and_then(|db| db.get_block(&header.previous, true))
              .ok_or(super::error::ForkDbError::UnlinkableBlock {
                id,
                previous: header.previous,
              })?;
            let twin_state = self.make_savanna_next(
              &savanna_parent,
              &header,
              &block,
              fork.savanna().expect("both mode has savanna"),
            )?;
            let twin = Arc::new(BlockState::new(
              HeaderState::Savanna(twin_state),
              block.clone(),
              vec![],
              false,
            ));
            let result = fork.active_mut().add(bsp.clone(), true)?;
            if let Some(savanna) = fork.savanna_mut() {
              savanna.add(twin, true)?;
            }
            (result, bsp)
          }
          InUse::Savanna => unreachable!("legacy parent under savanna"),
        }
      }

      // proper savanna
      (HeaderState::Savanna(_), Some(_)) => {
        let next = self.make_savanna_next(
          &parent,
          &header,
          &block,
          fork.active(),
        )?;
        if header.schedule_version == SAVANNA_SCHEDULE_VERSION {
          // proper savanna headers claim the finality merkle root
          let HeaderState::Savanna(parent_state) = &parent.header_state
          else {
            unreachable!()
          };
          let expected = parent_state.next_finality_mroot();
          if header.action_mroot != expected {
            return Err(
              ValidationError::MerkleMismatch {
                mroot: "finality",
                claimed: header.action_mroot,
                computed: expected,
              }
              .into(),
            );
          }
        }
        let bsp = Arc::new(BlockState::new(
          HeaderState::Savanna(next),
          block.clone(),
          trx_metas,
          false,
        ));
        let result = fork.active_mut().add(bsp.clone(), true)?;
        (result, bsp)
      }

      (HeaderState::Savanna(_), None) => {
        return Err(ValidationError::LegacyAfterSavanna.into())
      }
    };

    drop(fork);
    let _ = self
      .events
      .send(ChainEvent::AcceptedBlockHeader(bsp.clone()));
    Ok((result, Some(bsp)))
  }

  /// Builds the successor Savanna header state for a received header,
  /// enforcing the QC-claim invariants and verifying any embedded
  /// certificate against the claimed ancestor.
  fn make_savanna_next(
    &self,
    parent: &Arc<BlockState>,
    header: &BlockHeader,
    block: &Arc<SignedBlock>,
    savanna_db: &super::fork_db::ForkDb,
  ) -> Result<SavannaHeaderState, ChainError> {
    let HeaderState::Savanna(parent_state) = &parent.header_state else {
      return Err(ValidationError::LegacyAfterSavanna.into());
    };
    let ext = header
      .finality_extension()
      .ok_or(QcError::MissingQcExtension)?;
    let claim = ext.qc_claim;
    let parent_claim = parent_state.latest_qc_claim();
    let raised = claim.is_better_than(&parent_claim);
    let qc_ext = block.quorum_certificate_extension();

    match (raised, qc_ext) {
      (true, None) => return Err(QcError::MissingQcExtension.into()),
      (false, Some(_)) => return Err(QcError::UnexpectedQcExtension.into()),
      (true, Some(qc)) => {
        if qc.block_num != claim.block_num {
          return Err(
            QcError::ClaimMismatch {
              claim_num: claim.block_num,
              claim_strong: claim.is_strong,
            }
            .into(),
          );
        }
        let claimed = savanna_db
          .search_on_branch(parent.id(), claim.block_num, true)
          .or_else(|| {
            (savanna_db.root().block_num() == claim.block_num)
              .then(|| savanna_db.root().clone())
          })
          .ok_or(QcError::ClaimBeyondParent {
            claimed: claim.block_num,
            parent: parent.block_num(),
          })?;

        let verify_qc = self.config.validation_mode == ValidationMode::Full
          || self.config.force_all_checks;
        if verify_qc {
          let digests = claimed
            .vote_digests()
            .ok_or(QcError::BadSignature(claim.block_num))?;
          let HeaderState::Savanna(claimed_state) = &claimed.header_state
          else {
            return Err(QcError::BadSignature(claim.block_num).into());
          };
          let pending_policy = claimed_state
            .pending_finalizer_policy
            .as_ref()
            .map(|(_, p)| p.as_ref());
          qc.verify(
            &digests,
            &claimed_state.active_finalizer_policy,
            pending_policy,
            claim.is_strong,
          )?;
        }
        claimed.integrate_received_qc(qc);
      }
      (false, None) => {}
    }

    Ok(parent_state.next(SavannaNextInput {
      header,
      qc_claim: claim,
      new_finalizer_policy: ext
        .new_finalizer_policy_diff
        .as_ref()
        .map(|d| d.apply(&parent_state.active_finalizer_policy)),
      new_proposer_policy: ext
        .new_proposer_policy_diff
        .as_ref()
        .map(|d| d.apply(&parent_state.active_proposer_policy.proposer_schedule)),
    })?)
  }

  // ---- apply pipeline ---------------------------------------------

  /// Moves the chain head along the best branch, re-executing each
  /// block deterministically. Yields with `Incomplete` after the
  /// configured time slice.
  pub fn apply_blocks(
    &mut self,
    forked_cb: &mut dyn FnMut(Vec<Arc<TransactionMetadata>>),
    trx_lookup: &dyn Fn(&TransactionId) -> Option<Arc<TransactionMetadata>>,
  ) -> Result<ApplyResult, ChainError> {
    self.ensure_write_window("apply blocks")?;
    if self.pending.is_some() {
      return Err(ChainError::PendingBlockExists { action: "apply_blocks" });
    }

    let (target, old_head) = {
      let fork = self.fork_db.read().expect("fork db lock");
      let best = fork.active().head().clone();
      let target = match self.config.read_mode {
        ReadMode::Irreversible => {
          // only apply what can become irreversible
          let lib = self.pending_lib_num(&fork, &best);
          fork
            .active()
            .search_on_branch(best.id(), lib, true)
            .unwrap_or_else(|| self.head.clone())
        }
        _ => best,
      };
      (target, self.head.clone())
    };

    if target.id() == old_head.id() {
      self.log_irreversible()?;
      return Ok(ApplyResult::Complete);
    }

    let (apply_branch, unwind_branch) = {
      let fork = self.fork_db.read().expect("fork db lock");
      fork.active().fetch_branch_from(target.id(), old_head.id())?
    };

    // unwind the abandoned branch and hand its transactions back
    if !unwind_branch.is_empty() {
      debug!(
        "switching forks: unwinding {} block(s) from {}",
        unwind_branch.len(),
        old_head.id()
      );
      for _ in &unwind_branch {
        self.pop_block()?;
      }
      let mut metas = vec![];
      for popped in unwind_branch.iter().rev() {
        metas.extend(popped.trx_metas.iter().cloned());
      }
      forked_cb(metas);
    }

    let started = Instant::now();
    let common_ancestor = self.head.clone();

    for bsp in apply_branch.iter() {
      if let Some(limit) = self.config.terminate_at_block {
        if self.head.block_num() >= limit {
          info!("reached terminate-at-block {limit}");
          return Ok(ApplyResult::Paused);
        }
      }
      if self.pause_at_block == Some(self.head.block_num()) {
        return Ok(ApplyResult::Paused);
      }

      if let Err(e) = self.apply_block(bsp, trx_lookup) {
        error!("failed to apply block {}: {e}", bsp.id());
        // drop the bad subtree, restore the branch we came from
        {
          let mut fork = self.fork_db.write().expect("fork db lock");
          let _ = fork.active_mut().remove(bsp.id());
        }
        if self.pending.is_some() {
          self.abort_block();
        }
        // unwind the partially applied prefix
        while self.head.id() != common_ancestor.id() {
          self.pop_block()?;
        }
        // restore the branch that was known good
        for old in unwind_branch.iter().rev() {
          self.apply_block(old, trx_lookup)?;
        }
        return Err(e);
      }

      if started.elapsed() > self.config.apply_time_slice {
        return Ok(ApplyResult::Incomplete);
      }
    }

    self.log_irreversible()?;
    Ok(ApplyResult::Complete)
  }

  /// Re-executes a single received block and commits it. Any
  /// divergence from the received receipts, merkle roots or id is a
  /// validation failure.
  fn apply_block(
    &mut self,
    bsp: &Arc<BlockState>,
    trx_lookup: &dyn Fn(&TransactionId) -> Option<Arc<TransactionMetadata>>,
  ) -> Result<(), ChainError> {
    let block = bsp.block.clone();
    let header = block.header();
    let status = if self
      .block_log
      .head_num()
      .map_err(storage_err)?
      .map(|head| bsp.block_num() <= head)
      .unwrap_or(false)
    {
      BlockStatus::Irreversible
    } else {
      BlockStatus::Complete
    };

    self.start_block(StartBlockParams {
      when: header.timestamp,
      confirm_count: header.confirmed,
      feature_activations: header.protocol_features().to_vec(),
      status,
      producer_block_id: Some(bsp.id()),
      deadline: TimePoint::now() + Duration::from_secs(60),
    })?;

    let result = (|| -> Result<(), ChainError> {
      for (index, receipt) in block.transactions.iter().enumerate() {
        let trace = match &receipt.trx {
          ReceiptTransaction::Packed(packed) => {
            let meta = match trx_lookup(&packed.id()) {
              Some(meta) if !meta.recovered_keys.is_empty() => meta,
              _ => self.recover_keys_pooled(packed.clone())?,
            };
            self.push_transaction(
              meta,
              TimePoint::now() + Duration::from_secs(60),
            )?
          }
          // bare ids are scheduled transactions; their bodies live in
          // chain state
          ReceiptTransaction::Id(id) => self.push_scheduled_transaction(
            *id,
            TimePoint::now() + Duration::from_secs(60),
          )?,
        };
        if trace.except.is_some() {
          return Err(ValidationError::ReceiptMismatch { index }.into());
        }

        // replayed usage must match the producer's receipt exactly
        let replayed = self
          .pending
          .as_ref()
          .and_then(|p| match &p.stage {
            PendingStage::Building(b) => b.receipts.last(),
            _ => None,
          })
          .ok_or(ValidationError::ReceiptMismatch { index })?;
        if replayed.status != receipt.status
          || replayed.cpu_usage_us != receipt.cpu_usage_us
          || replayed.net_usage_words != receipt.net_usage_words
        {
          return Err(ValidationError::ReceiptMismatch { index }.into());
        }
      }

      self.assemble_block(Some(&block))?;

      // adopt the producer's signature; completion re-derives the id
      // and compares it against the received block
      let signature = block.signed_header.producer_signature;
      self.complete_block(&move |_digest: &Digest| signature)?;
      self.commit_block()?;
      Ok(())
    })();

    if let Err(e) = result {
      if self.pending.is_some() {
        self.abort_block();
      }
      return Err(e);
    }
    Ok(())
  }

  /// Verifies a transaction's signatures on the chain pool and
  /// returns the cached metadata.
  pub fn recover_keys_pooled(
    &self,
    packed: PackedTransaction,
  ) -> Result<Arc<TransactionMetadata>, ChainError> {
    let chain_id = self.chain_id;
    self
      .pool
      .install(|| TransactionMetadata::recover_keys(packed, &chain_id))
      .map_err(ChainError::Transaction)
  }

  /// Rewinds the chain head by one block, undoing its state session.
  fn pop_block(&mut self) -> Result<(), ChainError> {
    let previous = {
      let fork = self.fork_db.read().expect("fork db lock");
      fork
        .active()
        .get_block(&self.head.previous(), true)
        .ok_or(super::error::ForkDbError::UnknownBlock {
          id: self.head.previous(),
        })?
    };
    let rolled_back = self.head.block.header().protocol_features().to_vec();
    if !rolled_back.is_empty() {
      debug!(
        "rolling back {} protocol feature activation(s) with block {}",
        rolled_back.len(),
        self.head.id()
      );
    }
    self
      .state
      .undo()
      .map_err(|e| ChainError::Storage(e.to_string()))?;
    self.head = previous;
    Ok(())
  }

  // ---- irreversibility --------------------------------------------

  fn pending_lib_num(
    &self,
    fork: &ForkDatabase,
    best: &Arc<BlockState>,
  ) -> u32 {
    match fork.in_use() {
      InUse::Legacy | InUse::Both => {
        best.header_state.irreversible_blocknum()
      }
      InUse::Savanna => {
        let from_claims = best.header_state.irreversible_blocknum();
        let from_votes = fork
          .savanna()
          .and_then(|db| db.pending_savanna_lib_num())
          .unwrap_or(0);
        from_claims.max(from_votes)
      }
    }
  }

  /// Walks the head branch down to the new irreversibility frontier,
  /// appending to the block log, committing state sessions and
  /// advancing the fork database root. Timeboxed.
  pub fn log_irreversible(&mut self) -> Result<(), ChainError> {
    let started = Instant::now();

    let (lib_num, root_num) = {
      let fork = self.fork_db.read().expect("fork db lock");
      let head_state = fork
        .active()
        .get_block(&self.head.id(), true)
        .unwrap_or_else(|| self.head.clone());
      (
        self.pending_lib_num(&fork, &head_state),
        fork.active().root().block_num(),
      )
    };
    // never beyond what has actually been applied
    let lib_num = lib_num.min(self.head.block_num());
    if lib_num <= root_num {
      return Ok(());
    }

    let branch: Vec<Arc<BlockState>> = {
      let fork = self.fork_db.read().expect("fork db lock");
      let mut blocks = fork.active().fetch_branch(self.head.id(), None);
      blocks.retain(|b| b.block_num() <= lib_num);
      blocks.reverse();
      blocks
    };

    let mut new_root: Option<BlockId> = None;
    let log_head = self.block_log.head_num().map_err(storage_err)?;
    for bsp in &branch {
      if log_head.map(|h| bsp.block_num() > h).unwrap_or(true) {
        self.block_log.append(&bsp.block).map_err(storage_err)?;
      }
      self
        .state
        .commit(bsp.block_num() as i64)
        .map_err(|e| ChainError::Storage(e.to_string()))?;
      let _ = self
        .events
        .send(ChainEvent::IrreversibleBlock(bsp.clone()));
      new_root = Some(bsp.id());

      if started.elapsed() > self.config.apply_time_slice {
        break;
      }
    }

    if let Some(new_root) = new_root {
      let mut fork = self.fork_db.write().expect("fork db lock");
      fork.active_mut().advance_root(new_root)?;
      if fork.in_use() == InUse::Both {
        if let Some(savanna) = fork.savanna_mut() {
          if savanna.contains(&new_root)
            && savanna.root().id() != new_root
          {
            savanna.advance_root(new_root)?;
          }
        }
      }
    }

    // the transition completes when the Savanna Genesis block becomes
    // irreversible
    if let Some(genesis_num) = self.savanna_genesis_num {
      let in_use = self.fork_db.read().expect("fork db lock").in_use();
      if in_use == InUse::Both
        && new_root.map(|r| r.block_num() >= genesis_num).unwrap_or(false)
      {
        self.transition_to_savanna()?;
      }
    }
    Ok(())
  }

  /// Completes the Legacy-to-Savanna migration: the legacy fork
  /// database instance is discarded, the chain head moves to its
  /// Savanna twin and every local finalizer is reset to lock on the
  /// transition block with an empty last vote.
  fn transition_to_savanna(&mut self) -> Result<(), ChainError> {
    let genesis_num =
      self.savanna_genesis_num.expect("transition in flight");
    let mut fork = self.fork_db.write().expect("fork db lock");
    let savanna = fork.savanna().expect("both mode has savanna");

    let transition_ref = savanna
      .search_on_branch(savanna.head().id(), genesis_num, true)
      .map(|b| b.block_ref())
      .unwrap_or_else(|| savanna.root().block_ref());

    let new_head = savanna
      .get_block(&self.head.id(), true)
      .ok_or(super::error::ForkDbError::RootMismatch)?;

    fork.discard_legacy();
    drop(fork);

    self.head = new_head;
    self
      .finalizers
      .reset_at_transition(transition_ref)
      .map_err(|e| ChainError::Storage(e.to_string()))?;
    info!("Savanna transition complete at block {genesis_num}");
    Ok(())
  }

  // ---- voting -----------------------------------------------------

  /// Lets every local finalizer consider voting on the newly
  /// committed head block.
  fn consider_voting(&mut self) {
    if self.finalizers.is_empty() {
      return;
    }

    let fork = self.fork_db.read().expect("fork db lock");
    // during the transition votes go to the savanna twin
    let bsp = match fork.in_use() {
      InUse::Savanna => Some(self.head.clone()),
      InUse::Both => fork
        .savanna()
        .and_then(|db| db.get_block(&self.head.id(), true)),
      InUse::Legacy => None,
    };
    let Some(bsp) = bsp else {
      return;
    };
    let HeaderState::Savanna(state) = &bsp.header_state else {
      return;
    };

    // only recent blocks get votes
    let age = TimePoint::now()
      .elapsed_since(bsp.timestamp().to_time_point());
    if age > self.config.vote_recency {
      return;
    }

    // the claimed ancestor must be known and validated
    let claim = state.latest_qc_claim();
    let savanna_db = match fork.in_use() {
      InUse::Savanna => fork.active(),
      _ => fork.savanna().expect("savanna instance"),
    };
    let claimed = savanna_db
      .search_on_branch(bsp.id(), claim.block_num, true)
      .or_else(|| {
        (savanna_db.root().block_num() == claim.block_num)
          .then(|| savanna_db.root().clone())
      });
    let Some(claimed) = claimed else {
      return;
    };
    if !claimed.is_valid() && claimed.id() != bsp.id() {
      return;
    }

    let Some(digests) = bsp.vote_digests() else {
      return;
    };
    let policy = state.active_finalizer_policy.clone();
    let block_ref = bsp.block_ref();
    let claimed_ref = claimed.block_ref();
    let claimed_timestamp = claimed.timestamp();

    let mut votes = vec![];
    for keypair in self.finalizers.keys().to_vec() {
      let key = keypair.public().clone();
      let Some(index) = policy.index_of(&key) else {
        continue;
      };
      let extends_lock = self
        .finalizers
        .record(&key)
        .lock
        .map(|lock| savanna_db.is_descendant_of(lock.block_id, bsp.id()))
        .unwrap_or(false);
      let decision = self.finalizers.decide_vote(
        &key,
        &block_ref,
        extends_lock,
        claimed_timestamp,
      );
      if decision == VoteDecision::NoVote {
        continue;
      }
      let strong = decision == VoteDecision::Strong;
      let digest = if strong { digests.strong } else { digests.weak };
      let sig = keypair.sign(digest.as_ref());
      votes.push((key, index as u16, strong, sig, decision));
    }
    drop(fork);

    for (key, index, strong, sig, decision) in votes {
      // the safety record hits disk before the vote is released
      if let Err(e) = self.finalizers.record_vote(
        &key,
        block_ref.clone(),
        decision,
        strong.then(|| claimed_ref.clone()),
      ) {
        error!("failed to persist finalizer safety info: {e}");
        continue;
      }

      // self-aggregate, then announce
      let status = bsp.with_aggregating_qc(|agg| {
        agg.add_vote(index, strong, sig.clone())
      });
      if status == Some(VoteStatus::QuorumReached) {
        let _ = self.events.send(ChainEvent::AggregatedVote {
          block_id: bsp.id(),
          strong,
        });
      }
      let _ = self.events.send(ChainEvent::VotedBlock(VoteMessage {
        block_id: bsp.id(),
        strong,
        finalizer_key: key,
        sig,
      }));
    }
  }

  // ---- snapshots --------------------------------------------------

  pub fn write_snapshot(&self, path: &Path) -> Result<(), ChainError> {
    if self.pending.is_some() {
      return Err(ChainError::PendingBlockExists { action: "snapshot" });
    }
    let snapshot = Snapshot {
      genesis: self.genesis.clone(),
      head_state: self.head.header_state.clone(),
      head_block: (*self.head.block).clone(),
      state_entries: self.state.export(),
    };
    write_snapshot(path, self.chain_id, &snapshot).map_err(storage_err)
  }

  /// Boots a fresh node from a snapshot. The block log restarts at
  /// the snapshot block; history before it is not available locally.
  pub fn from_snapshot(
    path: &Path,
    config: Config,
    executor: Arc<dyn TransactionExecutor>,
    finalizer_keys: Vec<crate::primitives::BlsKeypair>,
  ) -> Result<Self, ChainError> {
    let snapshot = read_snapshot(path, None).map_err(storage_err)?;
    let chain_id = snapshot.genesis.chain_id();

    let block_log = match &config.blocks_dir {
      Some(dir) => BlockLog::open(dir).map_err(storage_err)?,
      None => BlockLog::temporary().map_err(storage_err)?,
    };
    block_log.reset().map_err(storage_err)?;

    let finalizers =
      LocalFinalizers::new(finalizer_keys, config.finalizers_dir.clone())
        .map_err(|e| ChainError::Storage(e.to_string()))?;
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(config.chain_thread_pool_size)
      .build()
      .map_err(|e| ChainError::Storage(e.to_string()))?;
    let (events, _) = broadcast::channel(1024);

    let head = Arc::new(BlockState::new(
      snapshot.head_state,
      Arc::new(snapshot.head_block),
      vec![],
      true,
    ));
    let head_num = head.block_num();

    let fork_db = match &head.header_state {
      HeaderState::Savanna(_) => ForkDatabase::new_savanna(head.clone()),
      HeaderState::Legacy(_) => ForkDatabase::new_legacy(head.clone()),
    };

    let mut state = StateStore::new();
    state
      .import(snapshot.state_entries, head_num as i64)
      .map_err(|e| ChainError::Storage(e.to_string()))?;

    let savanna_genesis_num = match &head.header_state {
      HeaderState::Savanna(_) => Some(head_num),
      HeaderState::Legacy(_) => None,
    };

    let mut finalizers = finalizers;
    if let HeaderState::Savanna(_) = &head.header_state {
      finalizers
        .ensure_locked(head.block_ref())
        .map_err(|e| ChainError::Storage(e.to_string()))?;
    }

    Ok(Self {
      genesis: snapshot.genesis,
      chain_id,
      config,
      state,
      block_log,
      fork_db: Arc::new(RwLock::new(fork_db)),
      head,
      pending: None,
      features: ProtocolFeatureSet::with_builtins(),
      executor,
      timer: Arc::new(ExecTimer::default()),
      pool,
      events,
      finalizers,
      read_window: false,
      pause_at_block: None,
      savanna_genesis_num,
    })
  }
}

fn storage_err(e: crate::storage::StorageError) -> ChainError {
  ChainError::Storage(e.to_string())
}

/// The genesis block carries no usable producer signature.
pub fn null_signature() -> ed25519_dalek::Signature {
  ed25519_dalek::Signature::from_bytes(&[0u8; 64]).expect("zero signature parses")
}

/// Convenience map-based transaction lookup for callers that cache
/// metas by id.
pub fn lookup_in(
  cache: &HashMap<TransactionId, Arc<TransactionMetadata>>,
) -> impl Fn(&TransactionId) -> Option<Arc<TransactionMetadata>> + '_ {
  move |id| cache.get(id).cloned()
}
