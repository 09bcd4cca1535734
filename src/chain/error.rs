use {
  crate::primitives::{BlockId, Digest},
  thiserror::Error,
};

/// Structural violations inside the fork database. These abort the
/// current operation and are never the peer's fault when raised from
/// local state transitions.
#[derive(Debug, Error)]
pub enum ForkDbError {
  #[error("unlinkable block {id}: parent {previous} not in fork database")]
  UnlinkableBlock { id: BlockId, previous: BlockId },

  #[error("block {id} not found in fork database")]
  UnknownBlock { id: BlockId },

  #[error("block {id} already present in fork database")]
  DuplicateBlock { id: BlockId },

  #[error("advance_root target {id} is not a descendant of the current root")]
  OrphanedRoot { id: BlockId },

  #[error("fork database root does not match the block log head")]
  RootMismatch,

  #[error("block {id} has height {num}, expected {expected}")]
  HeightMismatch { id: BlockId, num: u32, expected: u32 },
}

/// Why a block failed header or full validation.
#[derive(Debug, Error)]
pub enum ValidationError {
  #[error("{mroot} merkle root mismatch: header claims {claimed}, computed {computed}")]
  MerkleMismatch {
    mroot: &'static str,
    claimed: Digest,
    computed: Digest,
  },

  #[error("block id mismatch: received {received}, assembled {assembled}")]
  IdMismatch { received: BlockId, assembled: BlockId },

  #[error("transaction receipt #{index} does not match replayed execution")]
  ReceiptMismatch { index: usize },

  #[error("invalid producer signature on block {id}")]
  BadProducerSignature { id: BlockId },

  #[error("block timestamp must be greater than its parent's")]
  NonMonotonicTimestamp,

  #[error("a legacy block may not follow a Savanna block")]
  LegacyAfterSavanna,

  #[error("{0}")]
  Qc(#[from] QcError),
}

/// QC admission failures. A peer sending a block that trips one of
/// these gets closed.
#[derive(Debug, Error)]
pub enum QcError {
  #[error("qc_claim for block {claimed} is ahead of parent block {parent}")]
  ClaimBeyondParent { claimed: u32, parent: u32 },

  #[error("qc_claim regresses below the parent's claim")]
  ClaimRegression,

  #[error(
    "block raises its qc_claim but carries no quorum certificate extension"
  )]
  MissingQcExtension,

  #[error("block carries a quorum certificate extension without raising its qc_claim")]
  UnexpectedQcExtension,

  #[error("quorum certificate does not match the claim {claim_num} strong={claim_strong}")]
  ClaimMismatch { claim_num: u32, claim_strong: bool },

  #[error("aggregate signature verification failed for qc on block {0}")]
  BadSignature(u32),

  #[error("qc vote weight below the policy threshold")]
  InsufficientWeight,

  #[error("qc bitset size does not match the finalizer policy")]
  BitsetMismatch,
}

/// Protocol feature activation failures; blocks carrying them are
/// rejected outright.
#[derive(Debug, Error)]
pub enum FeatureError {
  #[error("unknown protocol feature digest {0}")]
  Unknown(Digest),

  #[error("protocol feature {0} already activated")]
  Duplicate(Digest),

  #[error("protocol feature {feature} requires unactivated dependency {missing}")]
  UnmetDependency { feature: Digest, missing: Digest },
}

/// Objective transaction failures are deterministic across all nodes:
/// they produce a hard_fail receipt for scheduled transactions and an
/// outright rejection for input transactions.
#[derive(Debug, Error)]
pub enum TransactionError {
  #[error("transaction expired at {0}")]
  Expired(crate::primitives::TimePoint),

  #[error("duplicate transaction {0}")]
  Duplicate(Digest),

  #[error("authorization failure: {0}")]
  Authorization(String),

  #[error("resource limit exceeded: {0}")]
  ResourceExhausted(String),

  #[error("execution failure: {0}")]
  Execution(String),
}

/// Subjective failures only the producing node observes; the
/// transaction is dropped and the block continues.
#[derive(Debug, Error)]
pub enum SubjectiveError {
  #[error("transaction deadline exceeded")]
  DeadlineExceeded,

  #[error("block cpu budget exhausted")]
  BlockCpuExhausted,
}

/// Interruption requested via `interrupt_transaction`. Aborts the
/// pending block without closing peers or advancing state.
#[derive(Debug, Error)]
#[error("transaction interrupted")]
pub struct InterruptError;

/// The controller's composite error surface; the variant decides the
/// propagation policy per the taxonomy (abort block, reject block,
/// drop transaction, close peer, shutdown).
#[derive(Debug, Error)]
pub enum ChainError {
  #[error(transparent)]
  ForkDb(#[from] ForkDbError),

  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error(transparent)]
  Feature(#[from] FeatureError),

  #[error(transparent)]
  Transaction(#[from] TransactionError),

  #[error(transparent)]
  Subjective(#[from] SubjectiveError),

  #[error(transparent)]
  Interrupt(#[from] InterruptError),

  #[error("cannot {action}: a pending block already exists")]
  PendingBlockExists { action: &'static str },

  #[error("cannot {action}: no pending block")]
  NoPendingBlock { action: &'static str },

  #[error("state revision {revision} does not match head block {head_num}")]
  RevisionMismatch { revision: i64, head_num: u32 },

  #[error("storage failure: {0}")]
  Storage(String),

  #[error("resource exhaustion: {0}")]
  ResourceExhaustion(String),
}

impl ChainError {
  /// Errors that poison the process rather than a single operation.
  pub fn is_fatal(&self) -> bool {
    matches!(self, ChainError::ResourceExhaustion(_))
  }

  /// Errors caused by bad wire input; the peer that sent it is closed.
  pub fn close_peer(&self) -> bool {
    matches!(
      self,
      ChainError::Validation(ValidationError::Qc(_))
        | ChainError::Validation(ValidationError::BadProducerSignature { .. })
    )
  }
}

impl From<sled::Error> for ChainError {
  fn from(e: sled::Error) -> Self {
    ChainError::Storage(e.to_string())
  }
}

impl From<bincode::Error> for ChainError {
  fn from(e: bincode::Error) -> Self {
    ChainError::Storage(e.to_string())
  }
}

impl From<QcError> for ChainError {
  fn from(e: QcError) -> Self {
    ChainError::Validation(ValidationError::Qc(e))
  }
}
