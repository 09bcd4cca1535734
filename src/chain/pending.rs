//! The block under construction.
//!
//! A pending block moves through three stages. `Building` accumulates
//! transaction receipts and action digests; `Assembled` has its
//! merkle roots, header and successor header state computed; and
//! `Completed` is a signed block ready to commit. The same stages
//! serve both production and validation; validation carries the
//! received block along for comparison.

use {
  super::{
    block::{SignedBlock, TransactionMetadata, TransactionReceipt},
    block_state::BlockState,
    header::BlockHeader,
    header_state::HeaderState,
    policy::{FinalizerPolicy, ProposerPolicy},
    qc::Qc,
  },
  crate::primitives::{
    AccountName,
    BlockId,
    BlockTimestamp,
    Digest,
    TimePoint,
  },
  std::sync::Arc,
};

/// How the block being worked on entered the pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockStatus {
  /// Produced locally; not yet complete.
  Incomplete,
  /// Received from a peer and being validated.
  Complete,
  /// Replayed from the block log; already irreversible.
  Irreversible,
}

#[derive(Debug)]
pub struct BuildingBlock {
  pub parent: Arc<BlockState>,
  pub timestamp: BlockTimestamp,
  pub producer: AccountName,
  pub confirmed: u16,
  pub status: BlockStatus,
  /// Id of the received block when validating; `None` when producing.
  pub producer_block_id: Option<BlockId>,
  pub new_protocol_features: Vec<Digest>,
  pub receipts: Vec<TransactionReceipt>,
  pub action_digests: Vec<Digest>,
  pub trx_metas: Vec<Arc<TransactionMetadata>>,
  pub proposed_finalizer_policy: Option<FinalizerPolicy>,
  pub proposed_proposer_policy: Option<ProposerPolicy>,
  pub block_deadline: TimePoint,
}

#[derive(Debug)]
pub struct AssembledBlock {
  pub parent: Arc<BlockState>,
  pub header: BlockHeader,
  pub header_state: HeaderState,
  /// Savanna header state riding along with a legacy one while the
  /// transition keeps both fork database instances populated.
  pub savanna_header_state: Option<HeaderState>,
  pub action_mroot_savanna: Option<Digest>,
  pub receipts: Vec<TransactionReceipt>,
  pub trx_metas: Vec<Arc<TransactionMetadata>>,
  pub qc: Option<Qc>,
  pub status: BlockStatus,
  pub producer_block_id: Option<BlockId>,
}

#[derive(Debug)]
pub struct CompletedBlock {
  pub block_state: Arc<BlockState>,
  /// The savanna twin of a transition block, destined for the
  /// savanna fork database instance.
  pub savanna_block_state: Option<Arc<BlockState>>,
  pub block: Arc<SignedBlock>,
  pub status: BlockStatus,
}

#[derive(Debug)]
pub enum PendingStage {
  Building(BuildingBlock),
  Assembled(AssembledBlock),
  Completed(CompletedBlock),
}

/// The pending block plus the undo session that scopes its state
/// effects.
#[derive(Debug)]
pub struct PendingBlock {
  pub session_revision: i64,
  pub stage: PendingStage,
}

impl PendingBlock {
  pub fn status(&self) -> BlockStatus {
    match &self.stage {
      PendingStage::Building(b) => b.status,
      PendingStage::Assembled(a) => a.status,
      PendingStage::Completed(c) => c.status,
    }
  }

  pub fn building(&mut self) -> Option<&mut BuildingBlock> {
    match &mut self.stage {
      PendingStage::Building(b) => Some(b),
      _ => None,
    }
  }

  /// Transaction metas of everything admitted so far, for requeueing
  /// after an abort.
  pub fn extract_trx_metas(self) -> Vec<Arc<TransactionMetadata>> {
    match self.stage {
      PendingStage::Building(b) => b.trx_metas,
      PendingStage::Assembled(a) => a.trx_metas,
      PendingStage::Completed(c) => c.block_state.trx_metas.clone(),
    }
  }
}
