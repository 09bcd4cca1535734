//! The block lifecycle engine: headers and blocks, per-block
//! consensus snapshots, the fork database, the pending-block
//! pipeline, the controller, vote aggregation and finalizer safety.

pub mod block;
pub mod block_state;
pub mod controller;
pub mod error;
pub mod exec;
pub mod features;
pub mod fork_db;
pub mod genesis;
pub mod header;
pub mod header_state;
pub mod pending;
pub mod policy;
pub mod qc;
pub mod safety;
pub mod votes;

pub use {
  block::{
    Action,
    PackedTransaction,
    SignedBlock,
    SignedTransaction,
    Transaction,
    TransactionMetadata,
    TransactionReceipt,
    TransactionStatus,
  },
  block_state::BlockState,
  controller::{
    ApplyResult,
    ChainEvent,
    Config,
    Controller,
    ReadMode,
    StartBlockParams,
    ValidationMode,
  },
  error::ChainError,
  exec::{ExecTimer, InterruptKind, KvExecutor, TransactionExecutor},
  fork_db::{AddResult, ForkDatabase, InUse},
  genesis::Genesis,
  header::{BlockHeader, FinalityExtension, HeaderExtension},
  header_state::{BlockRef, HeaderState},
  pending::BlockStatus,
  policy::{
    FinalizerAuthority,
    FinalizerPolicy,
    ProducerAuthority,
    ProducerSchedule,
    ProposerPolicy,
  },
  qc::{Qc, QcClaim, VoteMessage},
  safety::LocalFinalizers,
  votes::{VoteOutcome, VoteProcessor},
};
