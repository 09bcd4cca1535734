use {
  super::{
    block::{SignedBlock, TransactionMetadata},
    header_state::{BlockRef, HeaderState},
    qc::{AggregatingQc, Qc, QcClaim, VoteDigests},
  },
  crate::primitives::{AccountName, BlockId, BlockTimestamp, Digest},
  std::{
    cmp::Ordering,
    sync::{
      atomic::{AtomicBool, Ordering as AtomicOrdering},
      Arc,
      Mutex,
    },
  },
};

/// Finality data attached to a block once it has been fully applied:
/// its leaf and root in the finality merkle tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidBlock {
  pub finality_digest: Digest,
  pub finality_mroot: Digest,
}

/// A node of the fork database.
///
/// Created on header validation (peer path) or assembly (producer
/// path). After creation only four things ever change: the `validated`
/// flag flips to true, the `valid` leaf is attached after apply,
/// incoming votes aggregate into `aggregating_qc`, and a completed
/// certificate may be memoized in `received_qc`.
#[derive(Debug)]
pub struct BlockState {
  pub header_state: HeaderState,
  pub block: Arc<SignedBlock>,
  pub trx_metas: Vec<Arc<TransactionMetadata>>,
  validated: AtomicBool,
  /// Cached Savanna-shape action mroot for legacy blocks while the
  /// transition is in flight.
  pub action_mroot_savanna: Option<Digest>,
  pub valid: Mutex<Option<ValidBlock>>,
  aggregating_qc: Mutex<Option<AggregatingQc>>,
  /// Best certificate known for this block, whether aggregated
  /// locally or received inside a descendant block.
  received_qc: Mutex<Option<Qc>>,
}

impl BlockState {
  pub fn new(
    header_state: HeaderState,
    block: Arc<SignedBlock>,
    trx_metas: Vec<Arc<TransactionMetadata>>,
    validated: bool,
  ) -> Self {
    let aggregating_qc = match &header_state {
      HeaderState::Savanna(s) => {
        let digests = VoteDigests::compute(
          s.id,
          s.next_finality_mroot(),
          &s.active_finalizer_policy,
        );
        Some(AggregatingQc::new(
          s.block_num(),
          digests,
          &s.active_finalizer_policy,
        ))
      }
      HeaderState::Legacy(_) => None,
    };
    Self {
      header_state,
      block,
      trx_metas,
      validated: AtomicBool::new(validated),
      action_mroot_savanna: None,
      valid: Mutex::new(None),
      aggregating_qc: Mutex::new(aggregating_qc),
      received_qc: Mutex::new(None),
    }
  }

  pub fn id(&self) -> BlockId {
    self.header_state.id()
  }

  pub fn block_num(&self) -> u32 {
    self.header_state.block_num()
  }

  pub fn previous(&self) -> BlockId {
    self.header_state.previous()
  }

  pub fn timestamp(&self) -> BlockTimestamp {
    self.header_state.timestamp()
  }

  pub fn producer(&self) -> &AccountName {
    self.header_state.producer()
  }

  pub fn is_valid(&self) -> bool {
    self.validated.load(AtomicOrdering::Acquire)
  }

  pub fn set_valid(&self) {
    self.validated.store(true, AtomicOrdering::Release);
  }

  pub fn latest_qc_claim(&self) -> Option<QcClaim> {
    self.header_state.latest_qc_claim()
  }

  /// The vote digests finalizers sign for this block, if it is a
  /// Savanna block.
  pub fn vote_digests(&self) -> Option<VoteDigests> {
    self
      .aggregating_qc
      .lock()
      .expect("aggregating_qc lock")
      .as_ref()
      .map(|agg| *agg.digests())
  }

  /// Runs `f` under the per-block aggregation lock. Returns `None`
  /// for legacy blocks, which have no vote aggregation.
  pub fn with_aggregating_qc<R>(
    &self,
    f: impl FnOnce(&mut AggregatingQc) -> R,
  ) -> Option<R> {
    let mut guard = self.aggregating_qc.lock().expect("aggregating_qc lock");
    guard.as_mut().map(f)
  }

  /// The best known certificate on this block: a vote-aggregated one
  /// beats a received one only by strength.
  pub fn best_qc(&self) -> Option<Qc> {
    let aggregated = self
      .with_aggregating_qc(|agg| agg.best_qc())
      .flatten();
    let received =
      self.received_qc.lock().expect("received_qc lock").clone();
    match (aggregated, received) {
      (Some(a), Some(r)) => {
        // prefer the one with more strong weight
        if a.strong_votes.count() >= r.strong_votes.count() {
          Some(a)
        } else {
          Some(r)
        }
      }
      (a, r) => a.or(r),
    }
  }

  /// A strong quorum exists from locally aggregated votes.
  pub fn has_strong_vote_quorum(&self) -> bool {
    self
      .with_aggregating_qc(|agg| agg.has_strong_quorum())
      .unwrap_or(false)
  }

  /// Memoizes a certificate carried by a descendant block.
  pub fn integrate_received_qc(&self, qc: &Qc) {
    let mut guard = self.received_qc.lock().expect("received_qc lock");
    let better = match guard.as_ref() {
      None => true,
      Some(existing) => {
        qc.strong_votes.count() > existing.strong_votes.count()
      }
    };
    if better {
      *guard = Some(qc.clone());
    }
  }

  pub fn set_valid_block(&self, valid: ValidBlock) {
    *self.valid.lock().expect("valid lock") = Some(valid);
  }

  pub fn block_ref(&self) -> BlockRef {
    match &self.header_state {
      HeaderState::Savanna(s) => s.block_ref(),
      HeaderState::Legacy(l) => BlockRef {
        block_id: l.id,
        timestamp: l.header.timestamp,
        finality_digest: Digest::default(),
      },
    }
  }

  /// Best-head ordering. Savanna ranks by claim height and strength,
  /// then prefers the earlier timestamp, breaking ties by id. Legacy
  /// ranks by implied irreversibility, then height, then timestamp,
  /// then producer and id.
  pub fn compare_heads(a: &BlockState, b: &BlockState) -> Ordering {
    match (&a.header_state, &b.header_state) {
      (HeaderState::Savanna(sa), HeaderState::Savanna(sb)) => {
        let claim_a = sa.latest_qc_claim();
        let claim_b = sb.latest_qc_claim();
        (claim_a.block_num, claim_a.is_strong)
          .cmp(&(claim_b.block_num, claim_b.is_strong))
          .then_with(|| {
            // lower timestamp wins among equal claims
            b.timestamp().cmp(&a.timestamp())
          })
          .then_with(|| a.id().cmp(&b.id()))
      }
      (HeaderState::Legacy(la), HeaderState::Legacy(lb)) => la
        .dpos_irreversible_blocknum
        .cmp(&lb.dpos_irreversible_blocknum)
        .then_with(|| a.block_num().cmp(&b.block_num()))
        .then_with(|| a.timestamp().cmp(&b.timestamp()))
        .then_with(|| a.producer().cmp(b.producer()))
        .then_with(|| a.id().cmp(&b.id()))
      ,
      // during the transition savanna states outrank legacy ones
      (HeaderState::Savanna(_), HeaderState::Legacy(_)) => Ordering::Greater,
      (HeaderState::Legacy(_), HeaderState::Savanna(_)) => Ordering::Less,
    }
  }
}
