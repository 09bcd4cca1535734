//! Immutable per-block snapshots of consensus state.
//!
//! A header state is everything needed to validate the next header:
//! producer schedules, finalizer policies, the finality core and the
//! irreversibility bookkeeping. Legacy and Savanna keep different
//! bookkeeping, so the two live as variants of one tagged union and
//! every consumer dispatches through [`HeaderState`].

use {
  super::{
    error::{QcError, ValidationError},
    header::{BlockHeader, SAVANNA_SCHEDULE_VERSION},
    policy::{FinalizerPolicy, ProducerSchedule, ProposerPolicy},
    qc::QcClaim,
  },
  crate::primitives::{
    canonical_merkle,
    AccountName,
    BlockId,
    BlockTimestamp,
    Digest,
  },
  serde::{Deserialize, Serialize},
  std::{collections::BTreeMap, collections::VecDeque, sync::Arc},
};

/// A compact reference to an ancestor block, enough for vote safety
/// records and the finality merkle tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
  pub block_id: BlockId,
  pub timestamp: BlockTimestamp,
  pub finality_digest: Digest,
}

impl BlockRef {
  pub fn block_num(&self) -> u32 {
    self.block_id.block_num()
  }
}

/// One block's QC claim, kept as a link from the claiming block to the
/// claimed block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcLink {
  pub source_block_num: u32,
  pub target_block_num: u32,
  pub is_link_strong: bool,
}

/// The finality core implements the two-chain rule over QC claims.
///
/// Each block contributes exactly one link (its own claim), so the
/// link list indexes by consecutive source block number. A strong QC
/// on block B finalizes the target of the link of B's claim target:
/// two chained strong links are the two-chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityCore {
  links: VecDeque<QcLink>,
  refs: VecDeque<BlockRef>,
  pub final_on_strong_qc_block_num: u32,
  pub last_final_block_num: u32,
}

impl FinalityCore {
  /// Core of the Savanna Genesis block: it claims a weak QC on itself
  /// and is its own finality frontier.
  pub fn genesis(genesis_num: u32) -> Self {
    Self {
      links: VecDeque::from([QcLink {
        source_block_num: genesis_num,
        target_block_num: genesis_num,
        is_link_strong: false,
      }]),
      refs: VecDeque::new(),
      final_on_strong_qc_block_num: genesis_num,
      last_final_block_num: genesis_num,
    }
  }

  pub fn current_block_num(&self) -> u32 {
    self.links.back().expect("core always has links").source_block_num
  }

  pub fn latest_qc_claim(&self) -> QcClaim {
    let link = self.links.back().expect("core always has links");
    QcClaim {
      block_num: link.target_block_num,
      is_strong: link.is_link_strong,
    }
  }

  fn get_link(&self, block_num: u32) -> Option<&QcLink> {
    let first = self.links.front()?.source_block_num;
    self
      .links
      .get(block_num.checked_sub(first)? as usize)
      .filter(|l| l.source_block_num == block_num)
  }

  /// The block that becomes final if a strong QC forms on
  /// `block_num`. Used when aggregated votes reach quorum before any
  /// descendant block embeds the certificate.
  pub fn final_on_strong_qc_of(&self, block_num: u32) -> Option<u32> {
    self.get_link(block_num).map(|l| l.target_block_num).and_then(|t| {
      self.get_link(t).map(|l| l.target_block_num)
    })
  }

  /// Ancestor refs newer than the last final block, oldest first.
  pub fn refs(&self) -> impl Iterator<Item = &BlockRef> {
    self.refs.iter()
  }

  /// The merkle root over ancestor finality digests that the next
  /// block must claim in its `action_mroot` field.
  pub fn finality_mroot(&self) -> Digest {
    canonical_merkle(self.refs.iter().map(|r| r.finality_digest).collect())
  }

  /// Advances the core across one block. `parent_ref` is the ref of
  /// the block owning `self`; `claim` is the new block's QC claim.
  pub fn next(
    &self,
    parent_ref: BlockRef,
    claim: QcClaim,
  ) -> Result<FinalityCore, QcError> {
    let parent_num = self.current_block_num();
    if claim.block_num > parent_num {
      return Err(QcError::ClaimBeyondParent {
        claimed: claim.block_num,
        parent: parent_num,
      });
    }
    let prior = self.latest_qc_claim();
    if (claim.block_num, claim.is_strong)
      < (prior.block_num, prior.is_strong)
    {
      return Err(QcError::ClaimRegression);
    }

    let mut next = self.clone();
    next.refs.push_back(parent_ref);
    next.links.push_back(QcLink {
      source_block_num: parent_num + 1,
      target_block_num: claim.block_num,
      is_link_strong: claim.is_strong,
    });

    if claim.is_strong {
      // strong claim on C proves a strong QC on C; that finalizes the
      // target of C's own claim
      if let Some(link) = next.get_link(claim.block_num) {
        let new_final_on_strong = link.target_block_num;
        next.final_on_strong_qc_block_num = next
          .final_on_strong_qc_block_num
          .max(new_final_on_strong);
        if let Some(final_link) = next.get_link(new_final_on_strong) {
          next.last_final_block_num =
            next.last_final_block_num.max(final_link.target_block_num);
        }
      }
    }

    // drop bookkeeping below the finality frontier
    while let Some(front) = next.links.front() {
      if front.source_block_num < next.last_final_block_num {
        next.links.pop_front();
      } else {
        break;
      }
    }
    while let Some(front) = next.refs.front() {
      if front.block_num() < next.last_final_block_num {
        next.refs.pop_front();
      } else {
        break;
      }
    }

    Ok(next)
  }
}

/// Fraction of producers whose confirmation makes a legacy block
/// irreversible: floor(2n/3) + 1.
fn dpos_threshold(n: usize) -> usize {
  n * 2 / 3 + 1
}

/// Consensus snapshot of a pre-transition block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyHeaderState {
  pub id: BlockId,
  pub header: BlockHeader,
  pub active_schedule: ProducerSchedule,
  /// Schedule proposed via `new_producers`, with the block that
  /// proposed it. Activates when that block becomes irreversible.
  pub pending_schedule: Option<(u32, ProducerSchedule)>,
  pub dpos_irreversible_blocknum: u32,
  /// Last block each producer signed; irreversibility is the
  /// 2/3+1-th highest of these.
  pub producer_to_last_produced: BTreeMap<AccountName, u32>,
  pub activated_features: Vec<Digest>,
}

impl LegacyHeaderState {
  pub fn block_num(&self) -> u32 {
    self.id.block_num()
  }

  fn compute_dpos_irreversible(&self) -> u32 {
    let mut produced: Vec<u32> =
      self.producer_to_last_produced.values().copied().collect();
    let threshold = dpos_threshold(self.active_schedule.producers.len());
    if produced.len() < threshold {
      return self.dpos_irreversible_blocknum;
    }
    produced.sort_unstable_by(|a, b| b.cmp(a));
    produced[threshold - 1].max(self.dpos_irreversible_blocknum)
  }

  /// Validates a child header against this state and produces the
  /// child's header state.
  pub fn next(
    &self,
    header: &BlockHeader,
  ) -> Result<LegacyHeaderState, ValidationError> {
    if header.timestamp <= self.header.timestamp {
      return Err(ValidationError::NonMonotonicTimestamp);
    }

    let mut next = self.clone();
    next.header = header.clone();
    next.id = header.calculate_id();

    // an in-flight schedule becomes active once the proposing block
    // is irreversible
    if let Some((proposed_at, schedule)) = &self.pending_schedule {
      if self.dpos_irreversible_blocknum >= *proposed_at {
        next.active_schedule = schedule.clone();
        next.pending_schedule = None;
        next.producer_to_last_produced.retain(|name, _| {
          next.active_schedule.get(name).is_some()
        });
      }
    }

    if let Some(new_producers) = &header.new_producers {
      if next.pending_schedule.is_none() {
        next.pending_schedule =
          Some((header.block_num(), new_producers.clone()));
      }
    }

    next
      .producer_to_last_produced
      .insert(header.producer.clone(), header.block_num());
    next.dpos_irreversible_blocknum = next.compute_dpos_irreversible();

    Ok(next)
  }
}

/// Consensus snapshot of a transition or proper Savanna block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavannaHeaderState {
  pub id: BlockId,
  pub header: BlockHeader,
  pub active_finalizer_policy: Arc<FinalizerPolicy>,
  /// (block at which it became pending, policy). Activates when that
  /// block becomes final.
  pub pending_finalizer_policy: Option<(u32, Arc<FinalizerPolicy>)>,
  /// (proposing block, policy) pairs not yet claimed by a QC,
  /// ascending by block.
  pub proposed_finalizer_policies: Vec<(u32, Arc<FinalizerPolicy>)>,
  pub active_proposer_policy: Arc<ProposerPolicy>,
  pub latest_proposed_proposer_policy: Option<Arc<ProposerPolicy>>,
  pub core: FinalityCore,
}

/// Everything a Savanna child block carries that shapes its header
/// state.
pub struct SavannaNextInput<'a> {
  pub header: &'a BlockHeader,
  pub qc_claim: QcClaim,
  pub new_finalizer_policy: Option<FinalizerPolicy>,
  pub new_proposer_policy: Option<ProposerPolicy>,
}

impl SavannaHeaderState {
  pub fn block_num(&self) -> u32 {
    self.id.block_num()
  }

  pub fn timestamp(&self) -> BlockTimestamp {
    self.header.timestamp
  }

  pub fn latest_qc_claim(&self) -> QcClaim {
    self.core.latest_qc_claim()
  }

  /// This block's leaf in the finality merkle tree.
  pub fn finality_digest(&self) -> Digest {
    #[derive(Serialize)]
    struct Leaf<'a> {
      block_num: u32,
      id: &'a BlockId,
      timestamp: BlockTimestamp,
      final_on_strong_qc_block_num: u32,
      active_policy_generation: u32,
    }
    Digest::hash(
      bincode::serialize(&Leaf {
        block_num: self.block_num(),
        id: &self.id,
        timestamp: self.header.timestamp,
        final_on_strong_qc_block_num: self.core.final_on_strong_qc_block_num,
        active_policy_generation: self.active_finalizer_policy.generation,
      })
      .expect("leaf serializes"),
    )
  }

  pub fn block_ref(&self) -> BlockRef {
    BlockRef {
      block_id: self.id,
      timestamp: self.header.timestamp,
      finality_digest: self.finality_digest(),
    }
  }

  /// The finality merkle root the next block must claim.
  pub fn next_finality_mroot(&self) -> Digest {
    let mut refs: Vec<Digest> =
      self.core.refs().map(|r| r.finality_digest).collect();
    refs.push(self.finality_digest());
    canonical_merkle(refs)
  }

  /// Validates a child header against this state and produces the
  /// child's header state. Structural QC-claim admission happens
  /// here; cryptographic verification of an embedded certificate is
  /// the controller's job because it needs the claimed ancestor.
  pub fn next(
    &self,
    input: SavannaNextInput<'_>,
  ) -> Result<SavannaHeaderState, ValidationError> {
    let header = input.header;
    if header.timestamp <= self.header.timestamp {
      return Err(ValidationError::NonMonotonicTimestamp);
    }

    let core = self.core.next(self.block_ref(), input.qc_claim)?;

    let mut next = SavannaHeaderState {
      id: header.calculate_id(),
      header: header.clone(),
      active_finalizer_policy: self.active_finalizer_policy.clone(),
      pending_finalizer_policy: self.pending_finalizer_policy.clone(),
      proposed_finalizer_policies: self.proposed_finalizer_policies.clone(),
      active_proposer_policy: self.active_proposer_policy.clone(),
      latest_proposed_proposer_policy: self
        .latest_proposed_proposer_policy
        .clone(),
      core,
    };

    // pending -> active once the block where it became pending is
    // final
    if let Some((pending_since, policy)) = &next.pending_finalizer_policy {
      if next.core.last_final_block_num >= *pending_since {
        next.active_finalizer_policy = policy.clone();
        next.pending_finalizer_policy = None;
      }
    }

    // latest claimed proposal -> pending; earlier proposals are
    // superseded
    if next.pending_finalizer_policy.is_none() {
      let claimed = input.qc_claim.block_num;
      if let Some(position) = next
        .proposed_finalizer_policies
        .iter()
        .rposition(|(proposed_at, _)| *proposed_at <= claimed)
      {
        let (_, policy) = next.proposed_finalizer_policies[position].clone();
        next.pending_finalizer_policy =
          Some((header.block_num(), policy));
        next.proposed_finalizer_policies.drain(..=position);
      }
    }

    if let Some(policy) = input.new_finalizer_policy {
      next
        .proposed_finalizer_policies
        .push((header.block_num(), Arc::new(policy)));
    }

    // proposer policies switch on their activation slot
    if let Some(proposed) = &next.latest_proposed_proposer_policy {
      if header.timestamp >= proposed.active_time {
        next.active_proposer_policy = proposed.clone();
        next.latest_proposed_proposer_policy = None;
      }
    }
    if let Some(policy) = input.new_proposer_policy {
      next.latest_proposed_proposer_policy = Some(Arc::new(policy));
    }

    Ok(next)
  }

  /// The Savanna Genesis state, grafted onto a legacy block that
  /// first carries a finality extension. Its policy must have
  /// generation 1 and its claim is a weak self-claim.
  pub fn savanna_genesis(
    id: BlockId,
    header: BlockHeader,
    finalizer_policy: FinalizerPolicy,
    proposer_schedule: ProducerSchedule,
  ) -> Self {
    debug_assert_eq!(finalizer_policy.generation, 1);
    Self {
      id,
      core: FinalityCore::genesis(id.block_num()),
      active_finalizer_policy: Arc::new(finalizer_policy),
      pending_finalizer_policy: None,
      proposed_finalizer_policies: vec![],
      active_proposer_policy: Arc::new(ProposerPolicy {
        active_time: header.timestamp,
        proposer_schedule,
      }),
      latest_proposed_proposer_policy: None,
      header,
    }
  }
}

/// The regime-polymorphic header state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HeaderState {
  Legacy(LegacyHeaderState),
  Savanna(SavannaHeaderState),
}

impl HeaderState {
  pub fn id(&self) -> BlockId {
    match self {
      HeaderState::Legacy(s) => s.id,
      HeaderState::Savanna(s) => s.id,
    }
  }

  pub fn block_num(&self) -> u32 {
    self.id().block_num()
  }

  pub fn header(&self) -> &BlockHeader {
    match self {
      HeaderState::Legacy(s) => &s.header,
      HeaderState::Savanna(s) => &s.header,
    }
  }

  pub fn timestamp(&self) -> BlockTimestamp {
    self.header().timestamp
  }

  pub fn producer(&self) -> &AccountName {
    &self.header().producer
  }

  pub fn previous(&self) -> BlockId {
    self.header().previous
  }

  pub fn is_legacy(&self) -> bool {
    matches!(self, HeaderState::Legacy(_))
  }

  pub fn is_proper_savanna(&self) -> bool {
    matches!(self, HeaderState::Savanna(s)
      if s.header.schedule_version == SAVANNA_SCHEDULE_VERSION)
  }

  pub fn latest_qc_claim(&self) -> Option<QcClaim> {
    match self {
      HeaderState::Legacy(_) => None,
      HeaderState::Savanna(s) => Some(s.latest_qc_claim()),
    }
  }

  /// The irreversibility this state implies on its own, before any
  /// aggregated votes are taken into account.
  pub fn irreversible_blocknum(&self) -> u32 {
    match self {
      HeaderState::Legacy(s) => s.dpos_irreversible_blocknum,
      HeaderState::Savanna(s) => s.core.last_final_block_num,
    }
  }

  pub fn producer_schedule(&self) -> &ProducerSchedule {
    match self {
      HeaderState::Legacy(s) => &s.active_schedule,
      HeaderState::Savanna(s) => &s.active_proposer_policy.proposer_schedule,
    }
  }

  pub fn active_finalizer_policy(&self) -> Option<&Arc<FinalizerPolicy>> {
    match self {
      HeaderState::Legacy(_) => None,
      HeaderState::Savanna(s) => Some(&s.active_finalizer_policy),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn make_ref(num: u32) -> BlockRef {
    BlockRef {
      block_id: BlockId::new(Digest::hash(num.to_le_bytes()), num),
      timestamp: BlockTimestamp(num),
      finality_digest: Digest::hash(num.to_be_bytes()),
    }
  }

  fn strong(block_num: u32) -> QcClaim {
    QcClaim { block_num, is_strong: true }
  }

  #[test]
  fn two_chain_rule_advances_finality() {
    // genesis at 10; tight strong claims thereafter
    let mut core = FinalityCore::genesis(10);
    assert_eq!(core.last_final_block_num, 10);

    // block 11 claims weak genesis self-claim (cannot do strong yet)
    core = core
      .next(make_ref(10), QcClaim { block_num: 10, is_strong: false })
      .unwrap();
    assert_eq!(core.current_block_num(), 11);
    assert_eq!(core.last_final_block_num, 10);

    // block 12 claims strong on 11
    core = core.next(make_ref(11), strong(11)).unwrap();
    assert_eq!(core.last_final_block_num, 10);

    // block 13 claims strong on 12: strong QC on 12, whose link
    // targets 11, whose link targets 10 -> final advances along the
    // two-chain
    core = core.next(make_ref(12), strong(12)).unwrap();
    assert_eq!(core.final_on_strong_qc_block_num, 11);
    assert_eq!(core.last_final_block_num, 10);

    core = core.next(make_ref(13), strong(13)).unwrap();
    assert_eq!(core.final_on_strong_qc_block_num, 12);
    assert_eq!(core.last_final_block_num, 11);
  }

  #[test]
  fn claim_beyond_parent_rejected() {
    let core = FinalityCore::genesis(5);
    let err = core.next(make_ref(5), strong(6)).unwrap_err();
    assert!(matches!(err, QcError::ClaimBeyondParent { .. }));
  }

  #[test]
  fn claim_regression_rejected() {
    let mut core = FinalityCore::genesis(5);
    core = core.next(make_ref(5), strong(5)).unwrap();
    core = core.next(make_ref(6), strong(6)).unwrap();
    // next block may not claim less than strong@6
    let err = core
      .next(make_ref(7), QcClaim { block_num: 5, is_strong: true })
      .unwrap_err();
    assert!(matches!(err, QcError::ClaimRegression));
  }

  #[test]
  fn final_on_strong_of_tracks_vote_driven_quorums() {
    let mut core = FinalityCore::genesis(1);
    core = core.next(make_ref(1), strong(1)).unwrap();
    core = core.next(make_ref(2), strong(2)).unwrap();
    core = core.next(make_ref(3), strong(3)).unwrap();
    // a strong quorum of votes forming directly on block 4 finalizes
    // the target of the chained links: 4 claims 3, 3 claims 2
    assert_eq!(core.final_on_strong_qc_of(4), Some(2));
  }

  #[test]
  fn dpos_irreversibility_needs_two_thirds_plus_one() {
    use crate::chain::policy::ProducerAuthority;
    let schedule = ProducerSchedule {
      version: 1,
      producers: ["a", "b", "c", "d"]
        .iter()
        .map(|n| ProducerAuthority {
          producer_name: (*n).into(),
          signing_key: crate::primitives::Pubkey::default(),
        })
        .collect(),
    };

    let genesis_header = BlockHeader {
      timestamp: BlockTimestamp(1),
      producer: "a".into(),
      confirmed: 0,
      previous: BlockId::default(),
      transaction_mroot: Digest::default(),
      action_mroot: Digest::default(),
      schedule_version: 1,
      new_producers: None,
      header_extensions: vec![],
    };
    let mut state = LegacyHeaderState {
      id: genesis_header.calculate_id(),
      header: genesis_header,
      active_schedule: schedule,
      pending_schedule: None,
      dpos_irreversible_blocknum: 0,
      producer_to_last_produced: BTreeMap::new(),
      activated_features: vec![],
    };

    // 4 producers -> threshold 3; blocks by a, b leave lib at 0
    for (i, producer) in ["a", "b"].iter().enumerate() {
      let header = BlockHeader {
        timestamp: BlockTimestamp(2 + i as u32),
        producer: (*producer).into(),
        previous: state.id,
        ..state.header.clone()
      };
      state = state.next(&header).unwrap();
    }
    assert_eq!(state.dpos_irreversible_blocknum, 0);

    // third distinct producer: 3rd highest last-produced becomes lib
    let header = BlockHeader {
      timestamp: BlockTimestamp(10),
      producer: "c".into(),
      previous: state.id,
      ..state.header.clone()
    };
    state = state.next(&header).unwrap();
    assert_eq!(state.dpos_irreversible_blocknum, 2);
  }
}
