//! Quorum certificates and per-block vote aggregation.

use {
  super::{error::QcError, policy::FinalizerPolicy},
  crate::primitives::{BlockId, BlsPubkey, BlsSignature, Digest},
  serde::{Deserialize, Serialize},
  std::fmt::{Debug, Formatter},
};

/// The claim a block header makes about the best known QC on one of
/// its ancestors.
#[derive(
  Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize,
)]
pub struct QcClaim {
  pub block_num: u32,
  pub is_strong: bool,
}

impl QcClaim {
  /// Claims are ordered by block number first, then strength. A block
  /// may only ever raise its parent's claim.
  pub fn is_better_than(&self, other: &QcClaim) -> bool {
    (self.block_num, self.is_strong) > (other.block_num, other.is_strong)
  }
}

/// The two digests a finalizer may sign over a block. A strong vote
/// commits to the block unconditionally; a weak vote only witnesses
/// liveness.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VoteDigests {
  pub strong: Digest,
  pub weak: Digest,
}

impl VoteDigests {
  pub fn compute(block_id: BlockId, finality_mroot: Digest, policy: &FinalizerPolicy) -> Self {
    let mut strong_preimage = Vec::with_capacity(1 + 32 + 32 + 32);
    strong_preimage.push(0x01u8);
    strong_preimage.extend_from_slice(block_id.as_ref());
    strong_preimage.extend_from_slice(finality_mroot.as_ref());
    strong_preimage.extend_from_slice(policy.digest().as_ref());
    let strong = Digest::hash(&strong_preimage);

    let mut weak_preimage = Vec::with_capacity(1 + 32);
    weak_preimage.push(0x00u8);
    weak_preimage.extend_from_slice(strong.as_ref());
    let weak = Digest::hash(&weak_preimage);

    Self { strong, weak }
  }
}

/// Finalizer membership bitset indexing into a policy's finalizer
/// list.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteBitset {
  len: u16,
  words: Vec<u64>,
}

impl VoteBitset {
  pub fn new(len: u16) -> Self {
    Self {
      len,
      words: vec![0; (len as usize + 63) / 64],
    }
  }

  pub fn len(&self) -> u16 {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.words.iter().all(|w| *w == 0)
  }

  pub fn set(&mut self, index: u16) {
    debug_assert!(index < self.len);
    self.words[index as usize / 64] |= 1 << (index % 64);
  }

  pub fn get(&self, index: u16) -> bool {
    index < self.len
      && self.words[index as usize / 64] & (1 << (index % 64)) != 0
  }

  pub fn iter_set(&self) -> impl Iterator<Item = u16> + '_ {
    (0..self.len).filter(|i| self.get(*i))
  }

  pub fn count(&self) -> usize {
    self.words.iter().map(|w| w.count_ones() as usize).sum()
  }
}

impl Debug for VoteBitset {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "VoteBitset[")?;
    for i in self.iter_set() {
      write!(f, "{i} ")?;
    }
    write!(f, "]")
  }
}

/// A completed quorum certificate on a block: who voted strong, who
/// voted weak, and one aggregate BLS signature over both groups'
/// respective digests.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Qc {
  pub block_num: u32,
  pub strong_votes: VoteBitset,
  pub weak_votes: VoteBitset,
  pub signature: BlsSignature,
}

impl Qc {
  /// A QC is strong when the strong voters alone meet the threshold.
  /// Weak voters only count toward the weaker liveness quorum.
  pub fn is_strong(&self, policy: &FinalizerPolicy) -> bool {
    self.weight_of(&self.strong_votes, policy) >= policy.threshold
  }

  fn weight_of(&self, bitset: &VoteBitset, policy: &FinalizerPolicy) -> u64 {
    bitset
      .iter_set()
      .filter_map(|i| policy.finalizers.get(i as usize))
      .map(|f| f.weight)
      .sum()
  }

  /// Full verification against the active (and, if present, pending)
  /// policy: bitset sizes, weights, and the aggregate signature over
  /// the strong/weak digests.
  pub fn verify(
    &self,
    digests: &VoteDigests,
    active: &FinalizerPolicy,
    pending: Option<&FinalizerPolicy>,
    require_strong: bool,
  ) -> Result<(), QcError> {
    let expected_len = active.finalizers.len() as u16;
    if self.strong_votes.len() != expected_len
      || self.weak_votes.len() != expected_len
    {
      return Err(QcError::BitsetMismatch);
    }

    let strong_weight = self.weight_of(&self.strong_votes, active);
    let weak_weight = self.weight_of(&self.weak_votes, active);
    let reached = if require_strong {
      strong_weight >= active.threshold
        && pending.map_or(true, |p| {
          // strength must hold under both policies mid-transition
          self.weight_of(&self.strong_votes, p) >= p.threshold
        })
    } else {
      strong_weight + weak_weight >= active.threshold
    };
    if !reached {
      return Err(QcError::InsufficientWeight);
    }

    let strong_keys: Vec<&BlsPubkey> = self
      .strong_votes
      .iter_set()
      .filter_map(|i| active.finalizers.get(i as usize))
      .map(|f| &f.public_key)
      .collect();
    let weak_keys: Vec<&BlsPubkey> = self
      .weak_votes
      .iter_set()
      .filter_map(|i| active.finalizers.get(i as usize))
      .map(|f| &f.public_key)
      .collect();

    let verified = match (strong_keys.is_empty(), weak_keys.is_empty()) {
      (false, true) => {
        self.signature.verify_aggregate(digests.strong.as_ref(), &strong_keys)
      }
      (true, false) => {
        self.signature.verify_aggregate(digests.weak.as_ref(), &weak_keys)
      }
      (false, false) => self.signature.verify_aggregate_split(
        digests.strong.as_ref(),
        &strong_keys,
        digests.weak.as_ref(),
        &weak_keys,
      ),
      (true, true) => false,
    };
    if !verified {
      return Err(QcError::BadSignature(self.block_num));
    }
    Ok(())
  }
}

/// A finalizer's vote on a block, as signed and shipped to peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteMessage {
  pub block_id: BlockId,
  pub strong: bool,
  pub finalizer_key: BlsPubkey,
  pub sig: BlsSignature,
}

/// Outcome of feeding one vote into the per-block aggregator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VoteStatus {
  /// Vote accepted; quorum not yet reached.
  Added,
  /// Vote accepted and it completed the quorum.
  QuorumReached,
  /// Finalizer already voted on this block.
  Duplicate,
  /// The key is not part of the active policy.
  UnknownFinalizer,
  /// Bad signature over the vote digest.
  InvalidSignature,
}

/// Accumulates finalizer votes on a single block until the active
/// policy's threshold is crossed, then freezes into a [`Qc`].
#[derive(Clone, Debug)]
pub struct AggregatingQc {
  block_num: u32,
  digests: VoteDigests,
  policy_threshold: u64,
  strong_votes: VoteBitset,
  weak_votes: VoteBitset,
  strong_weight: u64,
  weak_weight: u64,
  signatures: Vec<BlsSignature>,
  weights: Vec<u64>,
  completed: Option<Qc>,
}

impl AggregatingQc {
  pub fn new(
    block_num: u32,
    digests: VoteDigests,
    policy: &FinalizerPolicy,
  ) -> Self {
    let len = policy.finalizers.len() as u16;
    Self {
      block_num,
      digests,
      policy_threshold: policy.threshold,
      strong_votes: VoteBitset::new(len),
      weak_votes: VoteBitset::new(len),
      strong_weight: 0,
      weak_weight: 0,
      signatures: vec![],
      weights: policy.finalizers.iter().map(|f| f.weight).collect(),
      completed: None,
    }
  }

  pub fn digests(&self) -> &VoteDigests {
    &self.digests
  }

  /// Adds a pre-verified vote. Signature verification happens on the
  /// vote thread pool before this is called; aggregation itself is
  /// cheap and runs under the block state's lock.
  pub fn add_vote(
    &mut self,
    index: u16,
    strong: bool,
    signature: BlsSignature,
  ) -> VoteStatus {
    if index as usize >= self.weights.len() {
      return VoteStatus::UnknownFinalizer;
    }
    if self.strong_votes.get(index) || self.weak_votes.get(index) {
      return VoteStatus::Duplicate;
    }

    let weight = self.weights[index as usize];
    if strong {
      self.strong_votes.set(index);
      self.strong_weight += weight;
    } else {
      self.weak_votes.set(index);
      self.weak_weight += weight;
    }
    self.signatures.push(signature);

    let had_quorum = self.completed.is_some();
    if !had_quorum && self.strong_weight + self.weak_weight >= self.policy_threshold
    {
      match BlsSignature::aggregate(&self.signatures) {
        Ok(signature) => {
          self.completed = Some(Qc {
            block_num: self.block_num,
            strong_votes: self.strong_votes.clone(),
            weak_votes: self.weak_votes.clone(),
            signature,
          });
          return VoteStatus::QuorumReached;
        }
        Err(_) => return VoteStatus::InvalidSignature,
      }
    }

    // a strong quorum forming after a weak one upgrades the completed qc
    if had_quorum && self.strong_weight >= self.policy_threshold {
      if let Ok(signature) = BlsSignature::aggregate(&self.signatures) {
        let upgraded = self
          .completed
          .as_ref()
          .map(|qc| {
            self
              .weight_of(&self.strong_votes)
              .saturating_sub(self.weight_of(&qc.strong_votes))
              > 0
          })
          .unwrap_or(false);
        if upgraded {
          self.completed = Some(Qc {
            block_num: self.block_num,
            strong_votes: self.strong_votes.clone(),
            weak_votes: self.weak_votes.clone(),
            signature,
          });
          return VoteStatus::QuorumReached;
        }
      }
    }
    VoteStatus::Added
  }

  fn weight_of(&self, bitset: &VoteBitset) -> u64 {
    bitset
      .iter_set()
      .map(|i| self.weights[i as usize])
      .sum()
  }

  pub fn has_quorum(&self) -> bool {
    self.completed.is_some()
  }

  pub fn has_strong_quorum(&self) -> bool {
    self.strong_weight >= self.policy_threshold
  }

  /// The best certificate aggregated so far, if any quorum formed.
  pub fn best_qc(&self) -> Option<Qc> {
    self.completed.clone()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::{BlsKeypair, Digest},
  };

  fn policy_of(keys: &[BlsKeypair], threshold: u64) -> FinalizerPolicy {
    FinalizerPolicy {
      generation: 1,
      threshold,
      finalizers: keys
        .iter()
        .enumerate()
        .map(|(i, k)| super::super::policy::FinalizerAuthority {
          description: format!("fin-{i}"),
          weight: 1,
          public_key: k.public().clone(),
        })
        .collect(),
    }
  }

  fn digests() -> VoteDigests {
    VoteDigests {
      strong: Digest::hash(b"strong"),
      weak: Digest::hash(b"weak"),
    }
  }

  #[test]
  fn bitset_set_get_count() {
    let mut bits = VoteBitset::new(130);
    bits.set(0);
    bits.set(64);
    bits.set(129);
    assert!(bits.get(0) && bits.get(64) && bits.get(129));
    assert!(!bits.get(1));
    assert_eq!(bits.count(), 3);
    assert_eq!(bits.iter_set().collect::<Vec<_>>(), vec![0, 64, 129]);
  }

  #[test]
  fn quorum_crossing_emits_once() {
    let mut rng = rand::thread_rng();
    let keys: Vec<_> =
      (0..4).map(|_| BlsKeypair::generate(&mut rng)).collect();
    let policy = policy_of(&keys, 3);
    let digests = digests();

    let mut agg = AggregatingQc::new(100, digests, &policy);
    let strong = digests.strong;

    assert_eq!(
      agg.add_vote(0, true, keys[0].sign(strong.as_ref())),
      VoteStatus::Added
    );
    assert_eq!(
      agg.add_vote(0, true, keys[0].sign(strong.as_ref())),
      VoteStatus::Duplicate
    );
    assert_eq!(
      agg.add_vote(1, true, keys[1].sign(strong.as_ref())),
      VoteStatus::Added
    );
    assert_eq!(
      agg.add_vote(2, true, keys[2].sign(strong.as_ref())),
      VoteStatus::QuorumReached
    );

    let qc = agg.best_qc().unwrap();
    assert!(qc.is_strong(&policy));
    assert_eq!(qc.strong_votes.count(), 3);
    assert!(qc.verify(&digests, &policy, None, true).is_ok());
  }

  #[test]
  fn weak_votes_never_make_a_strong_qc() {
    let mut rng = rand::thread_rng();
    let keys: Vec<_> =
      (0..4).map(|_| BlsKeypair::generate(&mut rng)).collect();
    let policy = policy_of(&keys, 3);
    let digests = digests();

    let mut agg = AggregatingQc::new(7, digests, &policy);
    agg.add_vote(0, true, keys[0].sign(digests.strong.as_ref()));
    agg.add_vote(1, false, keys[1].sign(digests.weak.as_ref()));
    let status = agg.add_vote(2, false, keys[2].sign(digests.weak.as_ref()));
    assert_eq!(status, VoteStatus::QuorumReached);

    let qc = agg.best_qc().unwrap();
    assert!(!qc.is_strong(&policy));
    assert!(qc.verify(&digests, &policy, None, true).is_err());
    assert!(qc.verify(&digests, &policy, None, false).is_ok());
  }

  #[test]
  fn unknown_index_rejected() {
    let mut rng = rand::thread_rng();
    let keys: Vec<_> =
      (0..2).map(|_| BlsKeypair::generate(&mut rng)).collect();
    let policy = policy_of(&keys, 2);
    let digests = digests();
    let mut agg = AggregatingQc::new(1, digests, &policy);
    assert_eq!(
      agg.add_vote(9, true, keys[0].sign(digests.strong.as_ref())),
      VoteStatus::UnknownFinalizer
    );
  }
}
