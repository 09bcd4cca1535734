//! Finalizer and proposer policies and the header-carried diffs that
//! evolve them.
//!
//! A policy moves through three stages: proposed (carried as a diff in
//! a block header), pending (the proposing block has been claimed by a
//! QC) and active (the proposing block became final). Both promotions
//! are deterministic functions of the finality pipeline, so every node
//! derives identical policy stages from the same chain.

use {
  crate::primitives::{AccountName, BlockTimestamp, BlsPubkey, Digest, Pubkey},
  serde::{Deserialize, Serialize},
};

/// A single finalizer's voting identity and weight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerAuthority {
  pub description: String,
  pub weight: u64,
  pub public_key: BlsPubkey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerPolicy {
  pub generation: u32,
  pub threshold: u64,
  pub finalizers: Vec<FinalizerAuthority>,
}

impl FinalizerPolicy {
  pub fn total_weight(&self) -> u64 {
    self.finalizers.iter().map(|f| f.weight).sum()
  }

  pub fn index_of(&self, key: &BlsPubkey) -> Option<usize> {
    self.finalizers.iter().position(|f| &f.public_key == key)
  }

  /// Digest over the serialized policy, committed into vote digests so
  /// that votes cannot be replayed across policy generations.
  pub fn digest(&self) -> Digest {
    Digest::hash(bincode::serialize(self).expect("policy serializes"))
  }
}

/// Delta between a parent block's proposed finalizer policy and the
/// child's. Carried in the finality header extension to keep headers
/// small when the finalizer set is large.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerPolicyDiff {
  pub generation: u32,
  pub threshold: u64,
  /// Indexes into the base policy's finalizer list, ascending.
  pub remove_indexes: Vec<u16>,
  /// (position, authority) pairs to insert after removal, ascending.
  pub insert: Vec<(u16, FinalizerAuthority)>,
}

impl FinalizerPolicyDiff {
  /// A diff that replaces the base policy entirely.
  pub fn full(base: &FinalizerPolicy, next: &FinalizerPolicy) -> Self {
    Self {
      generation: next.generation,
      threshold: next.threshold,
      remove_indexes: (0..base.finalizers.len() as u16).collect(),
      insert: next
        .finalizers
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, f)| (i as u16, f))
        .collect(),
    }
  }

  pub fn apply(&self, base: &FinalizerPolicy) -> FinalizerPolicy {
    let mut finalizers = base.finalizers.clone();
    for index in self.remove_indexes.iter().rev() {
      if (*index as usize) < finalizers.len() {
        finalizers.remove(*index as usize);
      }
    }
    for (position, authority) in &self.insert {
      let position = (*position as usize).min(finalizers.len());
      finalizers.insert(position, authority.clone());
    }
    FinalizerPolicy {
      generation: self.generation,
      threshold: self.threshold,
      finalizers,
    }
  }
}

/// A block producer's identity and block-signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerAuthority {
  pub producer_name: AccountName,
  pub signing_key: Pubkey,
}

/// The ordered producer rotation. Version increments with every
/// schedule change.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProducerSchedule {
  pub version: u32,
  pub producers: Vec<ProducerAuthority>,
}

impl ProducerSchedule {
  /// Round-robin producer for a slot.
  pub fn producer_for(&self, timestamp: BlockTimestamp) -> &ProducerAuthority {
    let index = timestamp.slot() as usize % self.producers.len().max(1);
    &self.producers[index]
  }

  pub fn get(&self, name: &AccountName) -> Option<&ProducerAuthority> {
    self.producers.iter().find(|p| &p.producer_name == name)
  }
}

/// A proposer policy is a producer schedule with the slot at which it
/// takes effect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerPolicy {
  pub active_time: BlockTimestamp,
  pub proposer_schedule: ProducerSchedule,
}

/// Delta for proposer policies, mirroring [`FinalizerPolicyDiff`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerPolicyDiff {
  pub version: u32,
  pub active_time: BlockTimestamp,
  pub remove_indexes: Vec<u16>,
  pub insert: Vec<(u16, ProducerAuthority)>,
}

impl ProposerPolicyDiff {
  pub fn full(base: &ProducerSchedule, next: &ProposerPolicy) -> Self {
    Self {
      version: next.proposer_schedule.version,
      active_time: next.active_time,
      remove_indexes: (0..base.producers.len() as u16).collect(),
      insert: next
        .proposer_schedule
        .producers
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, p)| (i as u16, p))
        .collect(),
    }
  }

  pub fn apply(&self, base: &ProducerSchedule) -> ProposerPolicy {
    let mut producers = base.producers.clone();
    for index in self.remove_indexes.iter().rev() {
      if (*index as usize) < producers.len() {
        producers.remove(*index as usize);
      }
    }
    for (position, authority) in &self.insert {
      let position = (*position as usize).min(producers.len());
      producers.insert(position, authority.clone());
    }
    ProposerPolicy {
      active_time: self.active_time,
      proposer_schedule: ProducerSchedule {
        version: self.version,
        producers,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn finalizer(name: &str, weight: u64) -> FinalizerAuthority {
    FinalizerAuthority {
      description: name.to_owned(),
      weight,
      public_key: BlsPubkey(name.as_bytes().to_vec()),
    }
  }

  #[test]
  fn full_diff_roundtrip() {
    let base = FinalizerPolicy {
      generation: 1,
      threshold: 2,
      finalizers: vec![finalizer("a", 1), finalizer("b", 1)],
    };
    let next = FinalizerPolicy {
      generation: 2,
      threshold: 3,
      finalizers: vec![finalizer("c", 1), finalizer("d", 2), finalizer("e", 1)],
    };
    let diff = FinalizerPolicyDiff::full(&base, &next);
    assert_eq!(diff.apply(&base), next);
  }

  #[test]
  fn partial_diff_applies_in_order() {
    let base = FinalizerPolicy {
      generation: 1,
      threshold: 2,
      finalizers: vec![finalizer("a", 1), finalizer("b", 1), finalizer("c", 1)],
    };
    // drop "b", insert "d" at the front
    let diff = FinalizerPolicyDiff {
      generation: 2,
      threshold: 2,
      remove_indexes: vec![1],
      insert: vec![(0, finalizer("d", 5))],
    };
    let next = diff.apply(&base);
    assert_eq!(next.finalizers.len(), 3);
    assert_eq!(next.finalizers[0].description, "d");
    assert_eq!(next.finalizers[1].description, "a");
    assert_eq!(next.finalizers[2].description, "c");
    assert_eq!(next.total_weight(), 7);
  }

  #[test]
  fn producer_rotation_is_slot_driven() {
    let schedule = ProducerSchedule {
      version: 1,
      producers: vec![
        ProducerAuthority {
          producer_name: "alpha".into(),
          signing_key: Pubkey::default(),
        },
        ProducerAuthority {
          producer_name: "bravo".into(),
          signing_key: Pubkey::default(),
        },
      ],
    };
    assert_eq!(
      schedule.producer_for(BlockTimestamp(6)).producer_name,
      "alpha".into()
    );
    assert_eq!(
      schedule.producer_for(BlockTimestamp(7)).producer_name,
      "bravo".into()
    );
  }
}
