use {
  super::{
    policy::{FinalizerPolicyDiff, ProposerPolicyDiff, ProducerSchedule},
    qc::QcClaim,
  },
  crate::primitives::{AccountName, BlockId, BlockTimestamp, Digest},
  serde::{Deserialize, Serialize},
};

/// Sentinel `schedule_version` carried by proper Savanna blocks, whose
/// producer schedules are governed by proposer policies instead.
pub const SAVANNA_SCHEDULE_VERSION: u32 = u32::MAX;

/// Consensus regime a block belongs to, derived from its header and
/// its parent's classification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockClass {
  /// Pre-transition: DPOS confirmations, no finality extension.
  Legacy,
  /// Carries a finality extension but its parent is Legacy or also
  /// Transition. The first such block is the Savanna Genesis block.
  Transition,
  /// Post-transition consensus rules.
  ProperSavanna,
}

/// The finality header extension. Its presence marks a Savanna or
/// transition block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityExtension {
  pub qc_claim: QcClaim,
  pub new_finalizer_policy_diff: Option<FinalizerPolicyDiff>,
  pub new_proposer_policy_diff: Option<ProposerPolicyDiff>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderExtension {
  Finality(FinalityExtension),
  /// Protocol features this block activates, in activation order.
  ProtocolFeatures(Vec<Digest>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
  pub timestamp: BlockTimestamp,
  pub producer: AccountName,
  /// Number of prior blocks this producer confirms. Legacy only;
  /// always zero under Savanna.
  pub confirmed: u16,
  pub previous: BlockId,
  pub transaction_mroot: Digest,
  /// Merkle of action receipt digests. Under Savanna this field
  /// doubles as the finality merkle root claim.
  pub action_mroot: Digest,
  pub schedule_version: u32,
  /// Legacy in-band producer schedule change.
  pub new_producers: Option<ProducerSchedule>,
  pub header_extensions: Vec<HeaderExtension>,
}

impl BlockHeader {
  pub fn block_num(&self) -> u32 {
    self.previous.block_num() + 1
  }

  pub fn digest(&self) -> Digest {
    Digest::hash(bincode::serialize(self).expect("header serializes"))
  }

  pub fn calculate_id(&self) -> BlockId {
    BlockId::new(self.digest(), self.block_num())
  }

  pub fn finality_extension(&self) -> Option<&FinalityExtension> {
    self.header_extensions.iter().find_map(|e| match e {
      HeaderExtension::Finality(f) => Some(f),
      _ => None,
    })
  }

  pub fn protocol_features(&self) -> &[Digest] {
    self
      .header_extensions
      .iter()
      .find_map(|e| match e {
        HeaderExtension::ProtocolFeatures(f) => Some(f.as_slice()),
        _ => None,
      })
      .unwrap_or(&[])
  }

  /// True for transition and proper Savanna blocks alike.
  pub fn is_savanna(&self) -> bool {
    self.finality_extension().is_some()
  }

  pub fn is_proper_savanna(&self) -> bool {
    self.is_savanna() && self.schedule_version == SAVANNA_SCHEDULE_VERSION
  }

  /// Classifies this header given whether the parent was still a
  /// legacy or transition block.
  pub fn classify(&self, parent_is_legacy_or_transition: bool) -> BlockClass {
    if !self.is_savanna() {
      BlockClass::Legacy
    } else if parent_is_legacy_or_transition
      && self.schedule_version != SAVANNA_SCHEDULE_VERSION
    {
      BlockClass::Transition
    } else {
      BlockClass::ProperSavanna
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlockHeader {
  pub header: BlockHeader,
  pub producer_signature: ed25519_dalek::Signature,
}

#[cfg(test)]
mod tests {
  use {super::*, crate::primitives::BlockTimestamp};

  fn header(previous: BlockId) -> BlockHeader {
    BlockHeader {
      timestamp: BlockTimestamp(10),
      producer: "prod".into(),
      confirmed: 0,
      previous,
      transaction_mroot: Digest::default(),
      action_mroot: Digest::default(),
      schedule_version: 1,
      new_producers: None,
      header_extensions: vec![],
    }
  }

  #[test]
  fn id_embeds_height() {
    let parent = BlockId::new(Digest::hash(b"genesis"), 41);
    let h = header(parent);
    assert_eq!(h.block_num(), 42);
    assert_eq!(h.calculate_id().block_num(), 42);
  }

  #[test]
  fn classification_follows_extension_and_parent() {
    let parent = BlockId::new(Digest::hash(b"x"), 1);
    let mut h = header(parent);
    assert_eq!(h.classify(true), BlockClass::Legacy);

    h.header_extensions.push(HeaderExtension::Finality(FinalityExtension {
      qc_claim: QcClaim { block_num: 2, is_strong: false },
      new_finalizer_policy_diff: None,
      new_proposer_policy_diff: None,
    }));
    assert_eq!(h.classify(true), BlockClass::Transition);

    h.schedule_version = SAVANNA_SCHEDULE_VERSION;
    assert_eq!(h.classify(false), BlockClass::ProperSavanna);
  }

  #[test]
  fn distinct_headers_distinct_ids() {
    let parent = BlockId::new(Digest::hash(b"x"), 7);
    let a = header(parent);
    let mut b = header(parent);
    b.timestamp = BlockTimestamp(11);
    assert_ne!(a.calculate_id(), b.calculate_id());
  }
}
