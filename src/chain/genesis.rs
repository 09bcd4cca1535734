use {
  super::policy::{FinalizerPolicy, ProducerSchedule},
  crate::primitives::{BlockId, BlockTimestamp, Digest, TimePoint},
  chrono::{DateTime, Utc},
  serde::{Deserialize, Serialize},
};

/// The genesis configuration of a chain.
///
/// Defines the very first block of a chain with a fixed producer
/// schedule and, optionally, an initial finalizer policy for chains
/// that start directly under Savanna rather than transitioning into
/// it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genesis {
  /// A globally unique name for this chain. The chain id every peer
  /// handshake carries is derived from the full genesis content, so
  /// two chains differing in any field never interconnect.
  pub name: String,

  /// The UTC timestamp at which the chain starts. The genesis block
  /// occupies the slot containing this instant.
  pub genesis_time: DateTime<Utc>,

  /// The initial producer rotation.
  pub initial_schedule: ProducerSchedule,

  /// Present when the chain begins directly under Savanna. Absent for
  /// chains that start Legacy and transition later; those receive
  /// their first policy through the Savanna Genesis block's diff.
  pub initial_finalizer_policy: Option<FinalizerPolicy>,
}

impl Genesis {
  pub fn chain_id(&self) -> Digest {
    Digest::hash(serde_json::to_vec(self).expect("genesis serializes"))
  }

  pub fn timestamp(&self) -> BlockTimestamp {
    BlockTimestamp::from_time_point(TimePoint(
      self.genesis_time.timestamp_nanos_opt().unwrap_or(0),
    ))
  }

  /// Id of the implicit genesis block. Height zero, derived from the
  /// chain id so unrelated chains never share block ids.
  pub fn block_id(&self) -> BlockId {
    BlockId::new(self.chain_id(), 0)
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{chain::policy::ProducerAuthority, primitives::Pubkey},
    chrono::TimeZone,
  };

  pub fn sample() -> Genesis {
    Genesis {
      name: "testnet".into(),
      genesis_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
      initial_schedule: ProducerSchedule {
        version: 0,
        producers: vec![ProducerAuthority {
          producer_name: "alpha".into(),
          signing_key: Pubkey::default(),
        }],
      },
      initial_finalizer_policy: None,
    }
  }

  #[test]
  fn chain_id_is_content_addressed() {
    let a = sample();
    let mut b = sample();
    assert_eq!(a.chain_id(), b.chain_id());
    b.name = "othernet".into();
    assert_ne!(a.chain_id(), b.chain_id());
  }

  #[test]
  fn genesis_block_is_height_zero() {
    assert_eq!(sample().block_id().block_num(), 0);
  }
}
