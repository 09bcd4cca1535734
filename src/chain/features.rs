//! Protocol feature registry.
//!
//! Features are identified by digest, may depend on other features,
//! and are activated by block producers through `start_block`. The
//! activation set is part of chain state, so it rolls back with the
//! block that carried it.

use {
  super::error::FeatureError,
  crate::{primitives::Digest, state::StateStore},
  once_cell::sync::Lazy,
  std::collections::HashMap,
};

const ACTIVATION_PREFIX: &[u8] = b"features/";

/// The feature that switches consensus from Legacy to Savanna. Its
/// activation makes the next produced block the Savanna Genesis
/// block.
pub static SAVANNA_FEATURE: Lazy<Digest> =
  Lazy::new(|| Digest::hash(b"veldt.feature.savanna"));

/// Disables the deferred transaction subsystem.
pub static DISABLE_DEFERRED_TRXS_FEATURE: Lazy<Digest> =
  Lazy::new(|| Digest::hash(b"veldt.feature.disable_deferred_trxs"));

#[derive(Clone, Debug)]
pub struct ProtocolFeature {
  pub digest: Digest,
  pub description: String,
  pub dependencies: Vec<Digest>,
}

/// All features this build knows how to apply.
#[derive(Clone, Debug, Default)]
pub struct ProtocolFeatureSet {
  known: HashMap<Digest, ProtocolFeature>,
}

impl ProtocolFeatureSet {
  pub fn with_builtins() -> Self {
    let mut set = Self::default();
    set.add(ProtocolFeature {
      digest: *SAVANNA_FEATURE,
      description: "savanna consensus".into(),
      dependencies: vec![],
    });
    set.add(ProtocolFeature {
      digest: *DISABLE_DEFERRED_TRXS_FEATURE,
      description: "disable deferred transactions".into(),
      dependencies: vec![],
    });
    set
  }

  pub fn add(&mut self, feature: ProtocolFeature) {
    self.known.insert(feature.digest, feature);
  }

  pub fn get(&self, digest: &Digest) -> Option<&ProtocolFeature> {
    self.known.get(digest)
  }

  fn activation_key(digest: &Digest) -> Vec<u8> {
    let mut key = ACTIVATION_PREFIX.to_vec();
    key.extend_from_slice(digest.as_ref());
    key
  }

  pub fn is_activated(state: &StateStore, digest: &Digest) -> bool {
    state.get(&Self::activation_key(digest)).is_some()
  }

  /// Activates a feature inside the current undo session, enforcing
  /// uniqueness and dependency order.
  pub fn activate(
    &self,
    state: &mut StateStore,
    digest: &Digest,
  ) -> Result<(), FeatureError> {
    let feature =
      self.known.get(digest).ok_or(FeatureError::Unknown(*digest))?;
    if Self::is_activated(state, digest) {
      return Err(FeatureError::Duplicate(*digest));
    }
    for dependency in &feature.dependencies {
      if !Self::is_activated(state, dependency) {
        return Err(FeatureError::UnmetDependency {
          feature: *digest,
          missing: *dependency,
        });
      }
    }
    state.put(Self::activation_key(digest), vec![1]);
    Ok(())
  }

  pub fn activated(state: &StateStore) -> Vec<Digest> {
    state
      .scan_prefix(ACTIVATION_PREFIX)
      .filter_map(|(k, _)| {
        let bytes: [u8; 32] =
          k[ACTIVATION_PREFIX.len()..].try_into().ok()?;
        Some(Digest(bytes))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn activation_rules() {
    let dependent = Digest::hash(b"dependent-feature");
    let mut set = ProtocolFeatureSet::with_builtins();
    set.add(ProtocolFeature {
      digest: dependent,
      description: "needs savanna".into(),
      dependencies: vec![*SAVANNA_FEATURE],
    });

    let mut state = StateStore::new();
    assert!(matches!(
      set.activate(&mut state, &Digest::hash(b"nope")),
      Err(FeatureError::Unknown(_))
    ));
    assert!(matches!(
      set.activate(&mut state, &dependent),
      Err(FeatureError::UnmetDependency { .. })
    ));

    set.activate(&mut state, &SAVANNA_FEATURE).unwrap();
    assert!(matches!(
      set.activate(&mut state, &SAVANNA_FEATURE),
      Err(FeatureError::Duplicate(_))
    ));
    set.activate(&mut state, &dependent).unwrap();
    assert!(ProtocolFeatureSet::is_activated(&state, &dependent));
    assert_eq!(ProtocolFeatureSet::activated(&state).len(), 2);
  }

  #[test]
  fn activation_rolls_back_with_session() {
    let set = ProtocolFeatureSet::with_builtins();
    let mut state = StateStore::new();
    state.start_undo_session();
    set.activate(&mut state, &SAVANNA_FEATURE).unwrap();
    assert!(ProtocolFeatureSet::is_activated(&state, &SAVANNA_FEATURE));
    state.undo().unwrap();
    assert!(!ProtocolFeatureSet::is_activated(&state, &SAVANNA_FEATURE));
  }
}
