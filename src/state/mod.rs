//! The chain state store.
//!
//! A flat key-value space with a revision counter and an undo log.
//! Every block opens an undo session; every transaction inside the
//! block opens a nested micro-session that is squashed into the block
//! session on success or undone on failure. Sessions become permanent
//! only when their block becomes irreversible.
//!
//! The live map always reflects the newest uncommitted view; undo
//! layers record the previous value of every key a session touched,
//! so undoing is a replay of old values in reverse.

use {
  crate::primitives::Digest,
  sha2::{Digest as _, Sha256},
  std::collections::BTreeMap,
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum StateError {
  #[error("no active undo session")]
  NoSession,

  #[error("cannot set revision while undo sessions are active")]
  SessionsActive,

  #[error("commit revision {0} is ahead of the newest session")]
  CommitAhead(i64),
}

#[derive(Debug, Default)]
struct UndoLayer {
  revision: i64,
  /// Key -> value before this session first touched it. `None` means
  /// the key did not exist.
  old: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

/// Session-versioned key-value state.
#[derive(Debug, Default)]
pub struct StateStore {
  live: BTreeMap<Vec<u8>, Vec<u8>>,
  undo_stack: Vec<UndoLayer>,
  revision: i64,
}

impl StateStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// The newest revision, including uncommitted sessions. At block
  /// boundaries this equals the head block number.
  pub fn revision(&self) -> i64 {
    self.revision
  }

  pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
    self.live.get(key)
  }

  pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
    let old = self.live.insert(key.clone(), value);
    if let Some(layer) = self.undo_stack.last_mut() {
      layer.old.entry(key).or_insert(old);
    }
  }

  pub fn remove(&mut self, key: &[u8]) {
    let old = self.live.remove(key);
    if old.is_some() {
      if let Some(layer) = self.undo_stack.last_mut() {
        layer.old.entry(key.to_vec()).or_insert(old);
      }
    }
  }

  /// Iterate live entries under a key prefix.
  pub fn scan_prefix<'a>(
    &'a self,
    prefix: &'a [u8],
  ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
    self
      .live
      .range(prefix.to_vec()..)
      .take_while(move |(k, _)| k.starts_with(prefix))
  }

  /// Opens a new undo session and returns its revision.
  pub fn start_undo_session(&mut self) -> i64 {
    self.revision += 1;
    self.undo_stack.push(UndoLayer {
      revision: self.revision,
      old: BTreeMap::new(),
    });
    self.revision
  }

  /// Reverts everything the newest session touched.
  pub fn undo(&mut self) -> Result<(), StateError> {
    let layer = self.undo_stack.pop().ok_or(StateError::NoSession)?;
    for (key, old) in layer.old {
      match old {
        Some(value) => {
          self.live.insert(key, value);
        }
        None => {
          self.live.remove(&key);
        }
      }
    }
    self.revision -= 1;
    Ok(())
  }

  /// Folds the newest session into the one below it, keeping the
  /// combined changes undoable as a unit.
  pub fn squash(&mut self) -> Result<(), StateError> {
    let top = self.undo_stack.pop().ok_or(StateError::NoSession)?;
    let below = self.undo_stack.last_mut().ok_or(StateError::NoSession)?;
    for (key, old) in top.old {
      below.old.entry(key).or_insert(old);
    }
    self.revision -= 1;
    Ok(())
  }

  /// Makes all sessions at or below `revision` permanent.
  pub fn commit(&mut self, revision: i64) -> Result<(), StateError> {
    if revision > self.revision {
      return Err(StateError::CommitAhead(revision));
    }
    while let Some(first) = self.undo_stack.first() {
      if first.revision > revision {
        break;
      }
      // committed changes are already in the live map; dropping the
      // undo layer is all it takes
      self.undo_stack.remove(0);
    }
    Ok(())
  }

  /// Reverts every open session, returning to the last committed
  /// state.
  pub fn undo_all(&mut self) -> Result<(), StateError> {
    while !self.undo_stack.is_empty() {
      self.undo()?;
    }
    Ok(())
  }

  /// Only valid with no open sessions; used when loading a snapshot
  /// or replaying the block log.
  pub fn set_revision(&mut self, revision: i64) -> Result<(), StateError> {
    if !self.undo_stack.is_empty() {
      return Err(StateError::SessionsActive);
    }
    self.revision = revision;
    Ok(())
  }

  pub fn has_sessions(&self) -> bool {
    !self.undo_stack.is_empty()
  }

  /// Deterministic digest over the live state. Two nodes at the same
  /// block must produce identical hashes.
  pub fn integrity_hash(&self) -> Digest {
    let mut sha = Sha256::new();
    for (key, value) in &self.live {
      sha.update((key.len() as u64).to_le_bytes());
      sha.update(key);
      sha.update((value.len() as u64).to_le_bytes());
      sha.update(value);
    }
    Digest(sha.finalize().into())
  }

  /// Exports the live entries for snapshotting.
  pub fn export(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
    self.live.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
  }

  /// Replaces the live state wholesale from a snapshot.
  pub fn import(
    &mut self,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    revision: i64,
  ) -> Result<(), StateError> {
    if !self.undo_stack.is_empty() {
      return Err(StateError::SessionsActive);
    }
    self.live = entries.into_iter().collect();
    self.revision = revision;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn undo_restores_previous_values() {
    let mut store = StateStore::new();
    store.put(b"a".to_vec(), b"1".to_vec());

    store.start_undo_session();
    store.put(b"a".to_vec(), b"2".to_vec());
    store.put(b"b".to_vec(), b"3".to_vec());
    store.remove(b"a");

    store.undo().unwrap();
    assert_eq!(store.get(b"a"), Some(&b"1".to_vec()));
    assert_eq!(store.get(b"b"), None);
  }

  #[test]
  fn squash_merges_sessions() {
    let mut store = StateStore::new();
    store.start_undo_session(); // block session
    store.put(b"x".to_vec(), b"1".to_vec());

    store.start_undo_session(); // transaction micro-session
    store.put(b"x".to_vec(), b"2".to_vec());
    store.put(b"y".to_vec(), b"9".to_vec());
    store.squash().unwrap();

    // undoing the block session reverts both
    store.undo().unwrap();
    assert_eq!(store.get(b"x"), None);
    assert_eq!(store.get(b"y"), None);
    assert_eq!(store.revision(), 0);
  }

  #[test]
  fn commit_makes_sessions_permanent() {
    let mut store = StateStore::new();
    let r1 = store.start_undo_session();
    store.put(b"k".to_vec(), b"v".to_vec());
    let _r2 = store.start_undo_session();
    store.put(b"k2".to_vec(), b"v2".to_vec());

    store.commit(r1).unwrap();
    // r1 is permanent, r2 still undoable
    store.undo_all().unwrap();
    assert_eq!(store.get(b"k"), Some(&b"v".to_vec()));
    assert_eq!(store.get(b"k2"), None);
  }

  #[test]
  fn integrity_hash_tracks_content_not_history() {
    let mut a = StateStore::new();
    a.put(b"k1".to_vec(), b"v1".to_vec());
    a.put(b"k2".to_vec(), b"v2".to_vec());

    let mut b = StateStore::new();
    b.put(b"k2".to_vec(), b"v2".to_vec());
    b.put(b"k1".to_vec(), b"wrong".to_vec());
    b.put(b"k1".to_vec(), b"v1".to_vec());

    assert_eq!(a.integrity_hash(), b.integrity_hash());

    b.put(b"k3".to_vec(), b"v3".to_vec());
    assert_ne!(a.integrity_hash(), b.integrity_hash());
  }

  #[test]
  fn revision_tracks_sessions() {
    let mut store = StateStore::new();
    store.set_revision(10).unwrap();
    assert_eq!(store.start_undo_session(), 11);
    assert_eq!(store.start_undo_session(), 12);
    store.undo().unwrap();
    assert_eq!(store.revision(), 11);
  }
}
