//! Merkle roots over transaction and action receipt digests.
//!
//! Two shapes are in use. The legacy merkle canonicalizes each pair by
//! masking the top bit of both children (left cleared, right set) and
//! duplicates a trailing odd node. The canonical merkle hashes raw pairs
//! and promotes a trailing odd node unchanged, which makes proofs over
//! it independent of the tree width.

use {super::id::Digest, rayon::prelude::*};

/// Below this leaf count the rayon fan-out costs more than it saves.
const PARALLEL_THRESHOLD: usize = 256;

fn make_legacy_left(d: &Digest) -> Digest {
  let mut bytes = d.0;
  bytes[0] &= 0x7f;
  Digest(bytes)
}

fn make_legacy_right(d: &Digest) -> Digest {
  let mut bytes = d.0;
  bytes[0] |= 0x80;
  Digest(bytes)
}

fn hash_level(level: &[Digest], legacy: bool) -> Vec<Digest> {
  let pair = |chunk: &[Digest]| -> Digest {
    match chunk {
      [left, right] => {
        if legacy {
          Digest::hash_pair(&make_legacy_left(left), &make_legacy_right(right))
        } else {
          Digest::hash_pair(left, right)
        }
      }
      [odd] => {
        if legacy {
          // legacy trees pair a trailing node with itself
          Digest::hash_pair(&make_legacy_left(odd), &make_legacy_right(odd))
        } else {
          // canonical trees promote it unchanged
          *odd
        }
      }
      _ => unreachable!("chunks of at most 2"),
    }
  };

  if level.len() >= PARALLEL_THRESHOLD {
    level.par_chunks(2).map(pair).collect()
  } else {
    level.chunks(2).map(pair).collect()
  }
}

fn merkle(mut level: Vec<Digest>, legacy: bool) -> Digest {
  if level.is_empty() {
    return Digest::default();
  }
  while level.len() > 1 {
    level = hash_level(&level, legacy);
  }
  level[0]
}

/// Merkle root over digests as computed by pre-transition blocks.
pub fn legacy_merkle(digests: Vec<Digest>) -> Digest {
  merkle(digests, true)
}

/// Merkle root over digests as computed by transition and Savanna
/// blocks.
pub fn canonical_merkle(digests: Vec<Digest>) -> Digest {
  merkle(digests, false)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn digests(n: usize) -> Vec<Digest> {
    (0..n).map(|i| Digest::hash(i.to_le_bytes())).collect()
  }

  #[test]
  fn empty_root_is_zero() {
    assert_eq!(legacy_merkle(vec![]), Digest::default());
    assert_eq!(canonical_merkle(vec![]), Digest::default());
  }

  #[test]
  fn single_leaf_is_its_own_canonical_root() {
    let d = digests(1);
    assert_eq!(canonical_merkle(d.clone()), d[0]);
  }

  #[test]
  fn shapes_differ() {
    let d = digests(4);
    assert_ne!(legacy_merkle(d.clone()), canonical_merkle(d));
  }

  #[test]
  fn canonical_odd_promotion() {
    // with three leaves the canonical tree is hash(hash(a,b), c)
    let d = digests(3);
    let expected =
      Digest::hash_pair(&Digest::hash_pair(&d[0], &d[1]), &d[2]);
    assert_eq!(canonical_merkle(d), expected);
  }

  #[test]
  fn legacy_odd_duplication() {
    let d = digests(3);
    let ab = Digest::hash_pair(&make_legacy_left(&d[0]), &make_legacy_right(&d[1]));
    let cc = Digest::hash_pair(&make_legacy_left(&d[2]), &make_legacy_right(&d[2]));
    let expected =
      Digest::hash_pair(&make_legacy_left(&ab), &make_legacy_right(&cc));
    assert_eq!(legacy_merkle(d), expected);
  }

  #[test]
  fn parallel_matches_serial() {
    // cross the parallel threshold and compare against a serial fold
    let d = digests(1000);
    let serial = {
      let mut level = d.clone();
      while level.len() > 1 {
        level = level
          .chunks(2)
          .map(|c| match c {
            [l, r] => Digest::hash_pair(l, r),
            [o] => *o,
            _ => unreachable!(),
          })
          .collect();
      }
      level[0]
    };
    assert_eq!(canonical_merkle(d), serial);
  }
}
