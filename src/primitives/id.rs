use {
  serde::{Deserialize, Serialize},
  sha2::{Digest as _, Sha256},
  std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
  },
};

/// A 32-byte SHA-256 output used for all commitments in the chain:
/// transaction digests, merkle nodes, finality digests, integrity hashes.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct Digest(pub [u8; 32]);

impl Digest {
  pub fn hash(bytes: impl AsRef<[u8]>) -> Self {
    let mut sha = Sha256::new();
    sha.update(bytes.as_ref());
    Self(sha.finalize().into())
  }

  /// Digest of the concatenation of two digests. This is the node
  /// combinator for all merkle structures in the chain.
  pub fn hash_pair(left: &Digest, right: &Digest) -> Self {
    let mut sha = Sha256::new();
    sha.update(left.0);
    sha.update(right.0);
    Self(sha.finalize().into())
  }

  pub fn is_zero(&self) -> bool {
    self.0 == [0u8; 32]
  }

  pub fn to_bytes(self) -> [u8; 32] {
    self.0
  }
}

impl AsRef<[u8]> for Digest {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl Display for Digest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl Debug for Digest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Digest({})", bs58::encode(self.0).into_string())
  }
}

impl FromStr for Digest {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

/// Identifies a block in the chain.
///
/// A block id is the digest of the serialized block header with its
/// high 32 bits overwritten by the block height, so that the height of
/// any block is recoverable from its id without a lookup.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
  /// Stamps the block height into the high 32 bits of a header digest.
  pub fn new(digest: Digest, block_num: u32) -> Self {
    let mut bytes = digest.0;
    bytes[..4].copy_from_slice(&block_num.to_be_bytes());
    Self(bytes)
  }

  /// The height encoded in this id. O(1), no lookups.
  pub fn block_num(&self) -> u32 {
    u32::from_be_bytes(self.0[..4].try_into().expect("4 bytes"))
  }

  pub fn is_zero(&self) -> bool {
    self.0 == [0u8; 32]
  }

  pub fn to_bytes(self) -> [u8; 32] {
    self.0
  }
}

impl AsRef<[u8]> for BlockId {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl Display for BlockId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl Debug for BlockId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "BlockId(#{} {})",
      self.block_num(),
      bs58::encode(self.0).into_string()
    )
  }
}

impl FromStr for BlockId {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

/// Digest of a transaction's signed payload. Used as the dedup key
/// and as the receipt reference when the body is not inlined.
pub type TransactionId = Digest;

/// Name of an on-chain account: producers, finalizer operators and
/// transaction authorizers are all identified by account names.
#[derive(
  Clone,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct AccountName(pub String);

impl AccountName {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for AccountName {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl Debug for AccountName {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for AccountName {
  fn from(s: &str) -> Self {
    Self(s.to_owned())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn block_num_roundtrip() {
    let digest = Digest::hash(b"header bytes");
    let id = BlockId::new(digest, 0xdead_beef);
    assert_eq!(id.block_num(), 0xdead_beef);

    // everything below the height stamp is the header digest
    assert_eq!(id.0[4..], digest.0[4..]);
  }

  #[test]
  fn digest_b58_roundtrip() {
    let d = Digest::hash(b"hello");
    let s = d.to_string();
    assert_eq!(s.parse::<Digest>().unwrap(), d);
  }

  #[test]
  fn pair_hash_is_order_sensitive() {
    let a = Digest::hash(b"a");
    let b = Digest::hash(b"b");
    assert_ne!(Digest::hash_pair(&a, &b), Digest::hash_pair(&b, &a));
  }
}
