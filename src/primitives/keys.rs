use {
  bls_signatures::Serialize as BlsSerialize,
  ed25519_dalek::{PublicKey, SecretKey},
  serde::{
    de::{self, Visitor},
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
  },
  std::{
    fmt::{Debug, Display, Formatter},
    marker::PhantomData,
    ops::Deref,
    str::FromStr,
  },
  thiserror::Error,
};

/// An ed25519 public key. Identifies block producers on the wire and
/// authenticates peers during the connection handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
  pub fn verify(
    &self,
    message: &[u8],
    signature: &ed25519_dalek::Signature,
  ) -> bool {
    use ed25519_dalek::Verifier;
    PublicKey::from_bytes(&self.0)
      .map(|pk| pk.verify(message, signature).is_ok())
      .unwrap_or(false)
  }

  pub fn to_bytes(self) -> [u8; 32] {
    self.0
  }
}

impl Deref for Pubkey {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", bs58::encode(self.0).into_string())
  }
}

impl Default for Pubkey {
  fn default() -> Self {
    Self([0u8; 32])
  }
}

impl From<Pubkey> for String {
  fn from(pk: Pubkey) -> Self {
    bs58::encode(pk.0).into_string()
  }
}

impl FromStr for Pubkey {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

impl From<PublicKey> for Pubkey {
  fn from(p: PublicKey) -> Self {
    Self(*p.as_bytes())
  }
}

impl From<[u8; 32]> for Pubkey {
  fn from(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }
}

/// Deserialize a pubkey from either a user-friendly base58
/// representation or a machine-friendly byte string.
impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct StringOrBytes<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrBytes<T>
    where
      T: FromStr<Err = bs58::decode::Error>,
    {
      type Value = T;

      fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("base58 string")
      }

      fn visit_str<E>(self, value: &str) -> Result<T, E>
      where
        E: de::Error,
      {
        FromStr::from_str(value)
          .map_err(|e| de::Error::custom(format!("{e:?}")))
      }
    }

    deserializer.deserialize_str(StringOrBytes(PhantomData))
  }
}

impl Serialize for Pubkey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.0).into_string())
  }
}

/// An ed25519 signing key. Producers sign block headers with it and
/// peers sign handshake tokens with it.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
  pub fn public(&self) -> Pubkey {
    self.0.public.into()
  }

  pub fn secret(&self) -> &SecretKey {
    &self.0.secret
  }

  pub fn generate(rng: &mut (impl rand::RngCore + rand::CryptoRng)) -> Self {
    let mut secret = [0u8; 32];
    rng.fill_bytes(&mut secret);
    Self::try_from(&secret[..]).expect("32 bytes is a valid secret key")
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(ed25519_dalek::Keypair::from_bytes(&self.0.to_bytes()).unwrap())
  }
}

impl Deref for Keypair {
  type Target = ed25519_dalek::Keypair;

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair").field(&self.0.public).finish()
  }
}

impl Display for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "Keypair({})",
      bs58::encode(self.0.public.as_bytes()).into_string()
    )
  }
}

impl From<ed25519_dalek::Keypair> for Keypair {
  fn from(k: ed25519_dalek::Keypair) -> Self {
    Self(k)
  }
}

#[derive(Debug, Error)]
pub enum KeypairError {
  #[error("Failed parsing base58 string: {0:?}")]
  Base58ParseError(bs58::decode::Error),

  #[error("{0}")]
  Ed25519Error(#[from] ed25519_dalek::ed25519::Error),

  #[error("invalid BLS key material")]
  BlsError,
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeypairError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    let secret = SecretKey::from_bytes(value)?;
    let public: PublicKey = (&secret).into();
    Ok(Self(ed25519_dalek::Keypair { secret, public }))
  }
}

impl FromStr for Keypair {
  type Err = KeypairError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let mut secret = [0u8; 32];
    bs58::decode(value)
      .into(&mut secret)
      .map_err(KeypairError::Base58ParseError)?;
    let secret = SecretKey::from_bytes(&secret)?;
    let public = (&secret).into();
    Ok(Keypair(ed25519_dalek::Keypair { secret, public }))
  }
}

/// A BLS12-381 G1 public key in compressed form (48 bytes).
///
/// Finalizers are identified by their BLS keys; individual votes and
/// aggregated quorum certificates verify against them.
#[derive(
  Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlsPubkey(pub Vec<u8>);

impl BlsPubkey {
  pub fn parse(&self) -> Option<bls_signatures::PublicKey> {
    bls_signatures::PublicKey::from_bytes(&self.0).ok()
  }

  /// Verifies a single finalizer signature over a vote digest.
  pub fn verify(&self, message: &[u8], signature: &BlsSignature) -> bool {
    match (self.parse(), signature.parse()) {
      (Some(pk), Some(sig)) => {
        bls_signatures::verify_messages(&sig, &[message], &[pk])
      }
      _ => false,
    }
  }
}

impl Display for BlsPubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(&self.0).into_string())
  }
}

impl Debug for BlsPubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlsPubkey({})", bs58::encode(&self.0).into_string())
  }
}

impl FromStr for BlsPubkey {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self(bs58::decode(s).into_vec()?))
  }
}

/// A BLS12-381 G2 signature in compressed form (96 bytes).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlsSignature(pub Vec<u8>);

impl BlsSignature {
  pub fn parse(&self) -> Option<bls_signatures::Signature> {
    bls_signatures::Signature::from_bytes(&self.0).ok()
  }

  /// Aggregates many vote signatures into one certificate signature.
  pub fn aggregate(
    signatures: &[BlsSignature],
  ) -> Result<BlsSignature, KeypairError> {
    let parsed: Option<Vec<_>> =
      signatures.iter().map(|s| s.parse()).collect();
    let parsed = parsed.ok_or(KeypairError::BlsError)?;
    let agg =
      bls_signatures::aggregate(&parsed).map_err(|_| KeypairError::BlsError)?;
    Ok(BlsSignature(agg.as_bytes()))
  }

  /// Verifies an aggregate signature where the signers split into two
  /// groups each signing its own message (strong and weak voters of a
  /// quorum certificate).
  pub fn verify_aggregate_split(
    &self,
    message_a: &[u8],
    signers_a: &[&BlsPubkey],
    message_b: &[u8],
    signers_b: &[&BlsPubkey],
  ) -> bool {
    let keys_a: Option<Vec<_>> = signers_a.iter().map(|k| k.parse()).collect();
    let keys_b: Option<Vec<_>> = signers_b.iter().map(|k| k.parse()).collect();
    let (Some(keys_a), Some(keys_b), Some(sig)) =
      (keys_a, keys_b, self.parse())
    else {
      return false;
    };
    if keys_a.is_empty() || keys_b.is_empty() {
      return false;
    }
    match (
      bls_signatures::aggregate_keys(&keys_a),
      bls_signatures::aggregate_keys(&keys_b),
    ) {
      (Ok(agg_a), Ok(agg_b)) => bls_signatures::verify_messages(
        &sig,
        &[message_a, message_b],
        &[agg_a, agg_b],
      ),
      _ => false,
    }
  }

  /// Verifies an aggregate signature where every signer signed the same
  /// message. Public keys are aggregated first, then checked as one.
  pub fn verify_aggregate(
    &self,
    message: &[u8],
    signers: &[&BlsPubkey],
  ) -> bool {
    let keys: Option<Vec<_>> = signers.iter().map(|k| k.parse()).collect();
    let (Some(keys), Some(sig)) = (keys, self.parse()) else {
      return false;
    };
    if keys.is_empty() {
      return false;
    }
    match bls_signatures::aggregate_keys(&keys) {
      Ok(agg_key) => {
        bls_signatures::verify_messages(&sig, &[message], &[agg_key])
      }
      Err(_) => false,
    }
  }
}

impl Display for BlsSignature {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(&self.0).into_string())
  }
}

impl Debug for BlsSignature {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlsSignature({})", bs58::encode(&self.0).into_string())
  }
}

/// A finalizer's BLS signing key with its cached public half.
pub struct BlsKeypair {
  secret: bls_signatures::PrivateKey,
  public: BlsPubkey,
}

impl BlsKeypair {
  pub fn public(&self) -> &BlsPubkey {
    &self.public
  }

  pub fn sign(&self, message: &[u8]) -> BlsSignature {
    BlsSignature(self.secret.sign(message).as_bytes())
  }

  pub fn generate(rng: &mut (impl rand::RngCore + rand::CryptoRng)) -> Self {
    // rejection-sample until the bytes land below the scalar modulus
    let mut seed = [0u8; 32];
    loop {
      rng.fill_bytes(&mut seed);
      if let Ok(secret) = bls_signatures::PrivateKey::from_bytes(&seed) {
        let public = BlsPubkey(secret.public_key().as_bytes());
        return Self { secret, public };
      }
    }
  }
}

impl Clone for BlsKeypair {
  fn clone(&self) -> Self {
    Self {
      secret: bls_signatures::PrivateKey::from_bytes(&self.secret.as_bytes())
        .expect("roundtrip of a valid key"),
      public: self.public.clone(),
    }
  }
}

impl Debug for BlsKeypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("BlsKeypair").field(&self.public).finish()
  }
}

impl TryFrom<&[u8]> for BlsKeypair {
  type Error = KeypairError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    let secret = bls_signatures::PrivateKey::from_bytes(value)
      .map_err(|_| KeypairError::BlsError)?;
    let public = BlsPubkey(secret.public_key().as_bytes());
    Ok(Self { secret, public })
  }
}

impl FromStr for BlsKeypair {
  type Err = KeypairError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let bytes = bs58::decode(value)
      .into_vec()
      .map_err(KeypairError::Base58ParseError)?;
    Self::try_from(bytes.as_slice())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ed25519_sign_verify() {
    use ed25519_dalek::Signer;
    let keypair: Keypair = "9wkzHU5nqzvAdGPjvXZCsEkUwiHExdE9mTCYLVMzgm81"
      .parse()
      .unwrap();
    let sig = keypair.sign(b"message");
    assert!(keypair.public().verify(b"message", &sig));
    assert!(!keypair.public().verify(b"other", &sig));
  }

  #[test]
  fn bls_aggregate_verify() {
    let mut rng = rand::thread_rng();
    let keys: Vec<_> =
      (0..4).map(|_| BlsKeypair::generate(&mut rng)).collect();

    let msg = b"vote digest";
    let sigs: Vec<_> = keys.iter().map(|k| k.sign(msg)).collect();
    let agg = BlsSignature::aggregate(&sigs).unwrap();

    let pubs: Vec<_> = keys.iter().map(|k| k.public()).collect();
    assert!(agg.verify_aggregate(msg, &pubs));

    // missing a signer's key breaks the aggregate
    assert!(!agg.verify_aggregate(msg, &pubs[..3]));
  }
}
