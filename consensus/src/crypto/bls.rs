/// BLS signatures over BLS12-381
///
/// Validators sign consensus payloads individually; a quorum's signatures
/// are combined by point addition into one aggregate signature that
/// verifies against the sum of the signers' public keys.

use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey as BlstPublicKey,
    SecretKey as BlstSecretKey, Signature as BlstSignature,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// Compressed encodings: G2 signatures and G1 public keys
pub const BLS_SIGNATURE_SIZE: usize = 96;
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
pub const BLS_SECRET_KEY_SIZE: usize = 32;

/// Domain separation tag for every consensus signature
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BLSError {
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Invalid key encoding")]
    InvalidKey,
    #[error("Nothing to aggregate")]
    EmptyAggregate,
    #[error("Signature verification failed")]
    VerificationFailed,
}

/// BLS secret key wrapper
#[derive(Clone)]
pub struct BLSSecretKey {
    inner: BlstSecretKey,
}

impl BLSSecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut ikm);
        // key_gen only fails for ikm shorter than 32 bytes
        let inner = BlstSecretKey::key_gen(&ikm, &[]).expect("32-byte ikm is always accepted");
        Self { inner }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSecretKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; BLS_SECRET_KEY_SIZE] {
        self.inner.to_bytes()
    }

    pub fn public_key(&self) -> BLSPublicKey {
        BLSPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> BLSSignature {
        BLSSignature {
            inner: self.inner.sign(message, BLS_DST, &[]),
        }
    }
}

impl fmt::Debug for BLSSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLSSecretKey(..)")
    }
}

/// BLS public key wrapper
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BLSPublicKey {
    inner: BlstPublicKey,
}

impl BLSPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstPublicKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }

    /// Sum of public keys, the verification key of an aggregate signature
    pub fn aggregate(keys: &[&BLSPublicKey]) -> Result<BLSPublicKey, BLSError> {
        if keys.is_empty() {
            return Err(BLSError::EmptyAggregate);
        }
        let pks: Vec<&BlstPublicKey> = keys.iter().map(|pk| &pk.inner).collect();
        let aggregated = AggregatePublicKey::aggregate(&pks, false)
            .map_err(|_| BLSError::InvalidKey)?
            .to_public_key();
        Ok(BLSPublicKey { inner: aggregated })
    }
}

/// BLS signature wrapper
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BLSSignature {
    inner: BlstSignature,
}

impl BLSSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSignature::from_bytes(bytes).map_err(|_| BLSError::InvalidSignature)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }

    /// Combine signatures over the same message by point addition
    pub fn aggregate(signatures: &[&BLSSignature]) -> Result<BLSSignature, BLSError> {
        if signatures.is_empty() {
            return Err(BLSError::EmptyAggregate);
        }
        let sigs: Vec<&BlstSignature> = signatures.iter().map(|s| &s.inner).collect();
        let combined = AggregateSignature::aggregate(&sigs, false)
            .map_err(|_| BLSError::InvalidSignature)?
            .to_signature();
        Ok(BLSSignature { inner: combined })
    }

    /// Verify against a single (possibly aggregated) public key
    pub fn verify(&self, message: &[u8], public_key: &BLSPublicKey) -> bool {
        let result = self
            .inner
            .verify(true, message, BLS_DST, &[], &public_key.inner, true);
        result == blst::BLST_ERROR::BLST_SUCCESS
    }

    /// Verify an aggregate signature where every signer signed `message`
    pub fn verify_aggregate(
        &self,
        message: &[u8],
        public_keys: &[&BLSPublicKey],
    ) -> Result<(), BLSError> {
        let aggregated = BLSPublicKey::aggregate(public_keys)?;
        if self.verify(message, &aggregated) {
            Ok(())
        } else {
            Err(BLSError::VerificationFailed)
        }
    }
}

/// Signature bytes as they travel on the wire and rest in the journal.
///
/// Decoding into a curve point is deferred until the signature is
/// verified or aggregated, so a malformed signature is reported where
/// it is used instead of failing message decoding.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn decode(&self) -> Result<BLSSignature, BLSError> {
        BLSSignature::from_bytes(&self.0)
    }
}

impl From<BLSSignature> for Signature {
    fn from(sig: BLSSignature) -> Self {
        Self(sig.to_bytes())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.0[..self.0.len().min(8)];
        write!(f, "Signature({}..)", hex::encode(head))
    }
}

/// BLS key pair (secret + public key)
#[derive(Clone, Debug)]
pub struct BLSKeyPair {
    pub secret_key: BLSSecretKey,
    pub public_key: BLSPublicKey,
}

impl BLSKeyPair {
    pub fn generate() -> Self {
        let secret_key = BLSSecretKey::generate();
        let public_key = secret_key.public_key();
        Self {
            secret_key,
            public_key,
        }
    }
}

// Public keys appear in validator descriptors, which are written as JSON
// and bincode; encode them as raw bytes.
impl Serialize for BLSPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for BLSPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct BLSPublicKeyVisitor;

        impl<'de> Visitor<'de> for BLSPublicKeyVisitor {
            type Value = BLSPublicKey;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a BLS public key byte array")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                BLSPublicKey::from_bytes(v).map_err(de::Error::custom)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(BLS_PUBLIC_KEY_SIZE);
                while let Some(byte) = seq.next_element()? {
                    bytes.push(byte);
                }
                BLSPublicKey::from_bytes(&bytes).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_bytes(BLSPublicKeyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<BLSKeyPair> {
        (0..n).map(|_| BLSKeyPair::generate()).collect()
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = BLSKeyPair::generate();
        let sig = kp.secret_key.sign(b"block");
        assert!(sig.verify(b"block", &kp.public_key));
        assert!(!sig.verify(b"other block", &kp.public_key));
    }

    #[test]
    fn test_aggregate_verifies_against_signers() {
        let validators = keys(4);
        let message = b"epoch 1 view 3";
        let sigs: Vec<BLSSignature> = validators[0..3]
            .iter()
            .map(|kp| kp.secret_key.sign(message))
            .collect();
        let refs: Vec<&BLSSignature> = sigs.iter().collect();
        let combined = BLSSignature::aggregate(&refs).unwrap();

        let pks: Vec<&BLSPublicKey> = validators[0..3].iter().map(|kp| &kp.public_key).collect();
        assert!(combined.verify_aggregate(message, &pks).is_ok());

        // Claiming a signer that did not sign breaks the equation
        let wrong: Vec<&BLSPublicKey> = validators[1..4].iter().map(|kp| &kp.public_key).collect();
        assert_eq!(
            combined.verify_aggregate(message, &wrong),
            Err(BLSError::VerificationFailed)
        );
    }

    #[test]
    fn test_empty_aggregate_rejected() {
        assert_eq!(BLSSignature::aggregate(&[]), Err(BLSError::EmptyAggregate));
        assert!(matches!(BLSPublicKey::aggregate(&[]), Err(BLSError::EmptyAggregate)));
    }

    #[test]
    fn test_signature_bytes_roundtrip() {
        let kp = BLSKeyPair::generate();
        let sig = kp.secret_key.sign(b"payload");
        let wire = Signature::from(sig.clone());
        assert_eq!(wire.as_bytes().len(), BLS_SIGNATURE_SIZE);
        assert_eq!(wire.decode().unwrap(), sig);
        assert_eq!(
            Signature::from_bytes(vec![1, 2, 3]).decode(),
            Err(BLSError::InvalidSignature)
        );
    }

    #[test]
    fn test_public_key_serde() {
        let kp = BLSKeyPair::generate();
        let encoded = bincode::serialize(&kp.public_key).unwrap();
        let decoded: BLSPublicKey = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, kp.public_key);

        let json = serde_json::to_string(&kp.public_key).unwrap();
        let decoded: BLSPublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, kp.public_key);
    }

    #[test]
    fn test_secret_key_bytes_roundtrip() {
        let sk = BLSSecretKey::generate();
        let restored = BLSSecretKey::from_bytes(&sk.to_bytes()).unwrap();
        assert_eq!(restored.public_key(), sk.public_key());
    }
}
