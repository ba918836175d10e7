//! Default authorization: a single Ed25519 key.

use crate::domain::errors::CoreError;
use crate::ports::outbound::Authorization;
use omega_crypto::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};

/// Signs through a caller-supplied function on behalf of one public key.
///
/// Signatures are accepted the same way [`Ed25519Authorization`] accepts
/// them, so the function must produce Ed25519 signatures for that key.
pub struct FnSigner {
    verifier: Ed25519Authorization,
    sign: Box<SignFn>,
}

type SignFn = dyn Fn(&[u8]) -> Result<Vec<u8>, CoreError> + Send + Sync;

impl FnSigner {
    /// Signer for the core with `public_key`.
    pub fn new<F>(public_key: [u8; 32], sign: F) -> Result<Self, CoreError>
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, CoreError> + Send + Sync + 'static,
    {
        Ok(Self {
            verifier: Ed25519Authorization::from_public_key(public_key)?,
            sign: Box::new(sign),
        })
    }
}

impl Authorization for FnSigner {
    fn public_key(&self) -> [u8; 32] {
        self.verifier.public_key()
    }

    fn can_sign(&self) -> bool {
        true
    }

    fn sign(&self, signable: &[u8]) -> Result<Vec<u8>, CoreError> {
        (self.sign)(signable)
    }

    fn accept(&self, signable: &[u8], signature: &[u8]) -> bool {
        self.verifier.accept(signable, signature)
    }
}

impl std::fmt::Debug for FnSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSigner")
            .field("public_key", &self.verifier.public_key)
            .finish_non_exhaustive()
    }
}

/// Signs with an optional key pair and accepts signatures from one public key.
#[derive(Debug, Clone)]
pub struct Ed25519Authorization {
    public_key: Ed25519PublicKey,
    key_pair: Option<Ed25519KeyPair>,
}

impl Ed25519Authorization {
    /// Writable policy owning `key_pair`.
    pub fn writer(key_pair: Ed25519KeyPair) -> Self {
        Self {
            public_key: key_pair.public_key(),
            key_pair: Some(key_pair),
        }
    }

    /// Read-only policy that only verifies.
    pub fn reader(public_key: Ed25519PublicKey) -> Self {
        Self {
            public_key,
            key_pair: None,
        }
    }

    /// Writer with a freshly generated key pair.
    pub fn generate() -> Self {
        Self::writer(Ed25519KeyPair::generate())
    }

    /// Read-only policy from raw public key bytes.
    pub fn from_public_key(bytes: [u8; 32]) -> Result<Self, CoreError> {
        Ok(Self::reader(Ed25519PublicKey::from_bytes(bytes)?))
    }
}

impl Authorization for Ed25519Authorization {
    fn public_key(&self) -> [u8; 32] {
        *self.public_key.as_bytes()
    }

    fn can_sign(&self) -> bool {
        self.key_pair.is_some()
    }

    fn sign(&self, signable: &[u8]) -> Result<Vec<u8>, CoreError> {
        let key_pair = self.key_pair.as_ref().ok_or(CoreError::SessionNotWritable)?;
        Ok(key_pair.sign(signable).as_bytes().to_vec())
    }

    fn accept(&self, signable: &[u8], signature: &[u8]) -> bool {
        match Ed25519Signature::from_slice(signature) {
            Ok(sig) => self.public_key.verify(signable, &sig).is_ok(),
            Err(_) => false,
        }
    }

    fn secret_seed(&self) -> Option<[u8; 32]> {
        self.key_pair.as_ref().map(|kp| kp.to_seed())
    }
}
