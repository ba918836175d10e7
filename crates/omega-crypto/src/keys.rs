//! Discovery keys and connection capabilities.

use crate::hashing::{Blake3Hasher, Hash};

const DISCOVERY_CONTEXT: &[u8] = b"omega discovery";
const INITIATOR_TAG: &[u8] = b"omega capability initiator";
const RESPONDER_TAG: &[u8] = b"omega capability responder";

/// Public rendezvous key derived from a core's public key.
///
/// Peers announce this instead of the public key so onlookers cannot
/// learn which core is being replicated.
pub fn discovery_key(public_key: &[u8; 32]) -> Hash {
    let mut hasher = Blake3Hasher::new_keyed(public_key);
    hasher.update(DISCOVERY_CONTEXT);
    hasher.finalize()
}

/// Capability proving knowledge of `public_key` within one transport session.
pub fn capability(is_initiator: bool, handshake_hash: &Hash, public_key: &[u8; 32]) -> Hash {
    let tag = if is_initiator {
        INITIATOR_TAG
    } else {
        RESPONDER_TAG
    };

    let mut hasher = Blake3Hasher::new_keyed(handshake_hash);
    hasher.update(tag).update(public_key);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_key_hides_public_key() {
        let key = [3u8; 32];
        assert_ne!(discovery_key(&key), key);
        assert_eq!(discovery_key(&key), discovery_key(&key));
    }

    #[test]
    fn test_capability_depends_on_role() {
        let hs = [9u8; 32];
        let key = [1u8; 32];
        assert_ne!(capability(true, &hs, &key), capability(false, &hs, &key));
    }

    #[test]
    fn test_capability_depends_on_session() {
        let key = [1u8; 32];
        assert_ne!(
            capability(true, &[1u8; 32], &key),
            capability(true, &[2u8; 32], &key)
        );
    }
}
