use crate::errors::NotaryError;
use crate::types::{BoxHash, Notice, Reply, Request};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey as PublicKey};
use sha2::{Digest, Sha256};

/// Keypair wrapper used by both sides: the client signs requests, the notary
/// signs replies. Number closing on the client requires a verified reply.
pub struct Crypto {
    public_key: PublicKey,
    signing_key: SigningKey,
}

impl Crypto {
    pub fn from_secret_key(secret_key: &[u8; 32]) -> Result<Self, NotaryError> {
        let signing_key = SigningKey::from_bytes(secret_key);
        let public_key = signing_key.verifying_key();
        Ok(Crypto {
            public_key,
            signing_key,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Stable identity digest of the verifying key, used for both nym and
    /// notary ids.
    pub fn identity(&self) -> [u8; 32] {
        Self::identity_of(&self.public_key)
    }

    pub fn identity_of(key: &PublicKey) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(key.to_bytes());
        hasher.finalize().into()
    }

    pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, NotaryError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NotaryError::Serialization("bad public key length".to_string()))?;
        PublicKey::from_bytes(&raw)
            .map_err(|_| NotaryError::Serialization("malformed public key".to_string()))
    }

    pub fn sign_request(&self, request: &mut Request) -> Result<(), NotaryError> {
        request.signature.clear();
        let message = bincode::encode_to_vec(&*request, bincode::config::standard())
            .map_err(|e| NotaryError::Serialization(e.to_string()))?;
        request.signature = self.signing_key.sign(&message).to_vec();
        Ok(())
    }

    pub fn verify_request(request: &Request, public_key: &PublicKey) -> Result<(), NotaryError> {
        let mut unsigned = request.clone();
        unsigned.signature.clear();
        let message = bincode::encode_to_vec(&unsigned, bincode::config::standard())
            .map_err(|e| NotaryError::Serialization(e.to_string()))?;
        let signature = Signature::from_slice(&request.signature)
            .map_err(|_| NotaryError::InvalidSignature)?;
        public_key
            .verify(&message, &signature)
            .map_err(|_| NotaryError::InvalidSignature)
    }

    pub fn sign_reply(&self, reply: &mut Reply) -> Result<(), NotaryError> {
        reply.signature.clear();
        let message = bincode::encode_to_vec(&*reply, bincode::config::standard())
            .map_err(|e| NotaryError::Serialization(e.to_string()))?;
        reply.signature = self.signing_key.sign(&message).to_vec();
        Ok(())
    }

    pub fn verify_reply(reply: &Reply, public_key: &PublicKey) -> Result<(), NotaryError> {
        let mut unsigned = reply.clone();
        unsigned.signature.clear();
        let message = bincode::encode_to_vec(&unsigned, bincode::config::standard())
            .map_err(|e| NotaryError::Serialization(e.to_string()))?;
        let signature =
            Signature::from_slice(&reply.signature).map_err(|_| NotaryError::InvalidSignature)?;
        public_key
            .verify(&message, &signature)
            .map_err(|_| NotaryError::InvalidSignature)
    }

    /// Digest of a nymbox. The empty box hashes to all zeroes, which is also
    /// the hash a fresh session starts from.
    pub fn nymbox_hash(notices: &[Notice]) -> BoxHash {
        if notices.is_empty() {
            return [0u8; 32];
        }
        let mut hasher = Sha256::new();
        for notice in notices {
            hasher.update(notice.id.to_be_bytes());
            hasher.update(&notice.body);
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NoticeKind, RequestKind};

    fn sample_request() -> Request {
        Request {
            request_number: 1,
            nym_id: [1u8; 32],
            notary_id: [2u8; 32],
            kind: RequestKind::GetNymbox,
            numbers: vec![],
            acknowledged: vec![],
            local_box_hash: [0u8; 32],
            payload: vec![],
            signature: vec![],
        }
    }

    #[test]
    fn signed_request_verifies() {
        let crypto = Crypto::from_secret_key(&[7u8; 32]).unwrap();
        let mut request = sample_request();
        crypto.sign_request(&mut request).unwrap();
        Crypto::verify_request(&request, &crypto.public_key()).unwrap();
    }

    #[test]
    fn tampered_request_fails_verification() {
        let crypto = Crypto::from_secret_key(&[7u8; 32]).unwrap();
        let mut request = sample_request();
        crypto.sign_request(&mut request).unwrap();
        request.numbers.push(42);
        assert!(Crypto::verify_request(&request, &crypto.public_key()).is_err());
    }

    #[test]
    fn nymbox_hash_tracks_contents() {
        assert_eq!(Crypto::nymbox_hash(&[]), [0u8; 32]);
        let a = vec![Notice {
            id: 1,
            kind: NoticeKind::Receipt,
            body: vec![1, 2, 3],
        }];
        let b = vec![Notice {
            id: 2,
            kind: NoticeKind::Receipt,
            body: vec![1, 2, 3],
        }];
        assert_ne!(Crypto::nymbox_hash(&a), Crypto::nymbox_hash(&b));
        assert_eq!(Crypto::nymbox_hash(&a), Crypto::nymbox_hash(&a));
    }
}
