use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, SignerError};

/// Encrypts private key material at rest with AES-256-GCM.
///
/// Sealed form: nonce (12) || ciphertext || tag (16).
pub struct KeySealer {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl KeySealer {
    /// Create a sealer from a 32-byte master key
    pub fn new(master_key: &[u8]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, master_key)
            .map_err(|_| SignerError::Crypto("master key must be 32 bytes".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Create a sealer with a random key that only lives for this process
    pub fn ephemeral() -> Result<Self> {
        let rng = SystemRandom::new();
        let mut master_key = [0u8; 32];
        rng.fill(&mut master_key)
            .map_err(|_| SignerError::Crypto("random source unavailable".to_string()))?;
        Self::new(&master_key)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| SignerError::Crypto("random source unavailable".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| SignerError::Crypto("failed to seal private key".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(SignerError::Crypto("sealed key is truncated".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| SignerError::Crypto("invalid nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                SignerError::Crypto("failed to open private key (wrong master key?)".to_string())
            })?;
        Ok(plaintext.to_vec())
    }
}
