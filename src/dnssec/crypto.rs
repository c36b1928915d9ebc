//! Key generation and signature primitives.
//!
//! The signing core only sees the [`CryptoProvider`] trait. The default
//! provider uses `ring` for ECDSA and Ed25519 and OpenSSL for the RSA
//! family and Ed448, which `ring` does not generate.

use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair};
use tracing::debug;

use super::DnsSecAlgorithm;
use crate::error::{Result, SignerError};

/// Freshly generated key material
pub struct GeneratedKey {
    /// Public key in DNSKEY wire form for the algorithm
    pub public_key: Vec<u8>,
    /// Private key as PKCS#8 DER
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for GeneratedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedKey")
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

/// Cryptography capability consumed by the key store and the signer
pub trait CryptoProvider: Send + Sync {
    /// Generate a key pair; `key_size` has already been validated
    fn generate(&self, algorithm: DnsSecAlgorithm, key_size: Option<u32>) -> Result<GeneratedKey>;

    /// Sign `data`, returning the signature in RRSIG wire form
    fn sign(&self, algorithm: DnsSecAlgorithm, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature produced by [`CryptoProvider::sign`]
    fn verify(
        &self,
        algorithm: DnsSecAlgorithm,
        public_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool>;
}

/// Default provider backed by `ring` and OpenSSL
pub struct SystemCryptoProvider {
    rng: SystemRandom,
}

impl SystemCryptoProvider {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    fn ecdsa_signing_algorithm(
        algorithm: DnsSecAlgorithm,
    ) -> Option<&'static signature::EcdsaSigningAlgorithm> {
        match algorithm {
            DnsSecAlgorithm::EcdsaP256Sha256 => Some(&signature::ECDSA_P256_SHA256_FIXED_SIGNING),
            DnsSecAlgorithm::EcdsaP384Sha384 => Some(&signature::ECDSA_P384_SHA384_FIXED_SIGNING),
            _ => None,
        }
    }

    fn rsa_digest(algorithm: DnsSecAlgorithm) -> Option<MessageDigest> {
        match algorithm {
            DnsSecAlgorithm::RsaSha256 => Some(MessageDigest::sha256()),
            DnsSecAlgorithm::RsaSha512 => Some(MessageDigest::sha512()),
            _ => None,
        }
    }

    fn generate_ecdsa(
        &self,
        alg: &'static signature::EcdsaSigningAlgorithm,
    ) -> Result<GeneratedKey> {
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(alg, &self.rng).map_err(crypto_err)?;
        let key_pair =
            EcdsaKeyPair::from_pkcs8(alg, pkcs8.as_ref(), &self.rng).map_err(crypto_err)?;

        // ring returns 0x04 || X || Y; DNSKEY carries X || Y (RFC 6605)
        let public_key = key_pair.public_key().as_ref()[1..].to_vec();

        Ok(GeneratedKey {
            public_key,
            private_key: pkcs8.as_ref().to_vec(),
        })
    }

    fn generate_ed25519(&self) -> Result<GeneratedKey> {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&self.rng).map_err(crypto_err)?;
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(crypto_err)?;

        Ok(GeneratedKey {
            public_key: key_pair.public_key().as_ref().to_vec(),
            private_key: pkcs8.as_ref().to_vec(),
        })
    }

    fn generate_rsa(&self, bits: u32) -> Result<GeneratedKey> {
        let rsa = Rsa::generate(bits).map_err(crypto_err)?;
        let public_key = rsa_public_key_wire(&rsa.e().to_vec(), &rsa.n().to_vec());
        let pkey = PKey::from_rsa(rsa).map_err(crypto_err)?;
        let private_key = pkey.private_key_to_pkcs8().map_err(crypto_err)?;

        Ok(GeneratedKey {
            public_key,
            private_key,
        })
    }

    fn generate_ed448(&self) -> Result<GeneratedKey> {
        let pkey = PKey::generate_ed448().map_err(crypto_err)?;
        Ok(GeneratedKey {
            public_key: pkey.raw_public_key().map_err(crypto_err)?,
            private_key: pkey.private_key_to_pkcs8().map_err(crypto_err)?,
        })
    }
}

impl Default for SystemCryptoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for SystemCryptoProvider {
    fn generate(&self, algorithm: DnsSecAlgorithm, key_size: Option<u32>) -> Result<GeneratedKey> {
        debug!("Generating {} key (size {:?})", algorithm, key_size);
        match algorithm {
            DnsSecAlgorithm::EcdsaP256Sha256 | DnsSecAlgorithm::EcdsaP384Sha384 => {
                let alg = Self::ecdsa_signing_algorithm(algorithm)
                    .ok_or_else(|| unsupported(algorithm))?;
                self.generate_ecdsa(alg)
            }
            DnsSecAlgorithm::Ed25519 => self.generate_ed25519(),
            DnsSecAlgorithm::Ed448 => self.generate_ed448(),
            DnsSecAlgorithm::RsaSha256 | DnsSecAlgorithm::RsaSha512 => {
                let bits = key_size.ok_or_else(|| {
                    SignerError::InvalidKeySize(format!("{} requires a key size", algorithm))
                })?;
                self.generate_rsa(bits)
            }
            other => Err(unsupported(other)),
        }
    }

    fn sign(&self, algorithm: DnsSecAlgorithm, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match algorithm {
            DnsSecAlgorithm::EcdsaP256Sha256 | DnsSecAlgorithm::EcdsaP384Sha384 => {
                let alg = Self::ecdsa_signing_algorithm(algorithm)
                    .ok_or_else(|| unsupported(algorithm))?;
                let key_pair =
                    EcdsaKeyPair::from_pkcs8(alg, private_key, &self.rng).map_err(crypto_err)?;
                let sig = key_pair.sign(&self.rng, data).map_err(crypto_err)?;
                Ok(sig.as_ref().to_vec())
            }
            DnsSecAlgorithm::Ed25519 => {
                let key_pair = Ed25519KeyPair::from_pkcs8(private_key).map_err(crypto_err)?;
                Ok(key_pair.sign(data).as_ref().to_vec())
            }
            DnsSecAlgorithm::Ed448 => {
                let pkey = PKey::private_key_from_pkcs8(private_key).map_err(crypto_err)?;
                let mut signer = Signer::new_without_digest(&pkey).map_err(crypto_err)?;
                signer.sign_oneshot_to_vec(data).map_err(crypto_err)
            }
            DnsSecAlgorithm::RsaSha256 | DnsSecAlgorithm::RsaSha512 => {
                let digest = Self::rsa_digest(algorithm).ok_or_else(|| unsupported(algorithm))?;
                let pkey = PKey::private_key_from_pkcs8(private_key).map_err(crypto_err)?;
                let mut signer = Signer::new(digest, &pkey).map_err(crypto_err)?;
                signer.update(data).map_err(crypto_err)?;
                signer.sign_to_vec().map_err(crypto_err)
            }
            other => Err(unsupported(other)),
        }
    }

    fn verify(
        &self,
        algorithm: DnsSecAlgorithm,
        public_key: &[u8],
        data: &[u8],
        sig: &[u8],
    ) -> Result<bool> {
        match algorithm {
            DnsSecAlgorithm::EcdsaP256Sha256 | DnsSecAlgorithm::EcdsaP384Sha384 => {
                let alg: &'static dyn signature::VerificationAlgorithm =
                    if algorithm == DnsSecAlgorithm::EcdsaP256Sha256 {
                        &signature::ECDSA_P256_SHA256_FIXED
                    } else {
                        &signature::ECDSA_P384_SHA384_FIXED
                    };
                let mut uncompressed = Vec::with_capacity(public_key.len() + 1);
                uncompressed.push(0x04);
                uncompressed.extend_from_slice(public_key);
                Ok(signature::UnparsedPublicKey::new(alg, &uncompressed)
                    .verify(data, sig)
                    .is_ok())
            }
            DnsSecAlgorithm::Ed25519 => Ok(signature::UnparsedPublicKey::new(
                &signature::ED25519,
                public_key,
            )
            .verify(data, sig)
            .is_ok()),
            DnsSecAlgorithm::Ed448 => {
                let pkey = PKey::public_key_from_raw_bytes(public_key, Id::ED448)
                    .map_err(crypto_err)?;
                let mut verifier = Verifier::new_without_digest(&pkey).map_err(crypto_err)?;
                verifier.verify_oneshot(sig, data).map_err(crypto_err)
            }
            DnsSecAlgorithm::RsaSha256 | DnsSecAlgorithm::RsaSha512 => {
                let digest = Self::rsa_digest(algorithm).ok_or_else(|| unsupported(algorithm))?;
                let (exponent, modulus) = parse_rsa_public_key(public_key)?;
                let rsa = Rsa::from_public_components(
                    BigNum::from_slice(modulus).map_err(crypto_err)?,
                    BigNum::from_slice(exponent).map_err(crypto_err)?,
                )
                .map_err(crypto_err)?;
                let pkey = PKey::from_rsa(rsa).map_err(crypto_err)?;
                let mut verifier = Verifier::new(digest, &pkey).map_err(crypto_err)?;
                verifier.update(data).map_err(crypto_err)?;
                verifier.verify(sig).map_err(crypto_err)
            }
            other => Err(unsupported(other)),
        }
    }
}

/// Encode an RSA public key as DNSKEY data (RFC 3110 Section 2)
pub fn rsa_public_key_wire(exponent: &[u8], modulus: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + exponent.len() + modulus.len());
    if exponent.len() <= 255 {
        out.push(exponent.len() as u8);
    } else {
        out.push(0);
        out.extend_from_slice(&(exponent.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(exponent);
    out.extend_from_slice(modulus);
    out
}

/// Split RFC 3110 DNSKEY data into (exponent, modulus)
pub fn parse_rsa_public_key(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let invalid = || SignerError::Crypto("malformed RSA public key".to_string());
    let (exp_len, offset) = match data.first() {
        Some(0) if data.len() >= 3 => (u16::from_be_bytes([data[1], data[2]]) as usize, 3),
        Some(&len) if len != 0 => (len as usize, 1),
        _ => return Err(invalid()),
    };
    if data.len() <= offset + exp_len {
        return Err(invalid());
    }
    Ok((
        &data[offset..offset + exp_len],
        &data[offset + exp_len..],
    ))
}

fn unsupported(algorithm: DnsSecAlgorithm) -> SignerError {
    SignerError::InvalidAlgorithm(algorithm.to_string())
}

fn crypto_err<E: std::fmt::Display>(err: E) -> SignerError {
    SignerError::Crypto(err.to_string())
}
