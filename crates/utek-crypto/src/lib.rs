//! Crypto engine for the runtime and the package loader.
//!
//! Hashing is stateless; signing/verification go through an engine that
//! holds optional key halves. Package signatures are RSA-PSS over the
//! SHA-256 digest of the canonical content hash's ASCII hex bytes.
//! Symmetric sealing is AES-256-GCM with a random 12-byte nonce prefixed
//! to the ciphertext (the 16-byte tag is appended by the cipher).

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};

pub const AEAD_NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;
const RSA_KEY_BITS: usize = 2048;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

pub fn sha512_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Digest with a caller-selected algorithm name (`sha256` or `sha512`).
pub fn hash_hex(algorithm: &str, bytes: &[u8]) -> Result<String> {
    match algorithm.to_ascii_lowercase().as_str() {
        "sha256" | "sha-256" => Ok(sha256_hex(bytes)),
        "sha512" | "sha-512" => Ok(sha512_hex(bytes)),
        other => anyhow::bail!("unsupported hash algorithm: {other:?} (expected sha256|sha512)"),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn hex_decode(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        anyhow::bail!("hex string has odd length: {}", s.len());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .with_context(|| format!("invalid hex at offset {i}"))
        })
        .collect()
}

#[derive(Clone)]
pub struct CryptoEngine {
    private_key: Option<RsaPrivateKey>,
    public_key: Option<RsaPublicKey>,
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("has_private_key", &self.private_key.is_some())
            .field("has_public_key", &self.public_key.is_some())
            .finish()
    }
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoEngine {
    pub fn new() -> Self {
        CryptoEngine {
            private_key: None,
            public_key: None,
        }
    }

    /// Engine with a freshly generated RSA-2048 key pair.
    pub fn with_generated_keys() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).context("generate RSA key")?;
        let public = RsaPublicKey::from(&private);
        Ok(CryptoEngine {
            private_key: Some(private),
            public_key: Some(public),
        })
    }

    pub fn load_private_key_pem(&mut self, pem: &str) -> Result<()> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem).context("parse PKCS#8 private key PEM")?;
        self.public_key = Some(RsaPublicKey::from(&private));
        self.private_key = Some(private);
        Ok(())
    }

    pub fn load_public_key_pem(&mut self, pem: &str) -> Result<()> {
        self.public_key =
            Some(RsaPublicKey::from_public_key_pem(pem).context("parse public key PEM")?);
        Ok(())
    }

    pub fn public_key_pem(&self) -> Result<String> {
        let key = self
            .public_key
            .as_ref()
            .context("no public key loaded")?;
        key.to_public_key_pem(LineEnding::LF)
            .context("encode public key PEM")
    }

    /// PKCS#8 export for handing the private half to a key-material store.
    pub fn private_key_pem(&self) -> Result<String> {
        let key = self
            .private_key
            .as_ref()
            .context("no private key loaded")?;
        Ok(key
            .to_pkcs8_pem(LineEnding::LF)
            .context("encode private key PEM")?
            .to_string())
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn has_public_key(&self) -> bool {
        self.public_key.is_some()
    }

    /// RSA-PSS signature over the SHA-256 digest of `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .private_key
            .as_ref()
            .context("no private key loaded for signing")?;
        let digest = Sha256::digest(data);
        key.sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), digest.as_slice())
            .context("RSA-PSS sign")
    }

    /// Verify an RSA-PSS signature. A bad signature returns `Ok(false)`;
    /// only missing key material is an error.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
        self.verify_with(self.public_key.as_ref(), data, signature)
    }

    /// Verify against an override key when the caller carries one
    /// (e.g. the VERIFY instruction's inline PEM parameter).
    pub fn verify_with(
        &self,
        key: Option<&RsaPublicKey>,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let key = key
            .or(self.public_key.as_ref())
            .context("no public key available for verification")?;
        let digest = Sha256::digest(data);
        Ok(key
            .verify(Pss::new::<Sha256>(), digest.as_slice(), signature)
            .is_ok())
    }

    pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey> {
        RsaPublicKey::from_public_key_pem(pem).context("parse public key PEM")
    }
}

/// AES-256-GCM seal: returns `nonce || ciphertext || tag`.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| anyhow::anyhow!("AEAD seal failed"))?;
    let mut out = Vec::with_capacity(AEAD_NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`seal`]. Rejects inputs too short to carry a nonce and tag,
/// and any ciphertext whose tag does not authenticate.
pub fn open(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
        anyhow::bail!(
            "sealed payload too short: {} bytes (minimum {})",
            sealed.len(),
            AEAD_NONCE_LEN + AEAD_TAG_LEN
        );
    }
    let (nonce, body) = sealed.split_at(AEAD_NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
        .map_err(|_| anyhow::anyhow!("AEAD open failed: authentication tag mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hash_hex_rejects_unknown_algorithm() {
        assert!(hash_hex("md5", b"x").is_err());
        assert!(hash_hex("sha512", b"x").is_ok());
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x00, 0x7f, 0xff, 0x10];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("abc").is_err());
        assert!(hex_decode("zz").is_err());
    }

    #[test]
    fn sign_verify_round_trip() {
        let engine = CryptoEngine::with_generated_keys().unwrap();
        let sig = engine.sign(b"payload").unwrap();
        assert!(engine.verify(b"payload", &sig).unwrap());
        assert!(!engine.verify(b"tampered", &sig).unwrap());
    }

    #[test]
    fn key_pems_round_trip_between_engines() {
        let signer = CryptoEngine::with_generated_keys().unwrap();

        let mut verifier = CryptoEngine::new();
        verifier.load_public_key_pem(&signer.public_key_pem().unwrap()).unwrap();
        assert!(verifier.has_public_key());
        assert!(!verifier.has_private_key());
        let sig = signer.sign(b"msg").unwrap();
        assert!(verifier.verify(b"msg", &sig).unwrap());

        let mut restored = CryptoEngine::new();
        restored.load_private_key_pem(&signer.private_key_pem().unwrap()).unwrap();
        assert!(restored.has_private_key());
        let sig2 = restored.sign(b"msg").unwrap();
        assert!(verifier.verify(b"msg", &sig2).unwrap());
    }

    #[test]
    fn verify_without_key_is_an_error() {
        let engine = CryptoEngine::new();
        assert!(engine.verify(b"x", b"sig").is_err());
    }

    #[test]
    fn seal_open_round_trip() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"secret", b"aad").unwrap();
        assert_eq!(open(&key, &sealed, b"aad").unwrap(), b"secret");
        assert!(open(&key, &sealed, b"other-aad").is_err());
        assert!(open(&key, &sealed[..10], b"aad").is_err());

        let mut corrupt = sealed.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        assert!(open(&key, &corrupt, b"aad").is_err());
    }

    #[test]
    fn seal_prefixes_fresh_nonce() {
        let key = [1u8; 32];
        let a = seal(&key, b"msg", b"").unwrap();
        let b = seal(&key, b"msg", b"").unwrap();
        assert_ne!(a[..AEAD_NONCE_LEN], b[..AEAD_NONCE_LEN]);
    }
}
