// Cryptographic identity: one Ed25519 seed defines both the signing keypair
// and the derived X25519 encryption keypair.

use anyhow::Result;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::sealed;

/// Length of the URL-safe fingerprint used as the relay routing handle.
pub const FINGERPRINT_LEN: usize = 16;

/// A node's cryptographic identity.
pub struct Identity {
    signing_key: SigningKey,
    encrypt_secret: StaticSecret,
    encrypt_public: X25519PublicKey,
}

impl Identity {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let encrypt_secret = ed25519_to_x25519_secret(&signing_key);
        let encrypt_public = X25519PublicKey::from(&encrypt_secret);
        Self {
            signing_key,
            encrypt_secret,
            encrypt_public,
        }
    }

    /// Generate a new random identity.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self::from_signing_key(signing_key)
    }

    pub(crate) fn signing_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Base64 Ed25519 verify key.
    pub fn pubkey_b64(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Base64 X25519 encryption public key.
    pub fn encrypt_pubkey_b64(&self) -> String {
        STANDARD.encode(self.encrypt_public.to_bytes())
    }

    /// Short URL-safe fingerprint; stable for the lifetime of the identity.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.signing_key.verifying_key().to_bytes())
    }

    /// Detached signature over `data`, base64-encoded.
    pub fn sign(&self, data: &[u8]) -> String {
        STANDARD.encode(self.signing_key.sign(data).to_bytes())
    }

    /// Stateless signature check. Any structural or cryptographic failure is
    /// simply "not valid".
    pub fn verify(data: &[u8], signature_b64: &str, pubkey_b64: &str) -> bool {
        let Ok(sig_bytes) = STANDARD.decode(signature_b64) else {
            return false;
        };
        let Ok(key_bytes) = STANDARD.decode(pubkey_b64) else {
            return false;
        };
        let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
            return false;
        };
        let Ok(key_arr) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_arr) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_arr);
        verifying_key.verify(data, &signature).is_ok()
    }

    /// Seal `plaintext` so only the holder of the recipient key can read it.
    pub fn seal_for(&self, plaintext: &[u8], recipient_enc_pubkey_b64: &str) -> Result<String> {
        sealed::seal(plaintext, recipient_enc_pubkey_b64)
    }

    /// Open a sealed box addressed to this node.
    pub fn open(&self, ciphertext_b64: &str) -> Result<Vec<u8>> {
        sealed::open(ciphertext_b64, &self.encrypt_secret)
    }
}

/// Fingerprint rule shared by identities and cached peer keys: the first 16
/// characters of the URL-safe base64 encoding of the Ed25519 verify key.
pub fn fingerprint_of(verify_key: &[u8]) -> String {
    URL_SAFE
        .encode(verify_key)
        .chars()
        .take(FINGERPRINT_LEN)
        .collect()
}

/// Fingerprint from a standard-base64 verify key, as cached in peer records.
pub fn fingerprint_of_b64(pubkey_b64: &str) -> Result<String> {
    let bytes = STANDARD.decode(pubkey_b64)?;
    Ok(fingerprint_of(&bytes))
}

/// Convert an Ed25519 signing key to an X25519 static secret for ECDH.
///
/// Ed25519 and X25519 share Curve25519; the X25519 secret is the clamped
/// SHA-512 hash of the Ed25519 seed, which is how Ed25519 derives its own
/// scalar internally.
fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Convert an Ed25519 verify key to the matching X25519 public key via the
/// Edwards→Montgomery birational map: u = (1 + y) / (1 - y) mod p.
pub(crate) fn ed25519_public_to_x25519(public_key_bytes: &[u8; 32]) -> Result<X25519PublicKey> {
    let compressed = CompressedEdwardsY::from_slice(public_key_bytes)
        .map_err(|_| anyhow::anyhow!("Invalid Ed25519 public key"))?;

    let edwards_point = compressed
        .decompress()
        .ok_or_else(|| anyhow::anyhow!("Failed to decompress Ed25519 public key"))?;

    Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}
