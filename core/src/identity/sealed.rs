// Sealed boxes: anonymous-sender public-key encryption.
//
// Flow:
// 1. Generate an ephemeral X25519 keypair for this message
// 2. ECDH: ephemeral_secret × recipient_public → shared_secret
// 3. KDF: Blake3::derive_key(shared_secret) → symmetric_key
// 4. Encrypt: XChaCha20-Poly1305(symmetric_key, random_nonce, plaintext)
// 5. Output: base64(ephemeral_pub || nonce || ciphertext)
//
// Nothing in the output identifies the sender; origin is proven by the
// envelope signature, not the ciphertext.

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// KDF context string for deriving sealed-box keys from ECDH shared secrets.
/// Changing this breaks compatibility with all existing ciphertexts.
const KDF_CONTEXT: &str = "agentmail v0 sealed box";

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT, shared_secret)
}

/// Seal `plaintext` to the given base64 X25519 public key.
pub fn seal(plaintext: &[u8], recipient_pubkey_b64: &str) -> Result<String> {
    let key_bytes = STANDARD.decode(recipient_pubkey_b64)?;
    let key_arr = <[u8; 32]>::try_from(key_bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("Invalid recipient encryption key length"))?;
    let recipient = X25519PublicKey::from(key_arr);

    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient);
    let mut symmetric_key = derive_key(shared_secret.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

    symmetric_key.zeroize();

    let mut out = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(out))
}

/// Open a sealed box with the recipient's X25519 secret. Fails if the box
/// was sealed to a different key or has been tampered with.
pub fn open(ciphertext_b64: &str, recipient_secret: &StaticSecret) -> Result<Vec<u8>> {
    let data = STANDARD.decode(ciphertext_b64)?;
    if data.len() < EPHEMERAL_LEN + NONCE_LEN + TAG_LEN {
        bail!("Sealed box too short");
    }

    let mut ephemeral_bytes = [0u8; EPHEMERAL_LEN];
    ephemeral_bytes.copy_from_slice(&data[..EPHEMERAL_LEN]);
    let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);

    let nonce = XNonce::from_slice(&data[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN]);
    let ciphertext = &data[EPHEMERAL_LEN + NONCE_LEN..];

    let shared_secret = recipient_secret.diffie_hellman(&ephemeral_public);
    let mut symmetric_key = derive_key(shared_secret.as_bytes());

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("Decryption failed: not addressed to this key or tampered"));

    symmetric_key.zeroize();

    plaintext
}

#[cfg(test)]
mod tests {
    use super::super::Identity;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[test]
    fn test_seal_open_round_trip() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let sealed = alice
            .seal_for(b"for bob only", &bob.encrypt_pubkey_b64())
            .unwrap();
        let opened = bob.open(&sealed).unwrap();
        assert_eq!(opened, b"for bob only");
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let eve = Identity::generate();

        let sealed = alice.seal_for(b"secret", &bob.encrypt_pubkey_b64()).unwrap();
        assert!(eve.open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let sealed = alice.seal_for(b"secret", &bob.encrypt_pubkey_b64()).unwrap();
        let mut bytes = STANDARD.decode(&sealed).unwrap();
        *bytes.last_mut().unwrap() ^= 0xFF;
        let tampered = STANDARD.encode(bytes);
        assert!(bob.open(&tampered).is_err());
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let a = alice.seal_for(b"repeat", &bob.encrypt_pubkey_b64()).unwrap();
        let b = alice.seal_for(b"repeat", &bob.encrypt_pubkey_b64()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ciphertext_carries_no_sender_key() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let sealed = alice.seal_for(b"anon", &bob.encrypt_pubkey_b64()).unwrap();
        let bytes = STANDARD.decode(&sealed).unwrap();
        let alice_sign = STANDARD.decode(alice.pubkey_b64()).unwrap();
        let alice_enc = STANDARD.decode(alice.encrypt_pubkey_b64()).unwrap();
        assert!(!contains(&bytes, &alice_sign));
        assert!(!contains(&bytes, &alice_enc));
    }

    #[test]
    fn test_truncated_input_fails() {
        let bob = Identity::generate();
        let short = STANDARD.encode([0u8; 40]);
        assert!(bob.open(&short).is_err());
        assert!(bob.open("not base64!!").is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let sealed = alice.seal_for(b"", &bob.encrypt_pubkey_b64()).unwrap();
        assert!(bob.open(&sealed).unwrap().is_empty());
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}
