// Identity key file persistence.
//
// A single JSON document {signing_seed, verify_key, encrypt_pubkey} (all
// base64) written once with owner-only permissions and never rewritten.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroize;

use super::Identity;

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    signing_seed: String,
    verify_key: String,
    encrypt_pubkey: String,
}

/// Load the identity at `path`, or generate one and persist it there.
pub fn load_or_create(path: &Path) -> Result<Identity> {
    if path.exists() {
        return load(path);
    }
    let identity = Identity::generate();
    save(&identity, path)?;
    Ok(identity)
}

pub fn load(path: &Path) -> Result<Identity> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read identity file {}", path.display()))?;
    let file: IdentityFile = serde_json::from_str(&raw)
        .with_context(|| format!("Malformed identity file {}", path.display()))?;

    let mut seed_bytes = STANDARD.decode(&file.signing_seed)?;
    let seed = <[u8; 32]>::try_from(seed_bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("Invalid signing seed length"))?;
    let identity = Identity::from_signing_key(SigningKey::from_bytes(&seed));
    seed_bytes.zeroize();
    Ok(identity)
}

pub fn save(identity: &Identity, path: &Path) -> Result<()> {
    let mut seed = identity.signing_seed();
    let file = IdentityFile {
        signing_seed: STANDARD.encode(seed),
        verify_key: identity.pubkey_b64(),
        encrypt_pubkey: identity.encrypt_pubkey_b64(),
    };
    seed.zeroize();

    let json = serde_json::to_string_pretty(&file)?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut f = options
        .open(path)
        .with_context(|| format!("Failed to create identity file {}", path.display()))?;

    use std::io::Write as _;
    f.write_all(json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_or_create_generates_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = load_or_create(&path).unwrap();
        assert!(path.exists());

        let second = load_or_create(&path).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.pubkey_b64(), second.pubkey_b64());
        assert_eq!(first.encrypt_pubkey_b64(), second.encrypt_pubkey_b64());
    }

    #[test]
    fn test_fingerprint_stable_across_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let fp = {
            let identity = load_or_create(&path).unwrap();
            identity.fingerprint()
        };
        let reloaded = load(&path).unwrap();
        assert_eq!(fp, reloaded.fingerprint());
    }

    #[test]
    fn test_reloaded_identity_can_open_old_mail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let original = load_or_create(&path).unwrap();
        let sender = Identity::generate();
        let sealed = sender
            .seal_for(b"persisted", &original.encrypt_pubkey_b64())
            .unwrap();

        let reloaded = load(&path).unwrap();
        assert_eq!(reloaded.open(&sealed).unwrap(), b"persisted");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.json");
        load_or_create(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load(&path).is_err());
    }
}
