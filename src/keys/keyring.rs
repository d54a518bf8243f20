use crate::error::{LedgerError, Result};
use crate::utils::{ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, new_key_pair};
use data_encoding::HEXLOWER;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use std::fs;
use std::path::{Path, PathBuf};

const PRIVATE_DIR: &str = ".private";
const PUBLIC_DIR: &str = "public";
const SIGNATURE_DIR: &str = "signature";

/// An ECDSA P-256 key pair used to sign book transfers.
///
/// The sender identity of a signed transfer is the hex encoding of the
/// public key, so verification needs nothing beyond the transaction.
pub struct Keyring {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl Keyring {
    /// Generate a fresh key pair.
    pub fn generate() -> Result<Keyring> {
        let pkcs8 = new_key_pair()?;
        let public_key = public_key_from_pkcs8(&pkcs8)?;
        Ok(Keyring { pkcs8, public_key })
    }

    /// Load a named key pair from the keys directory.
    pub fn load(dir: &str, name: &str) -> Result<Keyring> {
        let pkcs8 = fs::read(private_key_path(dir, name)).map_err(|e| {
            LedgerError::Io(format!("Failed to read private key '{name}': {e}"))
        })?;
        let public_key = public_key_from_pkcs8(&pkcs8)?;
        Ok(Keyring { pkcs8, public_key })
    }

    /// Save the key pair under the fixed directory layout, creating the
    /// layout if needed.
    pub fn save(&self, dir: &str, name: &str) -> Result<()> {
        create_layout(dir)?;
        fs::write(private_key_path(dir, name), &self.pkcs8)
            .map_err(|e| LedgerError::Io(format!("Failed to write private key '{name}': {e}")))?;
        fs::write(
            public_key_path(dir, name),
            HEXLOWER.encode(&self.public_key),
        )
        .map_err(|e| LedgerError::Io(format!("Failed to write public key '{name}': {e}")))?;
        Ok(())
    }

    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    /// The identity this keyring signs as: hex of the public key.
    pub fn public_identity(&self) -> String {
        HEXLOWER.encode(&self.public_key)
    }

    /// Sign arbitrary data with the private key.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        ecdsa_p256_sha256_sign_digest(&self.pkcs8, data)
    }

    /// Sign data and also persist the signature under the layout's
    /// signature directory.
    pub fn sign_to_file(&self, dir: &str, name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let signature = self.sign(data)?;
        create_layout(dir)?;
        fs::write(signature_path(dir, name), HEXLOWER.encode(&signature))
            .map_err(|e| LedgerError::Io(format!("Failed to write signature '{name}': {e}")))?;
        Ok(signature)
    }

    /// Verify a signature against a public key.
    pub fn verify(public_key: &[u8], signature: &[u8], data: &[u8]) -> bool {
        ecdsa_p256_sha256_sign_verify(public_key, signature, data)
    }
}

fn public_key_from_pkcs8(pkcs8: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
        .map_err(|e| LedgerError::Crypto(format!("Failed to create key pair from PKCS8: {e}")))?;
    Ok(key_pair.public_key().as_ref().to_vec())
}

fn create_layout(dir: &str) -> Result<()> {
    for sub in [PRIVATE_DIR, PUBLIC_DIR, SIGNATURE_DIR] {
        let path = Path::new(dir).join(sub);
        fs::create_dir_all(&path).map_err(|e| {
            LedgerError::Io(format!("Failed to create {}: {e}", path.display()))
        })?;
    }
    Ok(())
}

fn private_key_path(dir: &str, name: &str) -> PathBuf {
    Path::new(dir).join(PRIVATE_DIR).join(format!("{name}.pk8"))
}

fn public_key_path(dir: &str, name: &str) -> PathBuf {
    Path::new(dir).join(PUBLIC_DIR).join(format!("{name}.pub"))
}

fn signature_path(dir: &str, name: &str) -> PathBuf {
    Path::new(dir).join(SIGNATURE_DIR).join(format!("{name}.sig"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sign_and_verify() {
        let keyring = Keyring::generate().unwrap();
        let signature = keyring.sign(b"catalogue entry").unwrap();
        assert!(Keyring::verify(
            keyring.get_public_key(),
            &signature,
            b"catalogue entry"
        ));
        assert!(!Keyring::verify(
            keyring.get_public_key(),
            &signature,
            b"another entry"
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        let keyring = Keyring::generate().unwrap();
        keyring.save(dir_str, "alice").unwrap();

        let loaded = Keyring::load(dir_str, "alice").unwrap();
        assert_eq!(keyring.public_identity(), loaded.public_identity());

        // A signature from the loaded keyring verifies with the original key
        let signature = loaded.sign(b"data").unwrap();
        assert!(Keyring::verify(keyring.get_public_key(), &signature, b"data"));
    }

    #[test]
    fn test_layout_directories_created() {
        let dir = tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        let keyring = Keyring::generate().unwrap();
        keyring.save(dir_str, "alice").unwrap();
        keyring.sign_to_file(dir_str, "alice", b"data").unwrap();

        assert!(dir.path().join(".private").join("alice.pk8").exists());
        assert!(dir.path().join("public").join("alice.pub").exists());
        assert!(dir.path().join("signature").join("alice.sig").exists());
    }

    #[test]
    fn test_load_missing_key_fails() {
        let dir = tempdir().unwrap();
        assert!(Keyring::load(dir.path().to_str().unwrap(), "nobody").is_err());
    }
}
