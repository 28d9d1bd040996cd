//! Encrypted on-disk key store: one JSON file per wallet, secret keys
//! sealed with PBKDF2-HMAC-SHA256 and AES-256-GCM.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use rand::RngCore;
use sentra_core::{Address, Transaction};
use sentra_crypto::{derive_address, generate_keypair, sign_transaction};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const PBKDF2_ROUNDS: u32 = 10_000;
const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub name: String,
    pub address: Address,
    pub public_key: Vec<u8>,
    pub encrypted_secret: Vec<u8>,
    pub nonce: [u8; 12],
}

impl Wallet {
    /// Unseals the secret key and signs the transaction's canonical bytes.
    pub fn sign(&self, password: &str, tx: &Transaction) -> Result<Vec<u8>> {
        let secret = decrypt_secret(&self.encrypted_secret, &self.nonce, password)?;
        sign_transaction(&secret, tx)
    }
}

pub struct WalletStore {
    root: PathBuf,
}

impl WalletStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn create(&self, name: &str, password: &str) -> Result<Wallet> {
        let path = self.path_for(name);
        if path.exists() {
            return Err(anyhow!("wallet {name} already exists"));
        }
        let kp = generate_keypair();
        let (encrypted_secret, nonce) = encrypt_secret(&kp.secret_key, password)?;
        let wallet = Wallet {
            name: name.to_string(),
            address: derive_address(&kp.public_key),
            public_key: kp.public_key,
            encrypted_secret,
            nonce,
        };
        fs::write(&path, serde_json::to_vec_pretty(&wallet)?)?;
        Ok(wallet)
    }

    pub fn load(&self, name: &str) -> Result<Wallet> {
        let bytes = fs::read(self.path_for(name))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn list(&self) -> Result<Vec<Wallet>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let bytes = fs::read(entry.path())?;
                out.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(out)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }
}

fn encrypt_secret(secret: &[u8], password: &str) -> Result<(Vec<u8>, [u8; 12])> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), secret)
        .map_err(|e| anyhow!("encrypt failed: {e}"))?;
    let mut sealed = salt.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok((sealed, nonce_bytes))
}

fn decrypt_secret(sealed: &[u8], nonce: &[u8; 12], password: &str) -> Result<Vec<u8>> {
    if sealed.len() < SALT_LEN {
        return Err(anyhow!("sealed secret too short"));
    }
    let (salt, ciphertext) = sealed.split_at(SALT_LEN);
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("wrong password or corrupted wallet file"))
}
