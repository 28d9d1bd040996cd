use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand::rngs::OsRng;
use sentra_core::{Address, Transaction};

pub const PUBLIC_KEY_LENGTH: usize = 32;
/// Signature blob layout: 32-byte public key followed by a 64-byte ed25519
/// signature over the transaction's signing bytes.
pub const SIGNATURE_BLOB_LENGTH: usize = PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH;

#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
}

pub fn generate_keypair() -> KeyMaterial {
    let mut csprng = OsRng;
    let signing = SigningKey::generate(&mut csprng);
    KeyMaterial {
        public_key: signing.verifying_key().to_bytes().to_vec(),
        secret_key: signing.to_bytes().to_vec(),
    }
}

/// Account identity for a public key: bs58 of its blake3 hash.
pub fn derive_address(public_key: &[u8]) -> Address {
    bs58::encode(sentra_core::blake3_hash(public_key)).into_string()
}

pub fn sign_transaction(secret_key: &[u8], tx: &Transaction) -> Result<Vec<u8>> {
    let sk: [u8; 32] = secret_key
        .try_into()
        .map_err(|_| anyhow!("bad secret key length"))?;
    let signing = SigningKey::from_bytes(&sk);
    let sig = signing.sign(&tx.signing_bytes());
    let mut blob = Vec::with_capacity(SIGNATURE_BLOB_LENGTH);
    blob.extend_from_slice(&signing.verifying_key().to_bytes());
    blob.extend_from_slice(&sig.to_bytes());
    Ok(blob)
}

/// Injected signature capability; the chain engine treats signatures as
/// opaque bytes and delegates here.
pub trait TxVerifier: Send + Sync {
    fn verify(&self, tx: &Transaction) -> bool;
}

/// Checks the embedded public key both signs the transaction and hashes to
/// the sender identity.
pub struct Ed25519Verifier;

impl TxVerifier for Ed25519Verifier {
    fn verify(&self, tx: &Transaction) -> bool {
        if tx.signature.len() != SIGNATURE_BLOB_LENGTH {
            return false;
        }
        let (pk_bytes, sig_bytes) = tx.signature.split_at(PUBLIC_KEY_LENGTH);
        if derive_address(pk_bytes) != tx.sender {
            return false;
        }
        let pk_arr: [u8; PUBLIC_KEY_LENGTH] = match pk_bytes.try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        let vk = match VerifyingKey::from_bytes(&pk_arr) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let sig_arr: [u8; SIGNATURE_LENGTH] = match sig_bytes.try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        let signature = Signature::from_bytes(&sig_arr);
        vk.verify(&tx.signing_bytes(), &signature).is_ok()
    }
}

/// Test double; accepts everything.
pub struct AcceptAllVerifier;

impl TxVerifier for AcceptAllVerifier {
    fn verify(&self, _tx: &Transaction) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_core::TxOutput;

    fn unsigned_tx(sender: Address) -> Transaction {
        Transaction {
            sender,
            outputs: vec![TxOutput {
                to: "bob".into(),
                amount: 5,
            }],
            fee: 1,
            memo: None,
            timestamp: 1_700_000_000,
            nonce: 1,
            signature: Vec::new(),
        }
    }

    #[test]
    fn sign_and_verify() {
        let kp = generate_keypair();
        let mut tx = unsigned_tx(derive_address(&kp.public_key));
        tx.signature = sign_transaction(&kp.secret_key, &tx).unwrap();
        assert!(Ed25519Verifier.verify(&tx));
    }

    #[test]
    fn rejects_wrong_sender() {
        let kp = generate_keypair();
        let mut tx = unsigned_tx("someone_else".into());
        tx.signature = sign_transaction(&kp.secret_key, &tx).unwrap();
        assert!(!Ed25519Verifier.verify(&tx));
    }

    #[test]
    fn rejects_tampered_payload() {
        let kp = generate_keypair();
        let mut tx = unsigned_tx(derive_address(&kp.public_key));
        tx.signature = sign_transaction(&kp.secret_key, &tx).unwrap();
        tx.outputs[0].amount = 500;
        assert!(!Ed25519Verifier.verify(&tx));
    }

    #[test]
    fn rejects_malformed_blob() {
        let kp = generate_keypair();
        let mut tx = unsigned_tx(derive_address(&kp.public_key));
        tx.signature = vec![0u8; 10];
        assert!(!Ed25519Verifier.verify(&tx));
    }
}
