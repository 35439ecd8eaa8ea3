use solana_sdk::signature::{Keypair, Signer};
use std::collections::HashMap;

use crate::error::{ConfigError, TransferError};
use crate::instruction::Address;

/// Secret keys indexed by the address they sign for.
pub struct KeyPool {
    keys: HashMap<Address, Keypair>,
}

impl KeyPool {
    /// Accepts base58 keypairs and `[1,2,...]` byte arrays. Duplicates collapse.
    pub fn from_secrets<S: AsRef<str>>(secrets: &[S]) -> Result<Self, ConfigError> {
        if secrets.is_empty() {
            return Err(ConfigError::EmptyKeys);
        }
        let mut keys = HashMap::with_capacity(secrets.len());
        for (n, secret) in secrets.iter().enumerate() {
            let keypair = parse_keypair(secret.as_ref())
                .map_err(|reason| ConfigError::invalid("private_keys", format!("key #{}: {reason}", n + 1)))?;
            keys.insert(Address::from(keypair.pubkey()), keypair);
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.keys.contains_key(address)
    }

    /// The keypair whose public key equals `address`.
    pub fn get(&self, address: &Address) -> Result<&Keypair, TransferError> {
        self.keys
            .get(address)
            .ok_or_else(|| TransferError::MissingKey(address.to_string()))
    }
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool").field("keys", &self.keys.len()).finish()
    }
}

// Error messages never echo the secret itself.
fn parse_keypair(secret: &str) -> Result<Keypair, String> {
    let secret = secret.trim();
    let bytes: Vec<u8> = if secret.starts_with('[') {
        serde_json::from_str(secret).map_err(|_| "not a valid byte array".to_string())?
    } else {
        bs58::decode(secret)
            .into_vec()
            .map_err(|_| "not valid base58".to_string())?
    };
    #[allow(deprecated)]
    Keypair::from_bytes(&bytes).map_err(|_| format!("expected a 64-byte keypair, got {} bytes", bytes.len()))
}
