use std::collections::BTreeMap;

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::secp256k1_zkp::{self, All, Message, Secp256k1, SecretKey, ecdsa};

use crate::error::{Error, Result};

/// Holder of private keys that signs digests on request.
///
/// The engine never sees secret material: it asks for the keys on offer and
/// hands over sighashes.
pub trait SigningOracle {
    fn public_keys(&self) -> Vec<PublicKey>;

    fn sign(&self, sighash: &[u8; 32], pubkey: &PublicKey) -> Result<ecdsa::Signature>;
}

/// In-memory set of secret keys.
#[derive(Default)]
pub struct Keyring {
    secp: Secp256k1<All>,
    keys: BTreeMap<PublicKey, SecretKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_secret_keys(keys: impl IntoIterator<Item = SecretKey>) -> Self {
        let mut keyring = Self::new();
        for sk in keys {
            keyring.add(sk);
        }
        keyring
    }

    /// Add a key and return its compressed public key.
    pub fn add(&mut self, sk: SecretKey) -> PublicKey {
        let pubkey = PublicKey::new(secp256k1_zkp::PublicKey::from_secret_key(&self.secp, &sk));
        self.keys.insert(pubkey, sk);
        pubkey
    }

    pub fn contains(&self, pubkey: &PublicKey) -> bool {
        self.keys.contains_key(pubkey)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl SigningOracle for Keyring {
    fn public_keys(&self) -> Vec<PublicKey> {
        self.keys.keys().copied().collect()
    }

    fn sign(&self, sighash: &[u8; 32], pubkey: &PublicKey) -> Result<ecdsa::Signature> {
        let sk = self
            .keys
            .get(pubkey)
            .ok_or_else(|| Error::OracleRefused(format!("no secret key for {pubkey}")))?;
        let msg = Message::from_digest(*sighash);
        Ok(self.secp.sign_ecdsa(&msg, sk))
    }
}

impl<T: SigningOracle + ?Sized> SigningOracle for &T {
    fn public_keys(&self) -> Vec<PublicKey> {
        (**self).public_keys()
    }

    fn sign(&self, sighash: &[u8; 32], pubkey: &PublicKey) -> Result<ecdsa::Signature> {
        (**self).sign(sighash, pubkey)
    }
}
