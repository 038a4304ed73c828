//! Viewer key material.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use secp256k1::{Keypair, Secp256k1, SecretKey};

use crate::config::Settings;
use crate::event::PubKey;

/// The unlocked viewer keypair. Secret bytes never leave this module
/// except for the unwrap pipeline.
#[derive(Clone)]
pub struct Identity {
    pair: Keypair,
}

impl Identity {
    pub fn from_secret_hex(raw: &str) -> Result<Self> {
        let bytes = hex::decode(raw.trim()).context("secret key is not hex")?;
        let secp = Secp256k1::new();
        let pair = Keypair::from_seckey_slice(&secp, &bytes)
            .map_err(|e| anyhow!("secret key rejected: {e}"))?;
        Ok(Identity { pair })
    }

    pub fn public_key(&self) -> PubKey {
        PubKey(self.pair.x_only_public_key().0.serialize())
    }

    pub(crate) fn secret_key(&self) -> SecretKey {
        SecretKey::from_keypair(&self.pair)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.public_key())
    }
}

/// Unlock the viewer identity from `SECRET_KEY` or `KEY_FILE`.
/// Bad key material is fatal at start.
pub fn load_identity(cfg: &Settings) -> Result<Identity> {
    if let Some(raw) = &cfg.secret_key {
        return Identity::from_secret_hex(raw);
    }
    if let Some(path) = &cfg.key_file {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading key file {}", path.display()))?;
        return Identity::from_secret_hex(&data);
    }
    Err(anyhow!("no key material: set SECRET_KEY or KEY_FILE"))
}
