//! Key persistence.
//!
//! Two raw 32-byte secrets live in the data directory: `sv2_static_key`
//! (X25519, one per process, presented to every peer) and
//! `sv2_authority_key` (secp256k1, signs the certificate binding the static
//! key). Both are generated on first start, written with mode 0600, and
//! read-only thereafter.

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use rand::RngCore;
use secp256k1::{Keypair, Secp256k1, SecretKey};
use tracing::{debug, info};

use crate::error::TpError;

pub const STATIC_KEY_FILE: &str = "sv2_static_key";
pub const AUTHORITY_KEY_FILE: &str = "sv2_authority_key";

/// The provider's persisted key material.
pub struct TpKeys {
    /// Raw X25519 static secret.
    pub static_secret: [u8; 32],
    /// Authority keypair used only to sign certificates.
    pub authority: Keypair,
}

impl TpKeys {
    /// Loads both keys, generating and persisting them on first run.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, TpError> {
        let static_secret = load_or_generate_raw(&data_dir.join(STATIC_KEY_FILE), |bytes| {
            // Any 32 bytes are a valid X25519 scalar after clamping.
            rand::thread_rng().fill_bytes(bytes);
            true
        })?;

        let authority_secret = load_or_generate_raw(&data_dir.join(AUTHORITY_KEY_FILE), |bytes| {
            rand::thread_rng().fill_bytes(bytes);
            SecretKey::from_slice(bytes).is_ok()
        })?;

        let secp = Secp256k1::new();
        let secret =
            SecretKey::from_slice(&authority_secret).map_err(|_| TpError::InvalidKeyFile)?;
        let authority = Keypair::from_secret_key(&secp, &secret);

        Ok(Self {
            static_secret,
            authority,
        })
    }

    pub fn static_public(&self) -> [u8; 32] {
        tp_noise::static_public_key(&self.static_secret)
    }

    pub fn authority_public(&self) -> [u8; 32] {
        self.authority.x_only_public_key().0.serialize()
    }

    /// Logs both public keys at startup: the authority key in the
    /// base58check form mining configuration files use (2-byte version
    /// prefix), raw hex at debug.
    pub fn log_identity(&self) {
        let mut versioned = Vec::with_capacity(34);
        versioned.extend_from_slice(&[1, 0]);
        versioned.extend_from_slice(&self.authority_public());
        info!(
            "Template Provider authority key: {}",
            bs58::encode(versioned).with_check().into_string()
        );
        info!("Static key: {}", hex::encode(self.static_public()));
        debug!("Authority key: {}", hex::encode(self.authority_public()));
    }
}

fn load_or_generate_raw<F>(path: &PathBuf, mut generate: F) -> Result<[u8; 32], TpError>
where
    F: FnMut(&mut [u8; 32]) -> bool,
{
    match read_key(path) {
        Ok(key) => {
            debug!("Reading cached key from {}", path.display());
            return Ok(key);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(TpError::Io(err)),
    }

    let mut key = [0u8; 32];
    while !generate(&mut key) {}
    write_key(path, &key).map_err(TpError::Io)?;
    debug!("Generated key, saved to {}", path.display());
    Ok(key)
}

fn read_key(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = fs::File::open(path)?;
    let mut key = [0u8; 32];
    file.read_exact(&mut key)?;
    Ok(key)
}

fn write_key(path: &Path, key: &[u8; 32]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key)?;
    file.sync_all()
}
