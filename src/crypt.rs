//! Cryptographic helpers: one-time password generation, Argon2id password
//! hashing and SSH keypair generation for issued credentials.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::Rng;
use russh::keys::PublicKeyBase64;
use russh::keys::ssh_key;
use russh::keys::ssh_key::LineEnding;
use russh::keys::ssh_key::rand_core::OsRng;
use thiserror::Error;

/// Argon2id parameters, tuned so a hash stays cheap enough to compute on
/// every authentication attempt.
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_ITERATIONS: u32 = 1;
const ARGON2_LANES: u32 = 8;
const ARGON2_HASH_LEN: usize = 32;

/// Fixed application salt. Issued passwords are 64 chars of fresh
/// randomness used once (or by a single static grant), so the password
/// itself carries the entropy a per-record salt would normally add.
const ACCESS_HASH_SALT: &[u8] = b"aquarium-gate-access";

/// Base58 charset, avoids visually ambiguous characters.
const RAND_CHARSET_B58: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ123456789";

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("unable to generate SSH key: {0}")]
    Key(#[from] ssh_key::Error),

    #[error("unable to hash password: {0}")]
    Hash(String),
}

/// Generate a random base58 string of the given length.
pub fn rand_string(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..RAND_CHARSET_B58.len());
            RAND_CHARSET_B58[idx] as char
        })
        .collect()
}

/// Hash a password with Argon2id and return the lowercase hex digest.
///
/// The same function runs at issuance time and inside the password
/// callback, so a stored hash matches iff the presented password does.
pub fn password_hash(password: &str) -> Result<String, CryptError> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_LANES,
        Some(ARGON2_HASH_LEN),
    )
    .map_err(|e| CryptError::Hash(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; ARGON2_HASH_LEN];
    argon
        .hash_password_into(password.as_bytes(), ACCESS_HASH_SALT, &mut out)
        .map_err(|e| CryptError::Hash(e.to_string()))?;

    Ok(to_hex(&out))
}

/// A freshly generated keypair for one issued credential.
pub struct AccessKeyPair {
    /// Private key, OpenSSH PEM. Returned to the caller, never stored.
    pub private_pem: String,

    /// Matching authorized-keys entry, stored for the authenticator.
    pub public_entry: String,
}

/// Generate an Ed25519 keypair for an issued credential.
pub fn generate_access_keypair() -> Result<AccessKeyPair, CryptError> {
    let key = russh::keys::PrivateKey::random(&mut OsRng, ssh_key::Algorithm::Ed25519)?;
    let private_pem = key.to_openssh(LineEnding::LF)?.to_string();
    let public_entry = authorized_key_entry(key.public_key());
    Ok(AccessKeyPair {
        private_pem,
        public_entry,
    })
}

/// Canonical authorized-keys entry (`algo base64`, no comment) for a
/// public key. Both the issuer and the public-key callback go through
/// this, so lookup equality never depends on comments or whitespace.
pub fn authorized_key_entry(key: &russh::keys::PublicKey) -> String {
    let key_type = match key.algorithm() {
        russh::keys::Algorithm::Ed25519 => "ssh-ed25519",
        russh::keys::Algorithm::Rsa { .. } => "ssh-rsa",
        russh::keys::Algorithm::Ecdsa { curve } => match curve {
            russh::keys::EcdsaCurve::NistP256 => "ecdsa-sha2-nistp256",
            russh::keys::EcdsaCurve::NistP384 => "ecdsa-sha2-nistp384",
            russh::keys::EcdsaCurve::NistP521 => "ecdsa-sha2-nistp521",
        },
        other => {
            tracing::warn!(algorithm = ?other, "unexpected public key algorithm");
            "unknown"
        }
    };
    format!("{} {}", key_type, key.public_key_base64())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
