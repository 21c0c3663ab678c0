//! Authentication plugins.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (if cached on server):
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! Full auth sends the password in clear over TLS, or RSA-encrypted with
//! the server's public key otherwise. `sha256_password` always takes the
//! full path.

use mywire_core::{Error, InterfaceErrorKind, Result};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    /// Sends the password as-is; only allowed over TLS or a local socket
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Continuation bytes of the caching_sha2_password exchange.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// sha256_password: the client asks for the public key with this byte.
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// A supported authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2,
    Sha256,
    ClearPassword,
}

impl AuthPlugin {
    /// Resolve a plugin by the name the server sent.
    ///
    /// An empty name (servers without CLIENT_PLUGIN_AUTH) means native
    /// password.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | plugins::MYSQL_NATIVE_PASSWORD => Ok(Self::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Ok(Self::CachingSha2),
            plugins::SHA256_PASSWORD => Ok(Self::Sha256),
            plugins::MYSQL_CLEAR_PASSWORD => Ok(Self::ClearPassword),
            other => Err(Error::NotSupported(format!(
                "Authentication plugin '{}' is not supported",
                other
            ))),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            Self::CachingSha2 => plugins::CACHING_SHA2_PASSWORD,
            Self::Sha256 => plugins::SHA256_PASSWORD,
            Self::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
        }
    }

    /// First response for this plugin, sent in the handshake response or
    /// after an auth switch.
    ///
    /// `is_secure` is true over TLS or a local socket.
    pub fn initial_response(self, password: &str, seed: &[u8], is_secure: bool) -> Result<Vec<u8>> {
        match self {
            Self::NativePassword => Ok(mysql_native_password(password, seed)),
            Self::CachingSha2 => Ok(caching_sha2_password(password, seed)),
            Self::Sha256 => Ok(if is_secure {
                clear_password(password)
            } else if password.is_empty() {
                vec![0]
            } else {
                vec![SHA256_REQUEST_PUBLIC_KEY]
            }),
            Self::ClearPassword => {
                if is_secure {
                    Ok(clear_password(password))
                } else {
                    Err(Error::NotSupported(
                        "mysql_clear_password requires a TLS or local socket connection"
                            .to_string(),
                    ))
                }
            }
        }
    }
}

/// Compute the initial auth response for a plugin by name.
pub fn compute_auth_response(
    plugin: &str,
    password: &str,
    seed: &[u8],
    is_secure: bool,
) -> Result<Vec<u8>> {
    AuthPlugin::from_name(plugin)?.initial_response(password, seed, is_secure)
}

/// mysql_native_password scramble: 20 bytes, or empty for no password.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = &auth_data[..auth_data.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password fast-auth scramble: 32 bytes, or empty for no
/// password.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // 20-byte scramble + NUL
    let seed = if auth_data.len() == 21 && auth_data.last() == Some(&0) {
        &auth_data[..20]
    } else {
        auth_data
    };

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Password followed by NUL, for secure channels.
pub fn clear_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Random bytes from the OS generator.
pub fn generate_nonce(length: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Encrypt `password XOR seed` with the server's RSA public key (OAEP).
///
/// Used for full authentication without TLS. The key may be SPKI or PKCS#1
/// PEM.
pub fn sha256_password_rsa(password: &str, seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(auth_error("Authentication seed is empty"));
    }
    let pw = xor_password_with_seed(password, seed);

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("Public key is not valid UTF-8 PEM: {e}")))?;
    let pub_key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| auth_error(format!("Failed to parse RSA public key: {e}")))?;

    pub_key
        .encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &pw)
        .map_err(|e| auth_error(format!("RSA encryption failed: {e}")))
}

/// XOR `password + NUL` with the seed, repeating the seed as needed.
pub fn xor_password_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    clear_password(password)
        .into_iter()
        .enumerate()
        .map(|(i, b)| b ^ seed.get(i % seed.len().max(1)).copied().unwrap_or(0))
        .collect()
}

fn auth_error(message: impl Into<String>) -> Error {
    Error::interface(InterfaceErrorKind::Protocol, message)
}
