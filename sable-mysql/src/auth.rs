//! Implementation of the authentication plugins
use rsa::{pkcs8::DecodePublicKey, rand_core::OsRng, Oaep, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Authentication plugins the driver can drive
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuthPlugin {
    /// Old scramble mechanism, still the MariaDB default
    MysqlNativePassword,
    /// SHA-256 scramble with a cached fast path and an RSA slow path
    CachingSha2Password,
    /// RSA encrypted password exchange
    Sha256Password,
    /// Password sent in the clear; only sane behind TLS or a unix socket
    MysqlClearPassword,
}

impl AuthPlugin {
    /// Resolve a plugin announced by the server
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mysql_native_password" | "" => Ok(AuthPlugin::MysqlNativePassword),
            "caching_sha2_password" => Ok(AuthPlugin::CachingSha2Password),
            "sha256_password" => Ok(AuthPlugin::Sha256Password),
            "mysql_clear_password" => Ok(AuthPlugin::MysqlClearPassword),
            other => Err(Error::not_supported(format!(
                "authentication plugin {other:?}"
            ))),
        }
    }

    /// The name sent in the handshake response
    pub fn name(self) -> &'static str {
        match self {
            AuthPlugin::MysqlNativePassword => "mysql_native_password",
            AuthPlugin::CachingSha2Password => "caching_sha2_password",
            AuthPlugin::Sha256Password => "sha256_password",
            AuthPlugin::MysqlClearPassword => "mysql_clear_password",
        }
    }

    /// Compute the auth data for the handshake response or an auth switch
    ///
    /// `secure` is true when the channel is TLS or a unix socket, in which
    /// case plugins that would otherwise go through the RSA exchange may send
    /// the password in the clear.
    pub fn initial_response(self, password: &str, seed: &[u8], secure: bool) -> Vec<u8> {
        match self {
            AuthPlugin::MysqlNativePassword => scramble_native(password, seed),
            AuthPlugin::CachingSha2Password => scramble_sha256(password, seed),
            AuthPlugin::Sha256Password => {
                if password.is_empty() {
                    // empty password is a single NUL
                    vec![0]
                } else if secure {
                    let mut v = password.as_bytes().to_vec();
                    v.push(0);
                    v
                } else {
                    // ask the server for its public key
                    vec![1]
                }
            }
            AuthPlugin::MysqlClearPassword => {
                let mut v = password.as_bytes().to_vec();
                v.push(0);
                v
            }
        }
    }
}

/// `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
pub fn scramble_native(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let mut ctx = Sha1::new();
    ctx.update(password.as_bytes());
    let mut pw_hash = ctx.finalize_reset();
    ctx.update(pw_hash);
    let pw_hash_hash = ctx.finalize_reset();
    ctx.update(seed);
    ctx.update(pw_hash_hash);
    let pw_seed_hash_hash = ctx.finalize();
    for i in 0..pw_hash.len() {
        pw_hash[i] ^= pw_seed_hash_hash[i];
    }
    pw_hash.to_vec()
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + seed)`
pub fn scramble_sha256(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let mut ctx = Sha256::new();
    ctx.update(password.as_bytes());
    let mut pw_hash = ctx.finalize_reset();
    ctx.update(pw_hash);
    let pw_hash_hash = ctx.finalize_reset();
    ctx.update(pw_hash_hash);
    ctx.update(seed);
    let pw_seed_hash_hash = ctx.finalize();
    for i in 0..pw_hash.len() {
        pw_hash[i] ^= pw_seed_hash_hash[i];
    }
    pw_hash.to_vec()
}

/// XOR the NUL-terminated password with the repeating seed
fn xor_password(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    for (i, b) in out.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }
    out
}

/// Encrypt `password XOR seed` with the server's RSA public key (OAEP)
pub fn encrypt_password(pem: &str, password: &str, seed: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPublicKey::from_public_key_pem(pem.trim_matches('\0'))
        .map_err(|e| Error::protocol(format!("invalid public key pem: {e:?}")))?;
    let plain = xor_password(password, seed);
    let padding = Oaep::new::<Sha1>();
    key.encrypt(&mut OsRng, padding, &plain)
        .map_err(|e| Error::protocol(format!("rsa encrypt failed: {e:?}")))
}
