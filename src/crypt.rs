//! SHA-512 crypt (`$6$`) password hashes, as read by glibc's crypt(3)

use rand::Rng;
use sha_crypt::{Sha512Params, sha512_crypt_b64};

use crate::error::{Error, Result};

const PREFIX: &str = "$6$";
const ROUNDS_PREFIX: &str = "rounds=";
const SALT_MAX: usize = 16;
const ROUNDS_DEFAULT: u32 = 5000;
const ROUNDS_MIN: u32 = 1000;
const ROUNDS_MAX: u32 = 999_999_999;

const SALT_CHARS: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn params(rounds: u32) -> Result<Sha512Params> {
    Sha512Params::new(rounds as usize).map_err(|e| Error::PasswordHash(format!("{:?}", e)))
}

/// Hash `password` with a fresh random 16-character salt.
pub fn hash_password(password: &str) -> Result<String> {
    let mut rng = rand::thread_rng();
    let salt: String = (0..SALT_MAX)
        .map(|_| SALT_CHARS[rng.gen_range(0..SALT_CHARS.len())] as char)
        .collect();
    hash_with_salt(password, &salt, None)
}

/// Hash with an explicit salt. `rounds` of `None` uses the implicit default
/// and omits the `rounds=` field; explicit rounds are clamped like crypt(3).
pub fn hash_with_salt(password: &str, salt: &str, rounds: Option<u32>) -> Result<String> {
    let salt = salt.char_indices().nth(SALT_MAX).map_or(salt, |(end, _)| &salt[..end]);
    let effective_rounds = rounds
        .map(|r| r.clamp(ROUNDS_MIN, ROUNDS_MAX))
        .unwrap_or(ROUNDS_DEFAULT);
    let digest = sha512_crypt_b64(password.as_bytes(), salt.as_bytes(), &params(effective_rounds)?)
        .map_err(|e| Error::PasswordHash(format!("{:?}", e)))?;

    let mut out = String::from(PREFIX);
    if rounds.is_some() {
        out.push_str(&format!("{}{}$", ROUNDS_PREFIX, effective_rounds));
    }
    out.push_str(salt);
    out.push('$');
    out.push_str(&digest);
    Ok(out)
}

/// Whether a shadow hash field denies password login.
pub fn is_locked(hash: &str) -> bool {
    hash.is_empty() || hash.starts_with('!') || hash.starts_with('*')
}
