//! Stored password schemes.
//!
//! Stored values use the `{SCHEME}base64(payload)` syntax from
//! draft-stroeder-hashed-userpassword-values. Passwords going into a backend
//! are always hashed or crypted; stored passwords are never cleartext.
//!
//! Digest schemes accept any algorithm the digest registry knows, optionally
//! prefixed `S` for salted (payload is `digest || salt`, salt recovered by
//! digest length on read). Crypt schemes defer to the platform `crypt(3)`,
//! whose output carries its own method and salt.

use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use digest::DynDigest;
use lazy_static::lazy_static;
use md5::Md5;
use rand::RngCore;
use regex::Regex;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use sha3::{Sha3_224, Sha3_256, Sha3_384, Sha3_512};
use subtle::ConstantTimeEq;

use crate::result::{LdapError, Result};

/// Salt length for salted digest schemes, in bytes.
const SALT_LEN: usize = 16;

/// Scheme used when the caller does not specify one.
pub const DEFAULT_SCHEME: &str = "SSHA3_512";

lazy_static! {
    static ref STORED_PW: Regex =
        Regex::new(r"^\{([A-Za-z0-9_]+)\}(.+)$").expect("stored password regex");
}

fn new_digest(algo: &str) -> Option<Box<dyn DynDigest>> {
    Some(match algo {
        "md5" => Box::<Md5>::default(),
        "sha1" => Box::<Sha1>::default(),
        "sha224" => Box::<Sha224>::default(),
        "sha256" => Box::<Sha256>::default(),
        "sha384" => Box::<Sha384>::default(),
        "sha512" => Box::<Sha512>::default(),
        "sha3_224" => Box::<Sha3_224>::default(),
        "sha3_256" => Box::<Sha3_256>::default(),
        "sha3_384" => Box::<Sha3_384>::default(),
        "sha3_512" => Box::<Sha3_512>::default(),
        _ => return None,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CryptMethod {
    Des,
    Md5,
    Blowfish,
    Sha256,
    Sha512,
}

impl CryptMethod {
    fn from_name(name: &str) -> Option<CryptMethod> {
        Some(match name.to_ascii_uppercase().as_str() {
            "DES" => CryptMethod::Des,
            "MD5" => CryptMethod::Md5,
            "BLOWFISH" => CryptMethod::Blowfish,
            "SHA256" => CryptMethod::Sha256,
            "SHA512" => CryptMethod::Sha512,
            _ => return None,
        })
    }

    fn make_salt(&self) -> String {
        const SALT_CHARS: &[u8] =
            b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
        let pick = |n: usize| -> String {
            let mut raw = vec![0u8; n];
            rand::thread_rng().fill_bytes(&mut raw);
            raw.iter()
                .map(|b| SALT_CHARS[(b & 63) as usize] as char)
                .collect()
        };
        match self {
            CryptMethod::Des => pick(2),
            CryptMethod::Md5 => format!("$1${}", pick(8)),
            CryptMethod::Blowfish => format!("$2b$12${}", pick(22)),
            CryptMethod::Sha256 => format!("$5${}", pick(16)),
            CryptMethod::Sha512 => format!("$6${}", pick(16)),
        }
    }
}

#[cfg(unix)]
fn crypt3(key: &str, salt: &str) -> Result<String> {
    use std::ffi::{CStr, CString};
    use std::os::raw::c_char;

    #[link(name = "crypt")]
    extern "C" {
        fn crypt(key: *const c_char, salt: *const c_char) -> *mut c_char;
    }

    let c_key = CString::new(key)
        .map_err(|_| LdapError::Other("password contains NUL byte".to_owned()))?;
    let c_salt = CString::new(salt)
        .map_err(|_| LdapError::Other("crypt salt contains NUL byte".to_owned()))?;
    unsafe {
        let result = crypt(c_key.as_ptr(), c_salt.as_ptr());
        if result.is_null() {
            return Err(LdapError::Other("crypt() returned null".to_owned()));
        }
        let out = CStr::from_ptr(result).to_string_lossy().into_owned();
        if out.starts_with('*') {
            return Err(LdapError::Other("crypt() failed".to_owned()));
        }
        Ok(out)
    }
}

#[cfg(not(unix))]
fn crypt3(_key: &str, _salt: &str) -> Result<String> {
    Err(LdapError::AuthMethodNotSupported(
        "crypt schemes are not available on this platform".to_owned(),
    ))
}

#[derive(Debug)]
enum SchemeKind {
    Hash { algo: String, salted: bool },
    Crypt(CryptMethod),
}

/// A recognized password storage scheme.
#[derive(Debug)]
pub struct PasswordScheme {
    name: String,
    kind: SchemeKind,
}

impl fmt::Display for PasswordScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl PasswordScheme {
    /// Resolve a scheme name. Digest algorithms are tried first, so `MD5`,
    /// `SHA256` etc. are digest schemes; crypt methods cover the rest.
    pub fn new(scheme: &str) -> Result<PasswordScheme> {
        let name = scheme.to_ascii_uppercase();
        let mut algo = scheme.to_ascii_lowercase();
        // bare SHA/SSHA are the SHA1 variants
        if algo.ends_with("sha") {
            algo.push('1');
        }
        if new_digest(&algo).is_some() {
            return Ok(PasswordScheme {
                name,
                kind: SchemeKind::Hash { algo, salted: false },
            });
        }
        if let Some(rest) = algo.strip_prefix('s') {
            if new_digest(rest).is_some() {
                return Ok(PasswordScheme {
                    name,
                    kind: SchemeKind::Hash {
                        algo: rest.to_owned(),
                        salted: true,
                    },
                });
            }
        }
        if let Some(method) = CryptMethod::from_name(scheme) {
            return Ok(PasswordScheme {
                name,
                kind: SchemeKind::Crypt(method),
            });
        }
        Err(LdapError::AuthMethodNotSupported(format!(
            "unsupported password hash scheme \"{}\"",
            scheme
        )))
    }

    /// Check a cleartext password against the decoded stored payload.
    pub fn check(&self, input: &str, payload: &[u8]) -> Result<bool> {
        match &self.kind {
            SchemeKind::Hash { algo, salted } => {
                let mut hasher = new_digest(algo).expect("validated algorithm");
                let hash_len = hasher.output_size();
                let (stored_hash, salt) = if *salted {
                    if payload.len() < hash_len {
                        return Ok(false);
                    }
                    payload.split_at(hash_len)
                } else {
                    (payload, &[][..])
                };
                hasher.update(input.as_bytes());
                hasher.update(salt);
                let input_hashed = hasher.finalize_reset();
                Ok(stored_hash.ct_eq(&input_hashed).into())
            }
            SchemeKind::Crypt(_) => {
                let stored = std::str::from_utf8(payload)
                    .map_err(|_| LdapError::Internal("crypt data is not valid UTF-8".to_owned()))?;
                let input_crypted = crypt3(input, stored)?;
                Ok(input_crypted.as_bytes().ct_eq(stored.as_bytes()).into())
            }
        }
    }

    /// Hash or crypt a cleartext password into the `{SCHEME}...` stored form.
    pub fn prepare(&self, input: &str) -> Result<String> {
        let payload = match &self.kind {
            SchemeKind::Hash { algo, salted } => {
                let mut hasher = new_digest(algo).expect("validated algorithm");
                hasher.update(input.as_bytes());
                let mut salt = Vec::new();
                if *salted {
                    salt.resize(SALT_LEN, 0);
                    rand::thread_rng().fill_bytes(&mut salt);
                    hasher.update(&salt);
                }
                let mut payload = hasher.finalize_reset().to_vec();
                payload.extend_from_slice(&salt);
                payload
            }
            SchemeKind::Crypt(method) => {
                crypt3(input, &method.make_salt())?.into_bytes()
            }
        };
        Ok(format!("{{{}}}{}", self.name, STANDARD.encode(payload)))
    }
}

fn decode_payload(b64: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(b64)
        .or_else(|_| URL_SAFE.decode(b64))
        .map_err(|_| LdapError::Internal("hashed password is not valid base64".to_owned()))
}

/// Check a cleartext password against a stored `{SCHEME}b64` value.
pub fn check_password(input: &str, stored: &str) -> Result<bool> {
    let caps = STORED_PW
        .captures(stored)
        .ok_or_else(|| LdapError::Internal("hashed password is not valid syntax".to_owned()))?;
    let scheme = PasswordScheme::new(&caps[1])?;
    let payload = decode_payload(&caps[2])?;
    scheme.check(input, &payload)
}

/// Produce a stored password value ready for the backend.
pub fn prepare_password(input: &str, scheme: &str) -> Result<String> {
    PasswordScheme::new(scheme)?.prepare(input)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn salted_sha256_round_trip() {
        let stored = prepare_password("hunter2", "SSHA256").unwrap();
        assert!(stored.starts_with("{SSHA256}"));
        assert!(check_password("hunter2", &stored).unwrap());
        assert!(!check_password("Hunter2", &stored).unwrap());
    }

    #[test]
    fn unsalted_sha1_round_trip() {
        let stored = prepare_password("secret", "SHA1").unwrap();
        assert!(check_password("secret", &stored).unwrap());
        assert!(!check_password("Secret", &stored).unwrap());
    }

    #[test]
    fn bare_sha_means_sha1() {
        let stored = prepare_password("pw", "SSHA").unwrap();
        assert!(stored.starts_with("{SSHA}"));
        assert!(check_password("pw", &stored).unwrap());
    }

    #[test]
    fn distinct_salts_per_preparation() {
        let a = prepare_password("pw", "SSHA256").unwrap();
        let b = prepare_password("pw", "SSHA256").unwrap();
        assert_ne!(a, b);
        assert!(check_password("pw", &a).unwrap());
        assert!(check_password("pw", &b).unwrap());
    }

    #[test]
    fn default_scheme_round_trip() {
        let stored = prepare_password("pw", DEFAULT_SCHEME).unwrap();
        assert!(stored.starts_with("{SSHA3_512}"));
        assert!(check_password("pw", &stored).unwrap());
    }

    #[test]
    fn bad_syntax_and_unknown_scheme() {
        assert!(check_password("pw", "cleartext").is_err());
        assert!(check_password("pw", "{NOPE}aGVsbG8=").is_err());
        assert!(PasswordScheme::new("XYZZY").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn des_crypt_round_trip() {
        let stored = prepare_password("pw", "DES").unwrap();
        assert!(stored.starts_with("{DES}"));
        assert!(check_password("pw", &stored).unwrap());
        assert!(!check_password("other", &stored).unwrap());
    }
}
