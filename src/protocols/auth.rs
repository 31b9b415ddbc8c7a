//! SIP digest authentication and credential hashing
//!
//! REGISTER and INVITE challenges per RFC 8760: MD5 is always accepted,
//! SHA-256 is offered first. Nonces carry an issue timestamp and expire
//! after the configured lifetime; nonce counts must rise monotonically per
//! (client, nonce) pair. Voicemail PINs and other stored secrets are
//! PBKDF2-HMAC-SHA256 with per-record salt.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "SHA-256" | "SHA256" => Some(Self::Sha256),
            _ => None,
        }
    }

    fn hash(&self, input: &str) -> String {
        match self {
            Self::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(input.as_bytes());
                hex::encode(hasher.finalize())
            }
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(input.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// Server-side challenge carried in WWW-Authenticate
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: DigestAlgorithm,
    pub qop: bool,
}

impl DigestChallenge {
    pub fn header_value(&self) -> String {
        let mut value = format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm={}",
            self.realm,
            self.nonce,
            self.algorithm.as_str()
        );
        if self.qop {
            value.push_str(", qop=\"auth\"");
        }
        value
    }
}

/// Client response carried in Authorization
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: DigestAlgorithm,
    pub cnonce: Option<String>,
    pub nc: Option<u32>,
    pub qop: Option<String>,
}

impl DigestCredentials {
    /// Parse an `Authorization: Digest ...` header value
    pub fn parse(value: &str) -> Result<Self> {
        let rest = value
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| Error::auth("Not a Digest authorization"))?;

        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut cnonce = None;
        let mut nc = None;
        let mut qop = None;

        for part in split_auth_params(rest) {
            let (key, value) = match part.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            match key.to_ascii_lowercase().as_str() {
                "username" => username = Some(value.to_string()),
                "realm" => realm = Some(value.to_string()),
                "nonce" => nonce = Some(value.to_string()),
                "uri" => uri = Some(value.to_string()),
                "response" => response = Some(value.to_string()),
                "algorithm" => {
                    algorithm = DigestAlgorithm::from_str(value)
                        .ok_or_else(|| Error::auth(format!("Unknown algorithm {}", value)))?;
                }
                "cnonce" => cnonce = Some(value.to_string()),
                "nc" => {
                    nc = Some(
                        u32::from_str_radix(value, 16)
                            .map_err(|_| Error::auth("Invalid nc value"))?,
                    );
                }
                "qop" => qop = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            username: username.ok_or_else(|| Error::auth("Missing username"))?,
            realm: realm.ok_or_else(|| Error::auth("Missing realm"))?,
            nonce: nonce.ok_or_else(|| Error::auth("Missing nonce"))?,
            uri: uri.ok_or_else(|| Error::auth("Missing uri"))?,
            response: response.ok_or_else(|| Error::auth("Missing response"))?,
            algorithm,
            cnonce,
            nc,
            qop,
        })
    }
}

/// Split on commas that are not inside quoted strings
fn split_auth_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(input[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Compute the expected digest response.
///
/// With qop=auth: `hash(HA1:nonce:nc:cnonce:qop:HA2)`, otherwise the
/// RFC 2069 form `hash(HA1:nonce:HA2)`.
pub fn compute_response(
    algorithm: DigestAlgorithm,
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: Option<u32>,
    cnonce: Option<&str>,
    qop: Option<&str>,
) -> String {
    let ha1 = algorithm.hash(&format!("{}:{}:{}", username, realm, password));
    let ha2 = algorithm.hash(&format!("{}:{}", method, uri));

    match (qop, nc, cnonce) {
        (Some(qop), Some(nc), Some(cnonce)) if qop == "auth" => algorithm.hash(&format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        _ => algorithm.hash(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

struct NonceState {
    issued_at: u64,
    highest_nc: u32,
}

/// Issues and validates nonces for the registrar and the INVITE gate
pub struct NonceStore {
    lifetime_secs: u64,
    nonces: DashMap<String, NonceState>,
}

impl NonceStore {
    pub fn new(lifetime_secs: u64) -> Self {
        Self {
            lifetime_secs,
            nonces: DashMap::new(),
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Mint a nonce: issue timestamp plus random tail, hex encoded
    pub fn issue(&self) -> String {
        let now = Self::now();
        let nonce = format!("{:x}.{:x}", now, rand::random::<u64>());
        self.nonces.insert(
            nonce.clone(),
            NonceState {
                issued_at: now,
                highest_nc: 0,
            },
        );
        nonce
    }

    /// Check a nonce is live and, when a count is supplied, strictly
    /// increasing. Consumed state survives until expiry so replays with a
    /// stale nc fail.
    pub fn validate(&self, nonce: &str, nc: Option<u32>) -> bool {
        let now = Self::now();
        let mut entry = match self.nonces.get_mut(nonce) {
            Some(entry) => entry,
            None => return false,
        };
        if now.saturating_sub(entry.issued_at) > self.lifetime_secs {
            drop(entry);
            self.nonces.remove(nonce);
            return false;
        }
        if let Some(nc) = nc {
            if nc <= entry.highest_nc {
                return false;
            }
            entry.highest_nc = nc;
        }
        true
    }

    /// Drop expired nonces; called from the registrar sweeper
    pub fn sweep(&self) {
        let now = Self::now();
        let lifetime = self.lifetime_secs;
        self.nonces
            .retain(|_, state| now.saturating_sub(state.issued_at) <= lifetime);
    }

    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

/// Verify client credentials against a challenge we issued.
///
/// `password` is the extension's SIP secret as provisioned.
pub fn verify_credentials(
    credentials: &DigestCredentials,
    method: &str,
    password: &str,
    nonce_store: &NonceStore,
) -> bool {
    if !nonce_store.validate(&credentials.nonce, credentials.nc) {
        return false;
    }

    let expected = compute_response(
        credentials.algorithm,
        &credentials.username,
        &credentials.realm,
        password,
        method,
        &credentials.uri,
        &credentials.nonce,
        credentials.nc,
        credentials.cnonce.as_deref(),
        credentials.qop.as_deref(),
    );

    // Constant-time comparison on the hex strings
    let expected = expected.as_bytes();
    let actual = credentials.response.as_bytes();
    if expected.len() != actual.len() {
        return false;
    }
    expected
        .iter()
        .zip(actual.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// PBKDF2-HMAC-SHA256 parameters for stored secrets
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// A stored secret: `pbkdf2-sha256$<iterations>$<salt-hex>$<hash-hex>`
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSecret {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub hash: Vec<u8>,
}

impl StoredSecret {
    pub fn derive(secret: &str) -> Self {
        let salt: [u8; 16] = rand::random();
        Self::derive_with(secret, &salt, PBKDF2_ITERATIONS)
    }

    /// Derivation with explicit parameters; provisioning tools and tests
    /// use this, production records stick to [`PBKDF2_ITERATIONS`]
    pub fn derive_with(secret: &str, salt: &[u8], iterations: u32) -> Self {
        Self {
            iterations,
            salt: salt.to_vec(),
            hash: pbkdf2_sha256(secret.as_bytes(), salt, iterations),
        }
    }

    pub fn parse(encoded: &str) -> Result<Self> {
        let mut parts = encoded.split('$');
        let scheme = parts.next().unwrap_or_default();
        if scheme != "pbkdf2-sha256" {
            return Err(Error::auth(format!("Unknown secret scheme {}", scheme)));
        }
        let iterations = parts
            .next()
            .and_then(|i| i.parse().ok())
            .ok_or_else(|| Error::auth("Missing iteration count"))?;
        let salt = parts
            .next()
            .and_then(|s| hex::decode(s).ok())
            .ok_or_else(|| Error::auth("Missing salt"))?;
        let hash = parts
            .next()
            .and_then(|h| hex::decode(h).ok())
            .ok_or_else(|| Error::auth("Missing hash"))?;
        Ok(Self {
            iterations,
            salt,
            hash,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "pbkdf2-sha256${}${}${}",
            self.iterations,
            hex::encode(&self.salt),
            hex::encode(&self.hash)
        )
    }

    pub fn verify(&self, secret: &str) -> bool {
        let candidate = pbkdf2_sha256(secret.as_bytes(), &self.salt, self.iterations);
        if candidate.len() != self.hash.len() {
            return false;
        }
        candidate
            .iter()
            .zip(self.hash.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// PBKDF2 with a single 32-byte output block (F_1 only, which is all a
/// SHA-256-sized key needs)
fn pbkdf2_sha256(secret: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = mac.finalize().into_bytes();

    let mut output: Vec<u8> = u.to_vec();
    for _ in 1..iterations {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&u);
        u = mac.finalize().into_bytes();
        for (out, byte) in output.iter_mut().zip(u.iter()) {
            *out ^= byte;
        }
    }

    output
}
