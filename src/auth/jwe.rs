//! Session tokens: the user credential encrypted as a compact JWE.
//!
//! Tokens use RSA-OAEP-256 to wrap a one-time AES-256-GCM content key. The RSA key pair is held
//! by the [`KeyHolder`], and shared by every replica through a cluster secret.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD as B64};
use log::trace;
use openssl::{
    encrypt::{Decrypter, Encrypter as RsaEncrypter},
    hash::MessageDigest,
    pkey::{PKey, PKeyRef, Private, Public},
    rsa::{Padding, Rsa},
    symm::{Cipher, decrypt_aead, encrypt_aead},
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{AuthInfo, TokenManager};
use crate::{Error, Result};

pub mod keyholder;


pub use keyholder::KeyHolder;

pub const KEY_BITS: u32 = 2048;
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Secret data field holding the PEM private key.
pub const PRIVATE_KEY_FIELD: &str = "priv";
/// Secret data field holding the PEM public key.
pub const PUBLIC_KEY_FIELD: &str = "pub";

const ALG: &str = "RSA-OAEP-256";
const ENC: &str = "A256GCM";
const CEK_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub fn generate_key() -> Result<PKey<Private>> {
    Ok(PKey::from_rsa(Rsa::generate(KEY_BITS)?)?)
}

/// Serializes a key pair as (private PEM, public PEM).
pub fn export_key(key: &PKeyRef<Private>) -> Result<(Vec<u8>, Vec<u8>)> {
    let rsa = key.rsa()?;
    Ok((rsa.private_key_to_pem()?, rsa.public_key_to_pem()?))
}

/// Parses a key pair exported by [`export_key`], checking both halves belong together.
pub fn parse_key(private_pem: &[u8], public_pem: &[u8]) -> Result<PKey<Private>> {
    let private = Rsa::private_key_from_pem(private_pem)
        .map_err(|e| Error::invalid(format!("invalid private key: {e}")))?;
    let public = Rsa::public_key_from_pem(public_pem)
        .map_err(|e| Error::invalid(format!("invalid public key: {e}")))?;

    if private.n() != public.n() || private.e() != public.e() {
        return Err(Error::invalid("public key does not match private key"));
    }

    Ok(PKey::from_rsa(private)?)
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct Header {
    alg: String,
    enc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}
impl Header {
    fn new(iat: u64, ttl: Duration) -> Self {
        Self {
            alg: ALG.to_string(),
            enc: ENC.to_string(),
            iat: Some(iat),
            exp: (!ttl.is_zero()).then(|| iat + ttl.as_secs()),
        }
    }
}

/// Token encryption with a fixed public key.
pub struct Encrypter {
    public: PKey<Public>,
}

impl Encrypter {
    pub fn new(key: &PKeyRef<Private>) -> Result<Self> {
        let rsa = key.rsa()?;
        let public = Rsa::from_public_components(rsa.n().to_owned()?, rsa.e().to_owned()?)?;
        Ok(Self {
            public: PKey::from_rsa(public)?,
        })
    }

    fn encrypt(&self, header: &Header, payload: &[u8]) -> Result<String> {
        let mut cek = [0; CEK_LEN];
        let mut iv = [0; IV_LEN];
        openssl::rand::rand_bytes(&mut cek)?;
        openssl::rand::rand_bytes(&mut iv)?;

        let mut rsa = RsaEncrypter::new(&self.public)?;
        rsa.set_rsa_padding(Padding::PKCS1_OAEP)?;
        rsa.set_rsa_oaep_md(MessageDigest::sha256())?;
        rsa.set_rsa_mgf1_md(MessageDigest::sha256())?;

        let mut encrypted_key = vec![0; rsa.encrypt_len(&cek)?];
        let len = rsa.encrypt(&cek, &mut encrypted_key)?;
        encrypted_key.truncate(len);

        let protected = B64.encode(serde_json::to_vec(header)?);

        let mut tag = [0; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &cek,
            Some(&iv),
            protected.as_bytes(),
            payload,
            &mut tag,
        )?;

        Ok([
            protected,
            B64.encode(encrypted_key),
            B64.encode(iv),
            B64.encode(ciphertext),
            B64.encode(tag),
        ]
        .join("."))
    }
}

fn decode(part: &str, what: &str) -> Result<Vec<u8>> {
    B64.decode(part)
        .map_err(|e| Error::invalid(format!("invalid token {what}: {e}")))
}

fn decrypt(key: &PKeyRef<Private>, token: &str) -> Result<(Header, Vec<u8>)> {
    let parts: Vec<_> = token.split('.').collect();
    let [protected, encrypted_key, iv, ciphertext, tag] = parts[..] else {
        return Err(Error::invalid(format!(
            "invalid token: expected 5 parts, got {}",
            parts.len()
        )));
    };

    let header: Header = serde_json::from_slice(&decode(protected, "header")?)?;
    if header.alg != ALG || header.enc != ENC {
        return Err(Error::invalid(format!(
            "unsupported token algorithm: {}/{}",
            header.alg, header.enc
        )));
    }

    let encrypted_key = decode(encrypted_key, "key")?;
    let iv = decode(iv, "iv")?;
    let ciphertext = decode(ciphertext, "ciphertext")?;
    let tag = decode(tag, "tag")?;

    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(Error::invalid("invalid token: bad iv or tag length"));
    }

    // from here on, failures mean the token was not issued with our key
    let unauthorized = |e: openssl::error::ErrorStack| {
        trace!("token decryption failed: {e}");
        Error::Unauthorized("invalid token: decryption failed".into())
    };

    let mut rsa = Decrypter::new(key)?;
    rsa.set_rsa_padding(Padding::PKCS1_OAEP)?;
    rsa.set_rsa_oaep_md(MessageDigest::sha256())?;
    rsa.set_rsa_mgf1_md(MessageDigest::sha256())?;

    let mut cek = vec![0; rsa.decrypt_len(&encrypted_key)?];
    let len = rsa.decrypt(&encrypted_key, &mut cek).map_err(unauthorized)?;
    cek.truncate(len);

    if cek.len() != CEK_LEN {
        return Err(Error::Unauthorized("invalid token: bad content key".into()));
    }

    let payload = decrypt_aead(
        Cipher::aes_256_gcm(),
        &cek,
        Some(&iv),
        protected.as_bytes(),
        &ciphertext,
        &tag,
    )
    .map_err(unauthorized)?;

    Ok((header, payload))
}

fn now() -> u64 {
    (SystemTime::now().duration_since(UNIX_EPOCH)).map_or(0, |d| d.as_secs())
}

pub struct JweTokenManager {
    key_holder: KeyHolder,
    token_ttl: Duration,
}

impl JweTokenManager {
    /// A zero `token_ttl` issues tokens that never expire.
    pub fn new(key_holder: KeyHolder, token_ttl: Duration) -> Self {
        Self {
            key_holder,
            token_ttl,
        }
    }

    async fn issue(&self, auth_info: &AuthInfo, iat: u64) -> Result<String> {
        let header = Header::new(iat, self.token_ttl);
        let payload = serde_json::to_vec(auth_info)?;
        self.key_holder.encrypter().await?.encrypt(&header, &payload)
    }
}

#[async_trait]
impl TokenManager for JweTokenManager {
    async fn generate(&self, auth_info: &AuthInfo) -> Result<String> {
        self.issue(auth_info, now()).await
    }

    async fn decrypt(&self, token: &str) -> Result<AuthInfo> {
        let key = self.key_holder.key().await;
        let (header, payload) = decrypt(&key, token)?;

        if header.exp.is_some_and(|exp| now() >= exp) {
            return Err(Error::TokenExpired);
        }

        Ok(serde_json::from_slice(&payload)?)
    }

    async fn refresh(&self, token: &str) -> Result<String> {
        if token.is_empty() {
            return Err(Error::invalid("Can not refresh token. No token provided."));
        }

        let auth_info = self.decrypt(token).await?;
        self.generate(&auth_info).await
    }
}
