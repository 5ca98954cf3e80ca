//! Webhook callback verification and envelope parsing.
//!
//! Every authentication failure — bad signature, wrong verification token,
//! undecryptable body — maps to the same opaque [`Error::Authentication`].
//! An external observer must not be able to tell which secret was wrong.

use {
    aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7},
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    secrecy::ExposeSecret,
    serde_json::Value,
    sha2::{Digest, Sha256},
};

use crate::{
    config::ResolvedAccount,
    error::{Error, Result},
};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Verification headers accompanying a webhook callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallbackHeaders<'a> {
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

/// A verified, parsed callback.
#[derive(Debug)]
pub enum Callback {
    /// Platform URL-verification handshake. Answered directly with the
    /// echoed value; never reaches gating.
    Challenge(String),
    /// A regular event envelope.
    Event(Value),
}

/// Signature over `timestamp + nonce + encrypt_key + body`, lowercase hex.
pub fn compute_signature(timestamp: &str, nonce: &str, encrypt_key: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Decrypt an encrypted envelope body.
///
/// Key is SHA-256 of the configured encrypt key; the IV is the first 16
/// bytes of the base64-decoded blob; AES-256-CBC with PKCS#7 padding.
fn decrypt_envelope(encrypt_key: &str, encrypted: &str) -> Result<String> {
    let blob = BASE64.decode(encrypted).map_err(|_| Error::Authentication)?;
    if blob.len() < 32 || blob.len() % 16 != 0 {
        return Err(Error::Authentication);
    }
    let key = Sha256::digest(encrypt_key.as_bytes());
    let (iv, ciphertext) = blob.split_at(16);
    let plain = Aes256CbcDec::new_from_slices(&key, iv)
        .map_err(|_| Error::Authentication)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Authentication)?;
    String::from_utf8(plain).map_err(|_| Error::Authentication)
}

/// Verify and parse a raw webhook body for an account.
///
/// With an encrypt key configured the body must be an `{"encrypt": …}`
/// envelope, and the request signature (when sent) must match. A declared
/// verification token must equal the envelope token. A `challenge` field
/// short-circuits to [`Callback::Challenge`].
pub fn parse_callback(
    raw_body: &str,
    headers: &CallbackHeaders<'_>,
    account: &ResolvedAccount,
) -> Result<Callback> {
    let decrypted;
    let body = match account.encrypt_key.as_ref() {
        Some(key) => {
            let key = key.expose_secret();
            if let (Some(signature), Some(timestamp), Some(nonce)) =
                (headers.signature, headers.timestamp, headers.nonce)
            {
                let expected = compute_signature(timestamp, nonce, key, raw_body);
                if !constant_time_eq(&expected, signature) {
                    return Err(Error::Authentication);
                }
            }
            let outer: Value = serde_json::from_str(raw_body)
                .map_err(|_| Error::malformed("body is not a JSON envelope"))?;
            // A configured encrypt key makes plaintext envelopes untrusted.
            let encrypted = outer
                .get("encrypt")
                .and_then(Value::as_str)
                .ok_or(Error::Authentication)?;
            decrypted = decrypt_envelope(key, encrypted)?;
            decrypted.as_str()
        },
        None => raw_body,
    };

    let envelope: Value =
        serde_json::from_str(body).map_err(|_| Error::malformed("body is not a JSON envelope"))?;
    if !envelope.is_object() {
        return Err(Error::malformed("envelope is not a JSON object"));
    }

    if let Some(expected) = account
        .verification_token
        .as_deref()
        .filter(|token| !token.is_empty())
    {
        let token = envelope
            .get("token")
            .and_then(Value::as_str)
            .or_else(|| envelope.pointer("/header/token").and_then(Value::as_str));
        match token {
            Some(token) if constant_time_eq(token, expected) => {},
            _ => return Err(Error::Authentication),
        }
    }

    if let Some(challenge) = envelope.get("challenge").and_then(Value::as_str) {
        return Ok(Callback::Challenge(challenge.to_string()));
    }

    Ok(Callback::Event(envelope))
}
