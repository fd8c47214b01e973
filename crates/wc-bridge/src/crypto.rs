//! Envelope encryption shared by both ends of a session.
//!
//! AES-256-CBC with PKCS7 padding and a fresh random IV per message, then
//! HMAC-SHA256 over `ciphertext || iv` under the same key. The tag is checked
//! before any decryption is attempted.

use crate::{Error, Result, SessionKey};
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const IV_LENGTH: usize = 16;

/// Encrypted wire envelope, all fields hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub data: String,
    pub iv: String,
    pub hmac: String,
}

pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<EncryptedPayload> {
    let mut iv = [0u8; IV_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(plaintext, key, iv)
}

fn encrypt_with_iv(plaintext: &[u8], key: &SessionKey, iv: [u8; IV_LENGTH]) -> Result<EncryptedPayload> {
    let ciphertext = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| Error::InvalidKey(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let tag = authentication_tag(&ciphertext, &iv, key)?.finalize().into_bytes();

    Ok(EncryptedPayload {
        data: hex::encode(&ciphertext),
        iv: hex::encode(iv),
        hmac: hex::encode(tag),
    })
}

pub fn decrypt(payload: &EncryptedPayload, key: &SessionKey) -> Result<Vec<u8>> {
    let ciphertext = decode_hex("data", &payload.data)?;
    let iv = decode_hex("iv", &payload.iv)?;
    let tag = decode_hex("hmac", &payload.hmac)?;

    if iv.len() != IV_LENGTH {
        return Err(Error::Decode(format!("iv must be {} bytes", IV_LENGTH)));
    }

    authentication_tag(&ciphertext, &iv, key)?
        .verify_slice(&tag)
        .map_err(|_| Error::Integrity)?;

    Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| Error::InvalidKey(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Error::Decode("invalid ciphertext padding".to_string()))
}

fn authentication_tag(ciphertext: &[u8], iv: &[u8], key: &SessionKey) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    mac.update(ciphertext);
    mac.update(iv);
    Ok(mac)
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| Error::Decode(format!("{}: {}", field, e)))
}
