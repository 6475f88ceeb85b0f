//! Password-based encryption for trading secrets.
//!
//! Blob layout: `base64(salt[16] ‖ nonce[12] ‖ ciphertext)`. The key is
//! derived with PBKDF2-HMAC-SHA256 from the user's password and a fresh
//! salt; AES-256-GCM authenticates the ciphertext, so wrong passwords and
//! corrupted blobs are indistinguishable by construction.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use market_core::{Error, Result};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

/// OWASP-recommended minimum iteration count for PBKDF2-SHA256.
const PBKDF2_ITERATIONS: u32 = 480_000;
const SALT_SIZE: usize = 16;
/// 96-bit nonce as recommended for AES-GCM.
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Derive a 256-bit AES key from a password and salt.
fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, key.as_mut());
    key
}

/// Encrypt a secret with a password, returning the packed blob.
pub fn encrypt_secret(secret: &str, password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| Error::Decrypt)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_bytes())
        .map_err(|_| Error::Decrypt)?;

    let mut packed = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    packed.extend_from_slice(&salt);
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(packed))
}

/// Decrypt a packed blob with a password.
///
/// Every failure mode maps to the same generic [`Error::Decrypt`]; callers
/// must not be able to distinguish a wrong password from corrupted data.
pub fn decrypt_secret(blob: &str, password: &str) -> Result<Zeroizing<String>> {
    let packed = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|_| Error::Decrypt)?;
    if packed.len() <= SALT_SIZE + NONCE_SIZE {
        return Err(Error::Decrypt);
    }

    let salt = &packed[..SALT_SIZE];
    let nonce = &packed[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &packed[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| Error::Decrypt)?;
    let mut plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decrypt)?;

    let secret = String::from_utf8(plaintext.clone()).map_err(|_| Error::Decrypt)?;
    plaintext.zeroize();
    Ok(Zeroizing::new(secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn round_trip_returns_original_secret() {
        let blob = encrypt_secret(SECRET, "hunter42").unwrap();
        let decrypted = decrypt_secret(&blob, "hunter42").unwrap();
        assert_eq!(decrypted.as_str(), SECRET);
    }

    #[test]
    fn wrong_password_yields_generic_error() {
        let blob = encrypt_secret(SECRET, "hunter42").unwrap();
        let err = decrypt_secret(&blob, "hunter43").unwrap_err();
        assert!(matches!(err, Error::Decrypt));
        // The message must not leak which part failed.
        assert_eq!(
            err.to_string(),
            Error::Decrypt.to_string(),
            "decryption failures must be indistinguishable"
        );
    }

    #[test]
    fn corrupted_blob_yields_the_same_error() {
        let blob = encrypt_secret(SECRET, "hunter42").unwrap();
        let mut packed = base64::engine::general_purpose::STANDARD
            .decode(&blob)
            .unwrap();
        let last = packed.len() - 1;
        packed[last] ^= 0xFF;
        let tampered = base64::engine::general_purpose::STANDARD.encode(packed);

        let err = decrypt_secret(&tampered, "hunter42").unwrap_err();
        assert!(matches!(err, Error::Decrypt));

        let err = decrypt_secret("not-base64!!!", "hunter42").unwrap_err();
        assert!(matches!(err, Error::Decrypt));

        let err = decrypt_secret("AAAA", "hunter42").unwrap_err();
        assert!(matches!(err, Error::Decrypt));
    }

    #[test]
    fn fresh_salt_and_nonce_per_encryption() {
        let blob_a = encrypt_secret(SECRET, "hunter42").unwrap();
        let blob_b = encrypt_secret(SECRET, "hunter42").unwrap();
        assert_ne!(blob_a, blob_b);
        assert_eq!(
            decrypt_secret(&blob_a, "hunter42").unwrap().as_str(),
            decrypt_secret(&blob_b, "hunter42").unwrap().as_str(),
        );
    }
}
