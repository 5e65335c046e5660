use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// Plaintext round-tripped to prove the cipher works on this host
pub const SELF_TEST_PROBE: &str = "SECURITY_TEST";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("envelope is not valid base64")]
    InvalidEncoding,

    #[error("envelope of {0} bytes is too short or not block aligned")]
    Malformed(usize),

    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("cipher self-test failed")]
    SelfTestFailed,
}

/// AES-128-CBC envelope keyed from a shared device identifier
///
/// Envelope layout is `base64(iv || ciphertext)` with a fresh random IV per message.
#[derive(Clone)]
pub struct SecureChannel {
    key: [u8; KEY_LEN],
}

impl SecureChannel {
    /// Key is the first 16 bytes of SHA-256 over the identifier
    pub fn from_device_id(device_id: &str) -> Self {
        let digest = Sha256::digest(device_id.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest[..KEY_LEN]);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut envelope = Vec::with_capacity(IV_LEN + ciphertext.len());
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(&ciphertext);
        STANDARD.encode(envelope)
    }

    /// Decode an envelope; whitespace inside it (line-wrapped base64) is ignored
    pub fn decrypt(&self, envelope: &str) -> Result<String, ChannelError> {
        let compact: String = envelope.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact)
            .map_err(|_| ChannelError::InvalidEncoding)?;

        if bytes.len() < IV_LEN + BLOCK_LEN || (bytes.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(ChannelError::Malformed(bytes.len()));
        }

        let (iv, ciphertext) = bytes.split_at(IV_LEN);
        let plaintext = Aes128CbcDec::new_from_slices(&self.key, iv)
            .map_err(|_| ChannelError::Malformed(bytes.len()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ChannelError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| ChannelError::InvalidUtf8)
    }

    pub fn self_test(&self) -> Result<(), ChannelError> {
        match self.decrypt(&self.encrypt(SELF_TEST_PROBE)) {
            Ok(text) if text == SELF_TEST_PROBE => Ok(()),
            _ => Err(ChannelError::SelfTestFailed),
        }
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel").finish_non_exhaustive()
    }
}
