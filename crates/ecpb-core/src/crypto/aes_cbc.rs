use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{EcpbError, Result};
use crate::types::{AES_IV_LEN, AES_KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_BLOCK_SIZE: usize = 16;

/// Symmetric key recorded per job. Stored in the metadata store as
/// 64 lowercase hex characters.
#[derive(Clone, PartialEq, Eq)]
pub struct JobKey([u8; AES_KEY_LEN]);

impl JobKey {
    /// Sample a fresh key from the OS-seeded CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        JobKey(key)
    }

    pub fn from_bytes(bytes: [u8; AES_KEY_LEN]) -> Self {
        JobKey(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| EcpbError::Crypto(format!("invalid key hex: {e}")))?;
        let arr: [u8; AES_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| EcpbError::Crypto(format!("key must be {AES_KEY_LEN} bytes")))?;
        Ok(JobKey(arr))
    }
}

impl std::fmt::Debug for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("JobKey(..)")
    }
}

/// Encrypt with AES-256-CBC and PKCS#7 padding.
/// Wire format: `[16-byte IV][ciphertext]` with a fresh random IV per call.
pub fn encrypt(key: &JobKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; AES_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new((&key.0).into(), (&iv).into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(AES_IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data produced by [`encrypt`]. Splits off the IV prefix.
pub fn decrypt(key: &JobKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < AES_IV_LEN + AES_BLOCK_SIZE {
        return Err(EcpbError::Crypto("ciphertext too short".into()));
    }
    let (iv, ciphertext) = data.split_at(AES_IV_LEN);
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(EcpbError::Crypto(
            "ciphertext is not block-aligned".into(),
        ));
    }

    let iv: &[u8; AES_IV_LEN] = iv.try_into().expect("split_at yields exactly AES_IV_LEN");
    Aes256CbcDec::new((&key.0).into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| EcpbError::Crypto("decryption failed: wrong key or corrupted data".into()))
}
