use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EcpbError, Result};

const HASH_LEN: usize = 32;

/// Read buffer for streaming file hashes. Matches the chunk size so a
/// file's chunk boundaries and hash reads line up.
const READ_BUF_SIZE: usize = 64 * 1024;

/// SHA-256 digest of a chunk's or file's original bytes.
/// Canonical textual form is 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| EcpbError::Argument(format!("invalid hash hex: {e}")))?;
        let arr: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| EcpbError::Argument(format!("hash must be {HASH_LEN} bytes")))?;
        Ok(Hash(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

/// Hash a byte slice.
pub fn digest_bytes(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    Hash(digest.into())
}

/// Hash a whole file via streaming reads without loading it into memory.
pub fn digest_file(path: &Path) -> Result<Hash> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Hash(hasher.finalize().into()))
}
