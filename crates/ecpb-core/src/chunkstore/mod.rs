use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::chunker;
use crate::compress::{self, Compression};
use crate::crypto::aes_cbc::{self, JobKey};
use crate::crypto::sha256::{self, Hash};
use crate::db::MetaStore;
use crate::error::{EcpbError, Result};
use crate::types::{format_bytes, ChunkRecord, ChunkRef, FileManifest};

/// Content-addressed chunk storage: splits files into fixed-size chunks,
/// deduplicates against the metadata store, runs the compress-then-encrypt
/// pipeline, and inverts all of it on restore.
pub struct ChunkStore {
    store: Arc<MetaStore>,
    storage_dir: PathBuf,
    /// In-memory hash -> record cache to skip metadata lookups for chunks
    /// this process has already touched.
    record_cache: Mutex<HashMap<Hash, ChunkRecord>>,
}

impl ChunkStore {
    pub fn new(store: Arc<MetaStore>, storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(storage_dir.join("chunks"))?;
        Ok(Self {
            store,
            storage_dir,
            record_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Content-addressed path: `<storage>/chunks/<xx>/<yy>/<hex>` where
    /// `xx`/`yy` are the first two hex character pairs of the hash.
    pub fn chunk_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.storage_dir
            .join("chunks")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }

    /// Chunk, deduplicate, transform and store one file, returning its
    /// manifest. The manifest is committed to the metadata store only after
    /// every fresh chunk has been written and recorded.
    ///
    /// An unreadable source yields an empty, uncommitted manifest. A chunk
    /// whose encryption fails is skipped with an error log; failures to
    /// record metadata abort the file.
    pub fn store_file(
        &self,
        file_path: &Path,
        compression: Compression,
        encrypt: bool,
        key: Option<&JobKey>,
        job_id: i64,
        relative_path: &str,
    ) -> Result<FileManifest> {
        let mut manifest = FileManifest {
            relative_path: if relative_path.is_empty() {
                file_path.to_string_lossy().into_owned()
            } else {
                relative_path.to_string()
            },
            file_name: file_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ..FileManifest::default()
        };

        let meta = match fs::metadata(file_path) {
            Ok(m) => m,
            Err(e) => {
                error!(path = %file_path.display(), error = %e, "cannot stat file");
                return Ok(manifest);
            }
        };
        manifest.file_size = meta.len();
        manifest.modified_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        manifest.file_hash = Some(sha256::digest_file(file_path)?);

        let key = if encrypt {
            Some(key.ok_or_else(|| EcpbError::Crypto("no key for encrypting store".into()))?)
        } else {
            None
        };

        let file = match File::open(file_path) {
            Ok(f) => f,
            Err(e) => {
                error!(path = %file_path.display(), error = %e, "cannot open file");
                return Ok(manifest);
            }
        };

        for chunk in chunker::chunk_reader(file) {
            let chunk = chunk?;
            let hash = sha256::digest_bytes(&chunk.data);

            let mut chunk_ref = ChunkRef {
                hash,
                index: chunk.index,
                offset: chunk.offset,
                size: chunk.data.len() as u32,
                deduplicated: false,
            };

            if self.store.chunk_exists(&hash)? {
                chunk_ref.deduplicated = true;
                // The ref count mirrors how many manifest rows name this
                // hash, so a deduplicated reference still counts.
                self.store.increment_chunk_ref(&hash)?;
                debug!(hash = %hash, "chunk deduplicated");
            } else {
                // Transform pipeline: compress, then encrypt. A failed
                // compression falls back to the raw bytes; a failed
                // encryption skips the chunk entirely.
                let mut encoded = if compression != Compression::None {
                    match compress::compress(compression, &chunk.data) {
                        Ok(out) => out,
                        Err(e) => {
                            debug!(hash = %hash, error = %e, "compression failed, storing raw");
                            chunk.data.clone()
                        }
                    }
                } else {
                    chunk.data.clone()
                };

                if let Some(key) = key {
                    encoded = match aes_cbc::encrypt(key, &encoded) {
                        Ok(ct) => ct,
                        Err(e) => {
                            error!(hash = %hash, error = %e, "encryption failed, skipping chunk");
                            continue;
                        }
                    };
                }

                let path = self.chunk_path(&hash);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, &encoded)?;

                let record = ChunkRecord {
                    hash,
                    storage_path: path.to_string_lossy().into_owned(),
                    original_size: chunk.data.len() as u32,
                    stored_size: encoded.len() as u32,
                    compression,
                    encrypted: key.is_some(),
                    ref_count: 1,
                };
                self.store.store_chunk(&record)?;
                self.record_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(hash, record);
            }

            manifest.chunks.push(chunk_ref);
        }

        self.store.store_file_manifest(job_id, &manifest)?;

        info!(
            file = %manifest.file_name,
            size = %format_bytes(manifest.file_size),
            chunks = manifest.chunks.len(),
            "stored file"
        );
        Ok(manifest)
    }

    /// Reassemble a file from its manifest, verifying every chunk hash and
    /// the whole-file hash. Any missing chunk, failed decrypt/decode or
    /// hash mismatch aborts this file.
    ///
    /// Each chunk is decoded by its own record, not the job's settings: a
    /// deduplicated chunk may have been written by a job with a different
    /// compression or encryption choice.
    pub fn restore_file(
        &self,
        manifest: &FileManifest,
        dest_path: &Path,
        key: Option<&JobKey>,
    ) -> Result<()> {
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest_path)?;

        for chunk in &manifest.chunks {
            let record = self.lookup_chunk(&chunk.hash)?;
            let mut data = fs::read(&record.storage_path)?;

            if record.encrypted {
                let key = key
                    .ok_or_else(|| EcpbError::Crypto("no key for encrypted restore".into()))?;
                data = aes_cbc::decrypt(key, &data)?;
            }
            if record.compression != Compression::None {
                data = compress::decompress(record.compression, &data, chunk.size as usize)?;
            }

            let actual = sha256::digest_bytes(&data);
            if actual != chunk.hash {
                return Err(EcpbError::Integrity {
                    context: format!("chunk {} of {}", chunk.index, manifest.relative_path),
                    expected: chunk.hash.to_hex(),
                    actual: actual.to_hex(),
                });
            }
            out.write_all(&data)?;
        }
        out.flush()?;
        drop(out);

        if let Some(expected) = manifest.file_hash {
            let actual = sha256::digest_file(dest_path)?;
            if actual != expected {
                return Err(EcpbError::Integrity {
                    context: format!("file {}", manifest.relative_path),
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }

        info!(
            path = %dest_path.display(),
            size = %format_bytes(manifest.file_size),
            "restored file"
        );
        Ok(())
    }

    fn lookup_chunk(&self, hash: &Hash) -> Result<ChunkRecord> {
        if let Some(record) = self
            .record_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
        {
            return Ok(record.clone());
        }
        self.store
            .get_chunk_meta(hash)?
            .ok_or_else(|| EcpbError::ChunkMissing(hash.to_hex()))
    }
}
