//! Object storage boundary for attachment and avatar bytes.
//!
//! The import pipeline only sees [`BlobStore`]; the production
//! implementation is a filesystem tree keyed by destination UUID with a JSON
//! metadata sidecar so blobs can be garbage-collected by context later.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{GantryError, Result};

/// Context a blob belongs to, recorded alongside the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub workspace_id: Uuid,
    pub project_id: Option<Uuid>,
    pub issue_id: Option<Uuid>,
    pub comment_id: Option<Uuid>,
    /// Original source reference (remote attachment id or URL).
    pub source: String,
}

/// Outcome of a successful save.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub id: Uuid,
    pub size: u64,
    pub content_hash: String,
}

/// Blob storage consumed by the import pipeline.
pub trait BlobStore: Send + Sync {
    /// Store `size` bytes from `reader` under `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be read or stored.
    fn save(
        &self,
        reader: &mut dyn Read,
        size: u64,
        dest: Uuid,
        content_type: &str,
        metadata: &BlobMetadata,
    ) -> Result<StoredBlob>;

    /// Delete the blob stored under `dest`. Deleting a missing blob is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails for any other reason.
    fn delete(&self, dest: Uuid) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    size: u64,
    content_hash: String,
    metadata: BlobMetadata,
}

/// Filesystem-backed blob store.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn sidecar_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.meta.json"))
    }
}

impl BlobStore for FsBlobStore {
    fn save(
        &self,
        reader: &mut dyn Read,
        size: u64,
        dest: Uuid,
        content_type: &str,
        metadata: &BlobMetadata,
    ) -> Result<StoredBlob> {
        let final_path = self.blob_path(dest);
        let temp_path = self.root.join(format!("{dest}.tmp"));

        // Write to a temp file and rename so a crashed transfer never leaves
        // a half-written blob under the final name.
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                writer.write_all(&buf[..n])?;
                written += n as u64;
            }
            writer.flush()?;
            writer
                .into_inner()
                .map_err(|e| GantryError::Io(e.into_error()))?
                .sync_all()?;
        }

        if size > 0 && written != size {
            let _ = fs::remove_file(&temp_path);
            return Err(GantryError::Blob(format!(
                "blob {dest}: declared {size} bytes, read {written}"
            )));
        }

        fs::rename(&temp_path, &final_path)?;

        let content_hash = format!("{:x}", hasher.finalize());
        let sidecar = Sidecar {
            content_type: content_type.to_string(),
            size: written,
            content_hash: content_hash.clone(),
            metadata: metadata.clone(),
        };
        fs::write(self.sidecar_path(dest), serde_json::to_vec_pretty(&sidecar)?)?;

        Ok(StoredBlob {
            id: dest,
            size: written,
            content_hash,
        })
    }

    fn delete(&self, dest: Uuid) -> Result<()> {
        for path in [self.blob_path(dest), self.sidecar_path(dest)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(GantryError::Io(e)),
            }
        }
        Ok(())
    }
}
