//! Content store operations: MIME detection, dated-bucket relocation,
//! atomic intake/quarantine writes, and the filesystem lockfile.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use kvitto_core::{Error, Result};

use crate::hashing::sha256_file;
use crate::layout::{StorageLayout, BUCKET_DIR};
use crate::paths::{resolve_under, RelPath};

/// Extension → MIME table, checked before magic bytes.
const EXT_MIME: &[(&str, &str)] = &[
    ("pdf", "application/pdf"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("heic", "image/heic"),
    ("bmp", "image/bmp"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("html", "text/html"),
];

/// Outcome of a relocation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveResult {
    /// False when the move was unnecessary (already in place, missing
    /// source, or identical file at the destination).
    pub moved: bool,
    /// Where the file lives now (equals the source when `moved` is false
    /// because nothing happened).
    pub dst_rel: RelPath,
}

/// Filesystem operations rooted at a [`StorageLayout`].
#[derive(Debug, Clone)]
pub struct ContentStore {
    layout: StorageLayout,
}

impl ContentStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Absolute path for a root-relative location.
    pub fn resolve(&self, rel: &RelPath) -> Result<PathBuf> {
        resolve_under(self.layout.root(), rel)
    }

    /// Size and MIME type of a file.
    ///
    /// Extension table first, `infer` magic bytes as fallback. Unknown type
    /// is the empty string, never an error.
    pub async fn stat_file(&self, abs: &Path) -> Result<(i64, String)> {
        let meta = fs::metadata(abs).await?;
        let mime = detect_mime(abs).await;
        Ok((meta.len() as i64, mime))
    }

    /// Move a file into the dated bucket `receipts_raw/<YYYY-MM-DD>`.
    ///
    /// Idempotent: a source already under the bucket, a missing source, or
    /// an identical file at the destination all yield `moved=false` without
    /// touching the filesystem. A name collision with a different file gets
    /// the destination suffixed with the first 8 hex chars of `digest`.
    ///
    /// With `keep_subdirs`, the source's directory structure below its
    /// top-level area is preserved under the bucket date directory.
    pub async fn move_into_bucket(
        &self,
        src_rel: &RelPath,
        date: NaiveDate,
        digest: &str,
        keep_subdirs: bool,
    ) -> Result<MoveResult> {
        if src_rel.starts_with_dir(BUCKET_DIR) {
            return Ok(MoveResult {
                moved: false,
                dst_rel: src_rel.clone(),
            });
        }

        let src_abs = self.resolve(src_rel)?;
        if !fs::try_exists(&src_abs).await? {
            debug!(src = %src_rel, "move_into_bucket: source missing, skipping");
            return Ok(MoveResult {
                moved: false,
                dst_rel: src_rel.clone(),
            });
        }

        let mut dst_dir = self.layout.bucket_dir(date);
        if keep_subdirs {
            if let Some(subdirs) = strip_top_level(src_rel.parent()) {
                dst_dir = format!("{}/{}", dst_dir, subdirs);
            }
        }

        let name = src_rel.file_name();
        let mut dst_rel = RelPath::normalize(&format!("{}/{}", dst_dir, name))?;
        let mut dst_abs = self.resolve(&dst_rel)?;

        if dst_abs == src_abs {
            return Ok(MoveResult {
                moved: false,
                dst_rel,
            });
        }

        if fs::try_exists(&dst_abs).await? {
            // Same name, different physical file: disambiguate by digest.
            let suffixed = collision_name(name, digest);
            dst_rel = RelPath::normalize(&format!("{}/{}", dst_dir, suffixed))?;
            dst_abs = self.resolve(&dst_rel)?;
        }

        if let Some(parent) = dst_abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&src_abs, &dst_abs).await?;
        debug!(src = %src_rel, dst = %dst_rel, "move_into_bucket: moved");

        Ok(MoveResult {
            moved: true,
            dst_rel,
        })
    }

    /// Atomically write attachment bytes into the dated incoming area.
    ///
    /// Returns the root-relative path of the stored file. A name collision
    /// with different content applies the digest suffix; an identical file
    /// already present is reused as-is.
    pub async fn write_incoming(
        &self,
        date: NaiveDate,
        filename: &str,
        digest: &str,
        data: &[u8],
    ) -> Result<RelPath> {
        let dir = self.layout.incoming_dir(date);
        self.write_dated(&dir, filename, digest, data).await
    }

    /// Atomically write rejected attachment bytes into the quarantine area.
    pub async fn write_quarantine(
        &self,
        date: NaiveDate,
        filename: &str,
        digest: &str,
        data: &[u8],
    ) -> Result<RelPath> {
        let dir = self.layout.quarantine_dir(date);
        self.write_dated(&dir, filename, digest, data).await
    }

    async fn write_dated(
        &self,
        dir: &str,
        filename: &str,
        digest: &str,
        data: &[u8],
    ) -> Result<RelPath> {
        let safe_name = sanitize_filename(filename);
        let mut rel = RelPath::normalize(&format!("{}/{}", dir, safe_name))?;
        let mut abs = self.resolve(&rel)?;

        if fs::try_exists(&abs).await? {
            if sha256_file(&abs).await? == digest {
                return Ok(rel);
            }
            let suffixed = collision_name(&safe_name, digest);
            rel = RelPath::normalize(&format!("{}/{}", dir, suffixed))?;
            abs = self.resolve(&rel)?;
        }

        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Atomic write: temp file + rename
        let tmp = abs.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await.map_err(|e| {
            warn!(path = %tmp.display(), error = %e, "content_store: create failed");
            e
        })?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &abs).await?;

        Ok(rel)
    }
}

/// Best-effort pid lockfile. Acquisition fails while the file exists; the
/// file is removed on drop.
#[derive(Debug)]
pub struct Lockfile {
    path: PathBuf,
}

impl Lockfile {
    /// Try to create the lockfile. `Ok(None)` means another holder exists.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "lockfile: release failed");
        }
    }
}

/// Destination name for a collision: `stem__<first 8 digest hex>.ext`.
pub fn collision_name(name: &str, digest: &str) -> String {
    let tag = &digest[..8.min(digest.len())];
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}__{}.{}", stem, tag, ext),
        _ => format!("{}__{}", name, tag),
    }
}

/// Strip path separators and control characters from an untrusted filename.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}

/// MIME type by extension table, falling back to magic bytes.
async fn detect_mime(abs: &Path) -> String {
    if let Some(ext) = abs.extension().and_then(|e| e.to_str()) {
        let lower = ext.to_lowercase();
        if let Some((_, mime)) = EXT_MIME.iter().find(|(e, _)| *e == lower) {
            return (*mime).to_string();
        }
    }
    match read_prefix(abs, 8192).await {
        Ok(buf) => infer::get(&buf)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

async fn read_prefix(abs: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = fs::File::open(abs).await?;
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Drop the first segment of a relative directory ("incoming/a/b" → "a/b").
fn strip_top_level(dir: &str) -> Option<&str> {
    dir.split_once('/').map(|(_, rest)| rest).filter(|r| !r.is_empty())
}
