//! Append-only on-disk archive of raw messages
//!
//! Directory structure:
//! ```text
//! <root>/accounts/<address>/emails/
//!   2024/
//!     03/
//!       20240315_093012_3f9a1c2be07d.eml
//!       20240315_093012_3f9a1c2be07d_1.eml   # different content, same slot
//!   unknown/
//!     8d2e4b6a0c1f.eml                       # no usable Date header
//! ```
//!
//! Files are written through a temp file in the destination directory and
//! hard-linked into place; where links are unsupported the bytes are written
//! to a freshly created file instead. Existing files are never overwritten
//! or removed.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use log::debug;
use walkdir::WalkDir;

use crate::identity::sha256_hex;
use crate::models::EmailId;

/// Upper bound on `_N` suffixes tried for one slot
const MAX_COLLISION_SUFFIX: u32 = 1000;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of storing one message
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFile {
    /// Path relative to the archive root, `/`-separated
    pub relative_path: String,
    pub content_hash: String,
    pub size: u64,
    /// An identical file was already in place
    pub reused: bool,
}

pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    /// Open (creating if needed) the archive rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("accounts"))
            .with_context(|| format!("Failed to create archive at {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of an archive-relative path
    pub fn absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Deterministic slot for a message, before collision handling
    pub fn slot_for(account: &str, date: Option<DateTime<Utc>>, email_id: &EmailId) -> String {
        let account = sanitize_component(account);
        match date {
            Some(date) => format!(
                "accounts/{}/emails/{}/{}_{}.eml",
                account,
                date.format("%Y/%m"),
                date.format("%Y%m%d_%H%M%S"),
                email_id.short()
            ),
            None => format!("accounts/{}/emails/unknown/{}.eml", account, email_id.short()),
        }
    }

    /// Store raw bytes for a message
    ///
    /// When the slot already holds the same bytes the file is reused; when it
    /// holds different bytes a `_N` suffix is appended.
    pub fn save(
        &self,
        account: &str,
        date: Option<DateTime<Utc>>,
        email_id: &EmailId,
        raw: &[u8],
    ) -> Result<SavedFile> {
        let content_hash = sha256_hex(raw);
        let slot = Self::slot_for(account, date, email_id);
        let stem = slot.trim_end_matches(".eml");

        for attempt in 0..=MAX_COLLISION_SUFFIX {
            let relative_path = if attempt == 0 {
                slot.clone()
            } else {
                format!("{}_{}.eml", stem, attempt)
            };
            let path = self.absolute(&relative_path);

            if path.exists() {
                if self.hash_file(&relative_path)?.as_deref() == Some(content_hash.as_str()) {
                    debug!("Reusing archived file {}", relative_path);
                    return Ok(SavedFile {
                        relative_path,
                        content_hash,
                        size: raw.len() as u64,
                        reused: true,
                    });
                }
                continue;
            }

            if self.write_new(&path, raw)? {
                return Ok(SavedFile {
                    relative_path,
                    content_hash,
                    size: raw.len() as u64,
                    reused: false,
                });
            }
        }

        bail!("No free archive slot for {} after {} attempts", slot, MAX_COLLISION_SUFFIX)
    }

    /// Write `raw` to `path` atomically; returns false if `path` appeared meanwhile
    fn write_new(&self, path: &Path, raw: &[u8]) -> Result<bool> {
        let parent = path.parent().context("Archive path has no parent")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;

        let temp_path = parent.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| -> Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(raw)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.context(format!("Failed to write {}", temp_path.display())));
        }

        // hard_link fails if the destination exists, unlike rename
        let linked = match fs::hard_link(&temp_path, path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => {
                debug!("Hard link into {} failed ({}); writing directly", path.display(), e);
                write_exclusive(path, raw)
            }
        };
        let _ = fs::remove_file(&temp_path);
        linked
    }

    pub fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.absolute(relative);
        fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.absolute(relative).is_file()
    }

    /// SHA-256 of an archived file, or None if it does not exist
    pub fn hash_file(&self, relative: &str) -> Result<Option<String>> {
        let path = self.absolute(relative);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Every archived `.eml` file, as relative paths
    pub fn list_files(&self) -> Result<Vec<String>> {
        let accounts = self.root.join("accounts");
        let mut files = Vec::new();

        for entry in WalkDir::new(&accounts).sort_by_file_name() {
            let entry = entry.context("Failed to walk archive directory")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("eml") {
                continue;
            }
            let relative = path
                .strip_prefix(&self.root)
                .context("Archive entry outside root")?;
            let parts: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(parts.join("/"));
        }

        Ok(files)
    }
}

/// Create `path` and write `raw` into it; returns false if `path` already exists
fn write_exclusive(path: &Path, raw: &[u8]) -> Result<bool> {
    let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("Failed to create {}", path.display())),
    };

    let written = file.write_all(raw).and_then(|()| file.sync_all());
    if let Err(e) = written {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e).with_context(|| format!("Failed to write {}", path.display()));
    }
    Ok(true)
}

/// Make an account address safe as a single path component
fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn id() -> EmailId {
        EmailId::new("3f9a1c2be07d55aa00112233")
    }

    #[test]
    fn test_slot_layout() {
        let date = Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 12).unwrap();
        assert_eq!(
            ArchiveStore::slot_for("a@x.com", Some(date), &id()),
            "accounts/a@x.com/emails/2024/03/20240315_093012_3f9a1c2be07d.eml"
        );
        assert_eq!(
            ArchiveStore::slot_for("a@x.com", None, &id()),
            "accounts/a@x.com/emails/unknown/3f9a1c2be07d.eml"
        );
        assert_eq!(
            ArchiveStore::slot_for("../evil", None, &id()),
            "accounts/.._evil/emails/unknown/3f9a1c2be07d.eml"
        );
    }

    #[test]
    fn test_save_and_read_back() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();

        let saved = store.save("a@x.com", None, &id(), b"raw message").unwrap();
        assert!(!saved.reused);
        assert_eq!(saved.size, 11);
        assert_eq!(saved.content_hash, sha256_hex(b"raw message"));
        assert_eq!(store.read(&saved.relative_path).unwrap(), b"raw message");
        assert_eq!(store.list_files().unwrap(), vec![saved.relative_path.clone()]);
    }

    #[test]
    fn test_identical_content_is_reused() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();

        let first = store.save("a@x.com", None, &id(), b"same").unwrap();
        let second = store.save("a@x.com", None, &id(), b"same").unwrap();
        assert_eq!(first.relative_path, second.relative_path);
        assert!(second.reused);
        assert_eq!(store.list_files().unwrap().len(), 1);
    }

    #[test]
    fn test_different_content_gets_suffix_and_original_survives() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();

        let first = store.save("a@x.com", None, &id(), b"first").unwrap();
        let second = store.save("a@x.com", None, &id(), b"second").unwrap();
        assert_eq!(second.relative_path, "accounts/a@x.com/emails/unknown/3f9a1c2be07d_1.eml");
        assert_eq!(store.read(&first.relative_path).unwrap(), b"first");
        assert_eq!(store.read(&second.relative_path).unwrap(), b"second");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();
        let saved = store.save("a@x.com", None, &id(), b"bytes").unwrap();

        let parent = store.absolute(&saved.relative_path).parent().unwrap().to_path_buf();
        let names: Vec<_> = fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["3f9a1c2be07d.eml"]);
    }

    #[test]
    fn test_direct_write_never_replaces_a_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taken.eml");
        fs::write(&path, b"original").unwrap();

        assert!(!write_exclusive(&path, b"replacement").unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"original");

        let fresh = dir.path().join("fresh.eml");
        assert!(write_exclusive(&fresh, b"new").unwrap());
        assert_eq!(fs::read(&fresh).unwrap(), b"new");
    }

    #[test]
    fn test_hash_of_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();
        assert_eq!(store.hash_file("accounts/a/emails/unknown/nope.eml").unwrap(), None);
    }
}
