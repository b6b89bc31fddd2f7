//! Durable uplink frame counter.
//!
//! The counter is stored as decimal ASCII under a single key. A missing or
//! unreadable value restarts the count at zero rather than failing the node.

use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use crate::traits::KeyValueStore;

pub const FRAME_COUNTER_KEY: &str = "frame_counter";

pub struct FrameCounterStore<K: KeyValueStore> {
    store: K,
}

impl<K: KeyValueStore> FrameCounterStore<K> {
    pub fn new(store: K) -> Self {
        FrameCounterStore { store }
    }

    /// Last persisted counter, or 0 if none exists or it cannot be read.
    pub fn load(&self) -> u32 {
        let raw = match self.store.read(FRAME_COUNTER_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("[Counter] No stored frame counter, starting at 0");
                return 0;
            }
            Err(e) => {
                warn!("[Counter] Failed to read frame counter ({}), starting at 0", e);
                return 0;
            }
        };

        match std::str::from_utf8(&raw).ok().and_then(|s| s.trim().parse::<u32>().ok()) {
            Some(fc) => {
                debug!("[Counter] Loaded {}", fc);
                fc
            }
            None => {
                warn!("[Counter] Stored frame counter is corrupt ({:02X?}), starting at 0", raw);
                0
            }
        }
    }

    /// Overwrite the durable counter. Failures are logged and returned; callers
    /// continue the uplink regardless.
    pub fn save(&mut self, fc: u32) -> Result<()> {
        match self.store.write(FRAME_COUNTER_KEY, fc.to_string().as_bytes()) {
            Ok(()) => {
                debug!("[Counter] Saved {}", fc);
                Ok(())
            }
            Err(e) => {
                error!("[Counter] Failed to persist frame counter {}: {}", fc, e);
                Err(e)
            }
        }
    }

    /// Operator action: restart the count at zero.
    pub fn reset(&mut self) -> Result<()> {
        warn!("[Counter] Resetting frame counter to 0");
        self.save(0)
    }
}

/// One file per key under a state directory. Writes go through a temporary
/// file and a rename so a power cut never leaves a half-written value.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| anyhow!("Failed to create state directory {}: {}", dir.display(), e))?;
        Ok(FileStore { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(anyhow!("Invalid store key '{}'", key));
        }
        Ok(self.dir.join(key))
    }
}

fn write_synced(path: &Path, value: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(value)?;
    file.sync_all()
}

/// Persist the rename itself. Directories cannot be opened for sync on Windows.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| anyhow!("Failed to sync state directory {}: {}", dir.display(), e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

impl KeyValueStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("tmp");
        let written = write_synced(&tmp, value).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = written {
            if let Err(rm) = fs::remove_file(&tmp) {
                debug!("[Counter] Could not remove {}: {}", tmp.display(), rm);
            }
            return Err(anyhow!("Failed to write {}: {}", path.display(), e));
        }
        sync_dir(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockKeyValueStore;

    #[test]
    fn test_missing_counter_starts_at_zero() {
        let mut kv = MockKeyValueStore::new();
        kv.expect_read().withf(|key| key == FRAME_COUNTER_KEY).returning(|_| Ok(None));
        assert_eq!(FrameCounterStore::new(kv).load(), 0);
    }

    #[test]
    fn test_corrupt_counter_starts_at_zero() {
        let _ = env_logger::builder().is_test(true).try_init();
        for raw in [b"abc".to_vec(), vec![0xFF, 0xFE], b"-4".to_vec(), b"99999999999".to_vec()] {
            let mut kv = MockKeyValueStore::new();
            kv.expect_read().returning(move |_| Ok(Some(raw.clone())));
            assert_eq!(FrameCounterStore::new(kv).load(), 0);
        }
    }

    #[test]
    fn test_read_error_starts_at_zero() {
        let mut kv = MockKeyValueStore::new();
        kv.expect_read().returning(|_| Err(anyhow!("flash read failed")));
        assert_eq!(FrameCounterStore::new(kv).load(), 0);
    }

    #[test]
    fn test_counter_tolerates_trailing_newline() {
        let mut kv = MockKeyValueStore::new();
        kv.expect_read().returning(|_| Ok(Some(b"42\n".to_vec())));
        assert_eq!(FrameCounterStore::new(kv).load(), 42);
    }

    #[test]
    fn test_save_writes_decimal() {
        let mut kv = MockKeyValueStore::new();
        kv.expect_write()
            .withf(|key, value| key == FRAME_COUNTER_KEY && value == b"1234")
            .times(1)
            .returning(|_, _| Ok(()));
        let mut store = FrameCounterStore::new(kv);
        assert!(store.save(1234).is_ok());
    }

    #[test]
    fn test_save_failure_is_returned() {
        let mut kv = MockKeyValueStore::new();
        kv.expect_write().returning(|_, _| Err(anyhow!("disk full")));
        let mut store = FrameCounterStore::new(kv);
        assert!(store.save(7).is_err());
    }

    #[test]
    fn test_counter_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let mut store = FrameCounterStore::new(FileStore::open(dir.path()).unwrap());
        assert_eq!(store.load(), 0);
        store.save(5).unwrap();
        drop(store);

        let reloaded = FrameCounterStore::new(FileStore::open(dir.path()).unwrap());
        assert_eq!(reloaded.load(), 5);
    }

    #[test]
    fn test_reset_sets_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameCounterStore::new(FileStore::open(dir.path()).unwrap());
        store.save(812).unwrap();
        store.reset().unwrap();
        assert_eq!(store.load(), 0);
        assert_eq!(fs::read(dir.path().join(FRAME_COUNTER_KEY)).unwrap(), b"0");
    }

    #[test]
    #[cfg(unix)]
    fn test_failed_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory in the way makes the rename fail
        let blocker = dir.path().join(FRAME_COUNTER_KEY);
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        let mut store = FileStore::open(dir.path()).unwrap();
        assert!(store.write(FRAME_COUNTER_KEY, b"3").is_err());
        assert!(!dir.path().join("frame_counter.tmp").exists());

        // Normal writes still land once the path is free
        fs::remove_dir_all(&blocker).unwrap();
        store.write(FRAME_COUNTER_KEY, b"4").unwrap();
        assert_eq!(store.read(FRAME_COUNTER_KEY).unwrap(), Some(b"4".to_vec()));
        assert!(!dir.path().join("frame_counter.tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        assert!(store.write("../escape", b"1").is_err());
        assert!(store.read("").is_err());
        assert_eq!(store.read("absent").unwrap(), None);
    }
}
