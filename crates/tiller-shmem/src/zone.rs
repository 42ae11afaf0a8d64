//! Zone mapping implementation.

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiller_core::{Error, Result};

/// Magic number identifying a zone file header.
const ZONE_MAGIC: u64 = u64::from_le_bytes(*b"TILLZONE");

/// Current zone file format version.
const ZONE_VERSION: u32 = 1;

/// Header size; zone data starts at this offset.
const HEADER_SIZE: usize = 64;

const MAGIC_RANGE: std::ops::Range<usize> = 0..8;
const VERSION_RANGE: std::ops::Range<usize> = 8..12;
const INIT_FLAG_RANGE: std::ops::Range<usize> = 12..16;
const SIZE_RANGE: std::ops::Range<usize> = 16..24;

fn read_u64(map: &[u8], range: std::ops::Range<usize>) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&map[range]);
    u64::from_le_bytes(buf)
}

fn read_u32(map: &[u8], range: std::ops::Range<usize>) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&map[range]);
    u32::from_le_bytes(buf)
}

/// Identity of a shared memory zone request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSpec {
    /// Zone name; identity across reloads
    pub name: String,
    /// Requested data size in bytes (header excluded)
    pub size: u64,
    /// Owning module name, disambiguates same-named zones
    pub tag: String,
    /// Force a fresh region on every reload
    pub noreuse: bool,
}

impl ZoneSpec {
    /// Create a reusable zone spec.
    pub fn new(name: impl Into<String>, size: u64, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            tag: tag.into(),
            noreuse: false,
        }
    }

    /// Mark the zone as never reused across reloads.
    pub fn noreuse(mut self) -> Self {
        self.noreuse = true;
        self
    }
}

/// One-time zone initializer, invoked exactly once per backing mapping.
pub type ZoneInit = Arc<dyn Fn(&mut [u8]) -> Result<()> + Send + Sync>;

/// A mapped zone file.
///
/// The initializer flag lives inside the mapping header, and mapping setup
/// holds an exclusive file lock, so concurrent processes attaching to the
/// same file never race the initializer.
pub(crate) struct ZoneMapping {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
    map: Mutex<MmapMut>,
    size: u64,
    remove_on_drop: bool,
}

impl std::fmt::Debug for ZoneMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneMapping")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl ZoneMapping {
    /// Create or attach to the zone file at `path`.
    ///
    /// With `attach` set, an existing file (handed over by the previous
    /// binary during an upgrade) is size-checked and its initializer is
    /// skipped. Without it, any leftover file at `path` is unlinked first
    /// and the zone starts from a zeroed region; unlinking keeps live
    /// mappings in other processes intact while this one gets a new inode.
    pub(crate) fn open(
        name: &str,
        path: &Path,
        size: u64,
        init: &ZoneInit,
        attach: bool,
        remove_on_drop: bool,
    ) -> Result<Arc<Self>> {
        if !attach {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::zone(
                        name,
                        format!("failed to remove stale {}: {e}", path.display()),
                    ));
                }
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::zone(name, format!("failed to open {}: {e}", path.display())))?;

        // The lock covers header setup and the run-once initializer; any
        // other process attaching to this file blocks here until both are
        // done.
        file.lock_exclusive()
            .map_err(|e| Error::zone(name, format!("failed to lock {}: {e}", path.display())))?;

        let total = HEADER_SIZE as u64 + size;
        let existing_len = file
            .metadata()
            .map_err(|e| Error::zone(name, e.to_string()))?
            .len();
        let fresh_file = existing_len == 0;
        if fresh_file {
            file.set_len(total)
                .map_err(|e| Error::zone(name, format!("failed to size zone: {e}")))?;
        }

        // SAFETY: the file is exclusively locked while we mutate it, and
        // the mapping is only ever accessed through the interior mutex.
        let mut map = unsafe {
            MmapOptions::new()
                .len(total as usize)
                .map_mut(&file)
                .map_err(|e| Error::zone(name, format!("failed to map {}: {e}", path.display())))?
        };

        let header_magic = read_u64(&map, MAGIC_RANGE);
        if header_magic == ZONE_MAGIC {
            let version = read_u32(&map, VERSION_RANGE);
            if version != ZONE_VERSION {
                FileExt::unlock(&file).ok();
                return Err(Error::zone(
                    name,
                    format!("zone file version {version} is not supported"),
                ));
            }
            let stored = read_u64(&map, SIZE_RANGE);
            if stored != size {
                FileExt::unlock(&file).ok();
                return Err(Error::zone_conflict(
                    name,
                    format!("existing mapping is {stored} bytes, requested {size}"),
                ));
            }
        } else if fresh_file {
            map[MAGIC_RANGE].copy_from_slice(&ZONE_MAGIC.to_le_bytes());
            map[VERSION_RANGE].copy_from_slice(&ZONE_VERSION.to_le_bytes());
            map[INIT_FLAG_RANGE].copy_from_slice(&0u32.to_le_bytes());
            map[SIZE_RANGE].copy_from_slice(&size.to_le_bytes());
        } else {
            FileExt::unlock(&file).ok();
            return Err(Error::zone(
                name,
                format!("{} is not a zone file", path.display()),
            ));
        }

        let initialized = read_u32(&map, INIT_FLAG_RANGE) != 0;
        if !initialized {
            let end = HEADER_SIZE + size as usize;
            init(&mut map[HEADER_SIZE..end]).map_err(|e| {
                FileExt::unlock(&file).ok();
                Error::zone(name, format!("initializer failed: {e}"))
            })?;
            map[INIT_FLAG_RANGE].copy_from_slice(&1u32.to_le_bytes());
            map.flush()
                .map_err(|e| Error::zone(name, format!("failed to flush header: {e}")))?;
            tracing::debug!(zone = %name, size, "zone mapping initialized");
        } else {
            tracing::debug!(zone = %name, size, "attached to initialized zone mapping");
        }

        FileExt::unlock(&file)
            .map_err(|e| Error::zone(name, format!("failed to unlock: {e}")))?;

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            file,
            map: Mutex::new(map),
            size,
            remove_on_drop,
        }))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut map = self.map.lock();
        let end = HEADER_SIZE + self.size as usize;
        f(&mut map[HEADER_SIZE..end])
    }
}

impl Drop for ZoneMapping {
    fn drop(&mut self) {
        if self.remove_on_drop {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A resolved zone: the request identity plus shared access to the
/// backing mapping.
///
/// Cloning the handle (or re-resolving the zone in a later cycle) aliases
/// the same backing memory.
#[derive(Debug, Clone)]
pub struct ZoneHandle {
    pub(crate) spec: ZoneSpec,
    pub(crate) mapping: Arc<ZoneMapping>,
}

impl ZoneHandle {
    /// The zone identity.
    pub fn spec(&self) -> &ZoneSpec {
        &self.spec
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.mapping.path()
    }

    /// Access the zone data region.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.mapping.with_data(f)
    }

    /// Whether `other` aliases the same backing mapping.
    pub fn same_mapping(&self, other: &ZoneHandle) -> bool {
        Arc::ptr_eq(&self.mapping, &other.mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn fill_init(byte: u8) -> ZoneInit {
        Arc::new(move |data: &mut [u8]| {
            data.fill(byte);
            Ok(())
        })
    }

    #[test]
    fn test_fresh_mapping_runs_initializer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.zone");
        let mapping =
            ZoneMapping::open("z", &path, 4096, &fill_init(0xAB), false, false).unwrap();

        mapping.with_data(|data| {
            assert_eq!(data.len(), 4096);
            assert!(data.iter().all(|&b| b == 0xAB));
        });
    }

    #[test]
    fn test_reattach_skips_initializer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.zone");

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let init: ZoneInit = Arc::new(move |data: &mut [u8]| {
            calls2.fetch_add(1, Ordering::SeqCst);
            data.fill(1);
            Ok(())
        });

        let first = ZoneMapping::open("z", &path, 1024, &init, false, false).unwrap();
        first.with_data(|data| data[0] = 42);
        drop(first);

        let second = ZoneMapping::open("z", &path, 1024, &init, true, false).unwrap();
        second.with_data(|data| assert_eq!(data[0], 42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fresh_open_discards_leftover_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.zone");

        let first = ZoneMapping::open("z", &path, 1024, &fill_init(9), false, false).unwrap();
        first.with_data(|data| data[0] = 42);
        drop(first);

        // A fresh open must not resurrect the old contents, and a size
        // change must not conflict with the stale header.
        let second = ZoneMapping::open("z", &path, 2048, &fill_init(9), false, false).unwrap();
        second.with_data(|data| {
            assert_eq!(data.len(), 2048);
            assert_eq!(data[0], 9);
        });
    }

    #[test]
    fn test_reattach_with_different_size_conflicts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.zone");

        ZoneMapping::open("z", &path, 1024, &fill_init(0), false, false).unwrap();
        let err = ZoneMapping::open("z", &path, 2048, &fill_init(0), true, false).unwrap_err();
        assert!(matches!(err, Error::ZoneConflict { .. }));
    }

    #[test]
    fn test_initializer_failure_propagates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.zone");
        let failing: ZoneInit =
            Arc::new(|_| Err(Error::Internal("init exploded".into())));

        let err = ZoneMapping::open("z", &path, 64, &failing, false, false).unwrap_err();
        assert!(err.to_string().contains("initializer failed"));
    }

    #[test]
    fn test_remove_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tmp.zone");
        let mapping = ZoneMapping::open("tmp", &path, 64, &fill_init(0), false, true).unwrap();
        assert!(path.exists());
        drop(mapping);
        assert!(!path.exists());
    }
}
