//! Zone resolution across generations.

use crate::zone::{ZoneHandle, ZoneInit, ZoneMapping, ZoneSpec};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tiller_core::{Error, Result};

/// A zone request collected during configuration.
#[derive(Clone)]
pub struct ZoneRequest {
    /// Requested identity
    pub spec: ZoneSpec,
    /// Run-once initializer for newly backed mappings
    pub init: ZoneInit,
}

impl std::fmt::Debug for ZoneRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneRequest")
            .field("spec", &self.spec)
            .finish()
    }
}

impl ZoneRequest {
    /// Create a request.
    pub fn new(spec: ZoneSpec, init: ZoneInit) -> Self {
        Self { spec, init }
    }
}

/// The zones owned by one generation.
#[derive(Debug, Default)]
pub struct ZoneRegistry {
    zones: Vec<ZoneHandle>,
}

impl ZoneRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resolved zone.
    pub fn insert(&mut self, handle: ZoneHandle) {
        self.zones.push(handle);
    }

    /// Look up a zone by name.
    pub fn get(&self, name: &str) -> Option<&ZoneHandle> {
        self.zones.iter().find(|z| z.spec.name == name)
    }

    /// Number of zones.
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Iterate over all zones.
    pub fn iter(&self) -> impl Iterator<Item = &ZoneHandle> {
        self.zones.iter()
    }
}

/// Resolves zone requests against the previous generation's registry.
#[derive(Debug)]
pub struct ZoneManager {
    dir: PathBuf,
    inherited: HashSet<String>,
}

// Distinguishes noreuse backing files spawned within one process.
static NOREUSE_SEQ: AtomicU64 = AtomicU64::new(0);

impl ZoneManager {
    /// Create a manager storing zone files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inherited: HashSet::new(),
        }
    }

    /// Directory holding the zone backing files.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Mark zones handed over by the previous binary during an upgrade.
    ///
    /// Only named zones attach to their existing backing file; any other
    /// zone resolved without a previous-registry match gets a fresh region.
    pub fn inherit(&mut self, names: impl IntoIterator<Item = String>) {
        self.inherited.extend(names);
    }

    /// Resolve one request.
    ///
    /// - `noreuse` requests always get a fresh private mapping.
    /// - A previous zone with the same name is reused unchanged when owner
    ///   tag and size match; the initializer is not re-invoked.
    /// - A name match with a different tag or size is a configuration
    ///   conflict and aborts the build.
    /// - No match: a fresh mapping, discarding any file left behind by an
    ///   earlier configuration — unless the zone was handed over by the
    ///   previous binary, in which case its file is attached instead.
    pub fn resolve(
        &self,
        request: &ZoneRequest,
        previous: Option<&ZoneRegistry>,
    ) -> Result<ZoneHandle> {
        let spec = &request.spec;

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::zone(&spec.name, format!("failed to create zone dir: {e}")))?;

        if spec.noreuse {
            let seq = NOREUSE_SEQ.fetch_add(1, Ordering::Relaxed);
            let path = self
                .dir
                .join(format!("{}.{}.{seq}.zone", spec.name, std::process::id()));
            let mapping =
                ZoneMapping::open(&spec.name, &path, spec.size, &request.init, false, true)?;
            tracing::info!(zone = %spec.name, size = spec.size, "allocated fresh noreuse zone");
            return Ok(ZoneHandle {
                spec: spec.clone(),
                mapping,
            });
        }

        if let Some(old) = previous.and_then(|reg| reg.get(&spec.name)) {
            // noreuse zones never participate in identity matching, in
            // either direction.
            if !old.spec.noreuse {
                if old.spec.tag != spec.tag {
                    return Err(Error::zone_conflict(
                        &spec.name,
                        format!(
                            "owned by module '{}' in the previous generation, requested by '{}'",
                            old.spec.tag, spec.tag
                        ),
                    ));
                }
                if old.spec.size != spec.size {
                    return Err(Error::zone_conflict(
                        &spec.name,
                        format!(
                            "previous generation mapped {} bytes, requested {}",
                            old.spec.size, spec.size
                        ),
                    ));
                }
                tracing::debug!(zone = %spec.name, "reusing zone from previous generation");
                return Ok(ZoneHandle {
                    spec: spec.clone(),
                    mapping: std::sync::Arc::clone(&old.mapping),
                });
            }
        }

        let path = self.dir.join(format!("{}.zone", spec.name));

        if self.inherited.contains(&spec.name) {
            match ZoneMapping::open(&spec.name, &path, spec.size, &request.init, true, false) {
                Ok(mapping) => {
                    tracing::info!(zone = %spec.name, size = spec.size, "attached to handed-over zone");
                    return Ok(ZoneHandle {
                        spec: spec.clone(),
                        mapping,
                    });
                }
                Err(e) => {
                    tracing::warn!(zone = %spec.name, error = %e, "handed-over zone unusable, allocating fresh");
                }
            }
        }

        let mapping = ZoneMapping::open(&spec.name, &path, spec.size, &request.init, false, false)?;
        tracing::info!(zone = %spec.name, size = spec.size, "allocated zone mapping");
        Ok(ZoneHandle {
            spec: spec.clone(),
            mapping,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn counting_init(counter: Arc<AtomicUsize>, byte: u8) -> ZoneInit {
        Arc::new(move |data: &mut [u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            data.fill(byte);
            Ok(())
        })
    }

    #[test]
    fn test_reuse_across_generations_preserves_content() {
        let dir = tempdir().unwrap();
        let manager = ZoneManager::new(dir.path());
        let inits = Arc::new(AtomicUsize::new(0));

        let request = ZoneRequest::new(
            ZoneSpec::new("limits", 4096, "core"),
            counting_init(Arc::clone(&inits), 0),
        );

        let first = manager.resolve(&request, None).unwrap();
        first.with_data(|data| data[..4].copy_from_slice(b"keep"));

        let mut previous = ZoneRegistry::new();
        previous.insert(first.clone());

        let second = manager.resolve(&request, Some(&previous)).unwrap();
        assert!(second.same_mapping(&first));
        second.with_data(|data| assert_eq!(&data[..4], b"keep"));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_size_change_is_a_conflict() {
        let dir = tempdir().unwrap();
        let manager = ZoneManager::new(dir.path());
        let inits = Arc::new(AtomicUsize::new(0));

        let first = manager
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("limits", 4096, "core"),
                    counting_init(Arc::clone(&inits), 0),
                ),
                None,
            )
            .unwrap();

        let mut previous = ZoneRegistry::new();
        previous.insert(first);

        let err = manager
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("limits", 8192, "core"),
                    counting_init(Arc::clone(&inits), 0),
                ),
                Some(&previous),
            )
            .unwrap_err();
        assert!(matches!(err, tiller_core::Error::ZoneConflict { .. }));
    }

    #[test]
    fn test_tag_change_is_a_conflict() {
        let dir = tempdir().unwrap();
        let manager = ZoneManager::new(dir.path());
        let inits = Arc::new(AtomicUsize::new(0));

        let first = manager
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("cache", 1024, "core"),
                    counting_init(Arc::clone(&inits), 0),
                ),
                None,
            )
            .unwrap();

        let mut previous = ZoneRegistry::new();
        previous.insert(first);

        let err = manager
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("cache", 1024, "events"),
                    counting_init(inits, 0),
                ),
                Some(&previous),
            )
            .unwrap_err();
        assert!(matches!(err, tiller_core::Error::ZoneConflict { .. }));
    }

    #[test]
    fn test_noreuse_gets_independent_mappings() {
        let dir = tempdir().unwrap();
        let manager = ZoneManager::new(dir.path());
        let inits = Arc::new(AtomicUsize::new(0));

        let request = ZoneRequest::new(
            ZoneSpec::new("scratch", 256, "core").noreuse(),
            counting_init(Arc::clone(&inits), 7),
        );

        let first = manager.resolve(&request, None).unwrap();
        first.with_data(|data| data[0] = 99);

        let mut previous = ZoneRegistry::new();
        previous.insert(first.clone());

        let second = manager.resolve(&request, Some(&previous)).unwrap();
        assert!(!second.same_mapping(&first));
        // The second mapping ran its own initializer and saw none of the
        // first mapping's writes.
        second.with_data(|data| assert_eq!(data[0], 7));
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_previous_match_allocates_fresh() {
        let dir = tempdir().unwrap();
        let manager = ZoneManager::new(dir.path());
        let inits = Arc::new(AtomicUsize::new(0));

        let first = manager
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("limits", 1024, "core"),
                    counting_init(Arc::clone(&inits), 3),
                ),
                None,
            )
            .unwrap();
        first.with_data(|data| data[0] = 88);
        drop(first);

        // The zone was dropped from the running configuration; re-adding
        // it later, even resized, starts from scratch rather than
        // resurrecting the stale backing file.
        let second = manager
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("limits", 2048, "core"),
                    counting_init(Arc::clone(&inits), 3),
                ),
                None,
            )
            .unwrap();
        second.with_data(|data| {
            assert_eq!(data.len(), 2048);
            assert_eq!(data[0], 3);
        });
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handed_over_zone_attaches_by_file() {
        let dir = tempdir().unwrap();
        let inits = Arc::new(AtomicUsize::new(0));
        let request = ZoneRequest::new(
            ZoneSpec::new("sessions", 512, "core"),
            counting_init(Arc::clone(&inits), 0),
        );

        // The old binary's manager creates the zone and exits.
        let old = ZoneManager::new(dir.path());
        let handle = old.resolve(&request, None).unwrap();
        handle.with_data(|data| data[..2].copy_from_slice(b"ok"));
        drop(handle);

        // The upgraded binary has no previous registry, only the
        // handed-over name list.
        let mut new = ZoneManager::new(dir.path());
        new.inherit(["sessions".to_string()]);
        let adopted = new.resolve(&request, None).unwrap();
        adopted.with_data(|data| assert_eq!(&data[..2], b"ok"));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handed_over_size_mismatch_falls_back_to_fresh() {
        let dir = tempdir().unwrap();
        let inits = Arc::new(AtomicUsize::new(0));

        let old = ZoneManager::new(dir.path());
        old.resolve(
            &ZoneRequest::new(
                ZoneSpec::new("sessions", 512, "core"),
                counting_init(Arc::clone(&inits), 0),
            ),
            None,
        )
        .unwrap();

        let mut new = ZoneManager::new(dir.path());
        new.inherit(["sessions".to_string()]);
        let resized = new
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("sessions", 1024, "core"),
                    counting_init(Arc::clone(&inits), 5),
                ),
                None,
            )
            .unwrap();
        resized.with_data(|data| {
            assert_eq!(data.len(), 1024);
            assert_eq!(data[0], 5);
        });
    }

    #[test]
    fn test_unrelated_names_do_not_collide() {
        let dir = tempdir().unwrap();
        let manager = ZoneManager::new(dir.path());
        let inits = Arc::new(AtomicUsize::new(0));

        let a = manager
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("a", 128, "core"),
                    counting_init(Arc::clone(&inits), 1),
                ),
                None,
            )
            .unwrap();
        let b = manager
            .resolve(
                &ZoneRequest::new(
                    ZoneSpec::new("b", 128, "core"),
                    counting_init(inits, 2),
                ),
                None,
            )
            .unwrap();
        assert!(!a.same_mapping(&b));
    }
}
