//! Manifest persistence.
//!
//! Manifests are JSON documents in the snapshot directory. A save writes a
//! temporary file, fsyncs it and renames it over the previous document, so a
//! reader sees either the old manifest or the new one and never a partial
//! write. Writers to the same label are serialized in-process.

use super::Manifest;
use crate::error::{Result, TapeStreamError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ManifestStore {
    dir: PathBuf,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ManifestStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn key(label: &str, job: Option<&str>) -> String {
        match job {
            Some(job) => format!("{}_{}", job, label),
            None => label.to_string(),
        }
    }

    pub fn path_for(&self, label: &str, job: Option<&str>) -> PathBuf {
        self.dir.join(format!("{}.json", Self::key(label, job)))
    }

    fn writer_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.writers
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load the manifest for a label.
    ///
    /// `Ok(None)` when no manifest exists yet. A document that does not parse
    /// is reported as `SnapshotCorrupt`, never treated as empty.
    pub fn load(&self, label: &str, job: Option<&str>) -> Result<Option<Manifest>> {
        let path = self.path_for(label, job);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No manifest at {:?}", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let manifest: Manifest = serde_json::from_str(&content).map_err(|e| {
            TapeStreamError::snapshot_corrupt(format!("{:?}: {}", path, e))
        })?;

        if manifest.label != label {
            return Err(TapeStreamError::snapshot_corrupt(format!(
                "{:?} belongs to label '{}', expected '{}'",
                path, manifest.label, label
            )));
        }

        info!(
            "Loaded manifest {:?} with {} entries on {} volume spans",
            path,
            manifest.files.len(),
            manifest.volumes.len()
        );
        Ok(Some(manifest))
    }

    /// Every volume referenced by a manifest in the store, with the labels
    /// that reference it. Documents that do not parse are skipped.
    pub fn volumes_in_use(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut in_use: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let dir = match fs::read_dir(&self.dir) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(in_use),
            Err(e) => return Err(e.into()),
        };

        for entry in dir {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .map_or(true, |n| n.to_string_lossy().starts_with('.'));
            if hidden || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .map_err(TapeStreamError::from)
                .and_then(|c| serde_json::from_str::<Manifest>(&c).map_err(TapeStreamError::from));
            let manifest = match parsed {
                Ok(m) => m,
                Err(e) => {
                    warn!("Ignoring unreadable manifest {:?}: {}", path, e);
                    continue;
                }
            };

            let volumes = manifest
                .volumes
                .iter()
                .map(|span| span.volume_id.as_str())
                .chain(manifest.files.values().map(|e| e.volume_id.as_str()));
            for volume in volumes {
                in_use
                    .entry(volume.to_string())
                    .or_default()
                    .insert(manifest.label.clone());
            }
        }

        debug!("{} volumes referenced by stored manifests", in_use.len());
        Ok(in_use)
    }

    /// Replace the manifest for `manifest.label` atomically.
    pub fn save(&self, manifest: &Manifest) -> Result<PathBuf> {
        let key = Self::key(&manifest.label, manifest.job.as_deref());
        let lock = self.writer_lock(&key);
        let _guard = lock.lock();

        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&manifest.label, manifest.job.as_deref());
        let content = serde_json::to_string_pretty(manifest)?;

        let temp_path = self.dir.join(format!(".{}.json.tmp", key));
        let mut file = File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;
        // persist the rename itself
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        debug!("Manifest saved to {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Strategy;
    use crate::snapshot::{EntryKind, ManifestEntry};

    fn sample(label: &str, files: usize) -> Manifest {
        let mut manifest = Manifest::new(label, None, Strategy::Direct);
        for i in 0..files {
            manifest.files.insert(
                format!("data/f{}", i),
                ManifestEntry {
                    kind: EntryKind::File,
                    size: i as u64,
                    mtime: 1,
                    checksum: None,
                    volume_id: "VOL001".into(),
                    offset: 0,
                    run_id: "r1".into(),
                },
            );
        }
        manifest
    }

    #[test]
    fn test_missing_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        assert!(store.load("daily", None).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let manifest = sample("daily", 3);

        let path = store.save(&manifest).unwrap();
        assert_eq!(path, dir.path().join("daily.json"));
        assert_eq!(store.load("daily", None).unwrap().unwrap(), manifest);

        let mut job = sample("daily", 1);
        job.job = Some("web".into());
        assert_eq!(store.save(&job).unwrap(), dir.path().join("web_daily.json"));
        // independent documents
        assert_eq!(store.load("daily", None).unwrap().unwrap().files.len(), 3);
    }

    #[test]
    fn test_corrupt_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        fs::write(store.path_for("daily", None), b"{\"label\": \"daily\", \"files\": [").unwrap();

        assert!(matches!(
            store.load("daily", None),
            Err(TapeStreamError::SnapshotCorrupt(_))
        ));
    }

    #[test]
    fn test_interrupted_write_leaves_previous_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        store.save(&sample("daily", 2)).unwrap();

        // a crash between create and rename leaves only the temp file behind
        fs::write(dir.path().join(".daily.json.tmp"), b"{\"label\":").unwrap();

        let loaded = store.load("daily", None).unwrap().unwrap();
        assert_eq!(loaded.files.len(), 2);

        store.save(&sample("daily", 5)).unwrap();
        assert_eq!(store.load("daily", None).unwrap().unwrap().files.len(), 5);
        assert!(!dir.path().join(".daily.json.tmp").exists());
    }

    #[test]
    fn test_volumes_in_use_across_labels() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        assert!(store.volumes_in_use().unwrap().is_empty());

        store.save(&sample("daily", 2)).unwrap();
        let mut weekly = sample("weekly", 1);
        weekly.files.values_mut().for_each(|e| e.volume_id = "VOL009".into());
        store.save(&weekly).unwrap();
        fs::write(dir.path().join("broken.json"), b"{").unwrap();
        fs::write(dir.path().join(".weekly.json.tmp"), b"{").unwrap();

        let in_use = store.volumes_in_use().unwrap();
        assert_eq!(in_use.len(), 2);
        assert!(in_use["VOL001"].contains("daily"));
        assert!(in_use["VOL009"].contains("weekly"));
    }

    #[test]
    fn test_concurrent_writers_same_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ManifestStore::new(dir.path()));

        let handles: Vec<_> = (1..=8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || store.save(&sample("daily", n)).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let loaded = store.load("daily", None).unwrap().unwrap();
        assert!((1..=8).contains(&loaded.files.len()));
    }
}
