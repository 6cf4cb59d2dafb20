// src/upload/mod.rs
//! Mirror the archive into an object store, uploading only partitions whose
//! content changed since the last sync.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

use crate::archive::{partition_file, Archive};

pub const MANIFEST_NAME: &str = "manifest.json";

/// Object key → SHA-256 hex digest of the uploaded bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub objects: BTreeMap<String, String>,
}

/// The operations a sync needs from a bucket.
pub trait ObjectStore {
    /// The manifest from the previous sync, if any.
    fn get_manifest(&self) -> Result<Option<Manifest>>;
    fn put_object(&self, key: &str, local: &Path) -> Result<()>;
    /// Remove an object. Deleting a missing object is not an error.
    fn delete_object(&self, key: &str) -> Result<()>;
    fn put_manifest(&self, manifest: &Manifest) -> Result<()>;
}

/// An [`ObjectStore`] over a directory, such as a mounted bucket.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    prefix: Option<String>,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            root: root.into(),
            prefix,
        }
    }

    fn base(&self) -> PathBuf {
        match &self.prefix {
            Some(p) => self.root.join(p),
            None => self.root.clone(),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.base().join(key)
    }

    /// Fill a temp file beside `dest`, then rename it into place.
    fn replace(dest: &Path, write: impl FnOnce(&mut File) -> io::Result<()>) -> Result<()> {
        let dir = dest
            .parent()
            .with_context(|| format!("object path {} has no parent", dest.display()))?;
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".upload.")
            .tempfile_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        write(tmp.as_file_mut()).with_context(|| format!("writing {}", dest.display()))?;
        tmp.persist(dest)
            .with_context(|| format!("renaming into {}", dest.display()))?;
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn get_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.object_path(MANIFEST_NAME);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing manifest {}", path.display()))?,
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading manifest {}", path.display())),
        }
    }

    fn put_object(&self, key: &str, local: &Path) -> Result<()> {
        let dest = self.object_path(key);
        let mut src =
            File::open(local).with_context(|| format!("opening {}", local.display()))?;
        Self::replace(&dest, |out| io::copy(&mut src, out).map(|_| ()))
    }

    fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
        }
        // drop partition directories left empty, stopping at the first
        // non-empty one
        let base = self.base();
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == base || !d.starts_with(&base) || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    fn put_manifest(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        Self::replace(&self.object_path(MANIFEST_NAME), |out| {
            io::Write::write_all(out, &json)
        })
    }
}

/// What one sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub unchanged: usize,
    /// Objects from the previous manifest with no local partition left.
    pub deleted: usize,
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Upload every partition whose digest differs from the store's manifest,
/// delete objects whose partition is gone, then replace the manifest.
#[instrument(level = "info", skip(archive, store), fields(root = %archive.root().display()))]
pub fn sync_archive(archive: &Archive, store: &dyn ObjectStore) -> Result<SyncSummary> {
    let previous = store.get_manifest()?.unwrap_or_default();
    let mut next = Manifest::default();
    let mut summary = SyncSummary::default();

    for key in archive.list_partitions()? {
        let local = partition_file(archive.root(), &key);
        let object_key = local
            .strip_prefix(archive.root())
            .with_context(|| format!("{} is outside the archive", local.display()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let digest = sha256_file(&local)?;

        if previous.objects.get(&object_key) == Some(&digest) {
            debug!(object = %object_key, "unchanged");
            summary.unchanged += 1;
        } else {
            store.put_object(&object_key, &local)?;
            info!(object = %object_key, "uploaded");
            summary.uploaded += 1;
        }
        next.objects.insert(object_key, digest);
    }

    for object_key in previous.objects.keys() {
        if !next.objects.contains_key(object_key) {
            store.delete_object(object_key)?;
            info!(object = %object_key, "deleted");
            summary.deleted += 1;
        }
    }

    store.put_manifest(&next)?;
    info!(
        uploaded = summary.uploaded,
        unchanged = summary.unchanged,
        deleted = summary.deleted,
        "archive synced"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PartitionKey, PaymentRecord};
    use tempfile::tempdir;

    fn rec(state_code: &str, state: &str, year: i32) -> PaymentRecord {
        PaymentRecord {
            state_fsa_code: state_code.into(),
            state_fsa_name: state.into(),
            payee_name: Some("DOE JOHN".into()),
            program_year: year,
            ..Default::default()
        }
    }

    #[test]
    fn only_changed_partitions_are_uploaded() -> Result<()> {
        let local = tempdir()?;
        let bucket = tempdir()?;
        let archive = Archive::new(local.path())?;
        let store = FsObjectStore::new(bucket.path(), Some("fsa/".into()));

        archive.write_year(2023, vec![rec("30", "Montana", 2023), rec("16", "Idaho", 2023)])?;
        let first = sync_archive(&archive, &store)?;
        assert_eq!(first, SyncSummary { uploaded: 2, unchanged: 0, deleted: 0 });

        let second = sync_archive(&archive, &store)?;
        assert_eq!(second, SyncSummary { uploaded: 0, unchanged: 2, deleted: 0 });

        let mut changed = rec("30", "Montana", 2023);
        changed.payee_name = Some("ROE JANE".into());
        archive.write_year(2023, vec![changed, rec("16", "Idaho", 2023)])?;
        let third = sync_archive(&archive, &store)?;
        assert_eq!(third, SyncSummary { uploaded: 1, unchanged: 1, deleted: 0 });

        let key = PartitionKey {
            state_fsa_name: "Montana".into(),
            program_year: 2023,
        };
        let mirrored = bucket
            .path()
            .join("fsa")
            .join("State FSA Name=Montana/Accounting Program Year=2023/part-0.parquet");
        assert_eq!(fs::read(mirrored)?, fs::read(archive.partition_file(&key))?);
        assert_eq!(store.get_manifest()?.map(|m| m.objects.len()), Some(2));
        Ok(())
    }

    #[test]
    fn superseded_partitions_are_removed_from_the_bucket() -> Result<()> {
        let local = tempdir()?;
        let bucket = tempdir()?;
        let archive = Archive::new(local.path())?;
        let store = FsObjectStore::new(bucket.path(), None);

        archive.write_year(2023, vec![rec("30", "Montana", 2023), rec("16", "Idaho", 2023)])?;
        archive.write_year(2022, vec![rec("16", "Idaho", 2022)])?;
        sync_archive(&archive, &store)?;

        // Idaho drops out of the republished 2023 file
        let write = archive.write_year(2023, vec![rec("30", "Montana", 2023)])?;
        assert_eq!(write.stale_removed, 1);
        let summary = sync_archive(&archive, &store)?;
        assert_eq!(
            summary,
            SyncSummary {
                uploaded: 0,
                unchanged: 2,
                deleted: 1
            }
        );

        let idaho_dir = bucket.path().join("State FSA Name=Idaho");
        assert!(!idaho_dir.join("Accounting Program Year=2023").exists());
        assert!(idaho_dir
            .join("Accounting Program Year=2022/part-0.parquet")
            .exists());
        let manifest = store.get_manifest()?.unwrap_or_default();
        assert_eq!(manifest.objects.len(), 2);
        assert!(manifest.objects.keys().all(|k| !k.contains("Idaho/Accounting Program Year=2023")));

        // a second pass has nothing left to delete
        assert_eq!(sync_archive(&archive, &store)?.deleted, 0);
        Ok(())
    }

    #[test]
    fn digest_is_hex_sha256() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("x");
        fs::write(&path, b"abc")?;
        assert_eq!(
            sha256_file(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }
}
