//! Push quarantine: a staging sub-store that keeps incoming objects
//! invisible to readers of the main store until integrity passes.
//!
//! Each push opens a fresh quarantine directory. `promote` links every
//! entry into the main store; dropping an unpromoted quarantine removes
//! the directory so an aborted push leaves nothing behind.

use std::fs;
use std::path::PathBuf;

use uuid::Uuid;

use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::internal::object::AnyObject;
use crate::storage::loose::LooseStore;

pub struct Quarantine {
    dir: PathBuf,
    store: LooseStore,
    promoted: bool,
}

impl Quarantine {
    /// Create a staging store beside the main one.
    pub fn open(main: &LooseStore) -> Result<Quarantine, ZetaError> {
        let dir = main
            .root()
            .join("quarantine")
            .join(Uuid::new_v4().to_string());
        let store = LooseStore::open(&dir, main.hash_kind())?;
        tracing::debug!(dir = %dir.display(), "opened quarantine");
        Ok(Quarantine {
            dir,
            store,
            promoted: false,
        })
    }

    /// The staging store itself. Only the push path writes here.
    pub fn store(&self) -> &LooseStore {
        &self.store
    }

    /// Whether the object is visible to this push: staged or already in
    /// the main store. Integrity walks resolve against this union.
    pub fn contains_union(&self, main: &LooseStore, id: &ObjectHash) -> bool {
        self.store.contains(id) || main.contains(id)
    }

    /// Read from the staged-or-main union.
    pub fn read_union(&self, main: &LooseStore, id: &ObjectHash) -> Result<AnyObject, ZetaError> {
        if self.store.contains(id) {
            self.store.read_object(id)
        } else {
            main.read_object(id)
        }
    }

    /// Every staged object id.
    pub fn staged(&self) -> Result<Vec<ObjectHash>, ZetaError> {
        self.store.list()
    }

    /// Move everything into the main store. After this the quarantine
    /// directory is gone and readers observe the new objects.
    pub fn promote(mut self, main: &LooseStore) -> Result<Vec<ObjectHash>, ZetaError> {
        let ids = self.store.list()?;
        for id in &ids {
            main.adopt(&self.store, id)?;
        }
        self.promoted = true;
        fs::remove_dir_all(&self.dir).ok();
        tracing::debug!(objects = ids.len(), "quarantine promoted");
        Ok(ids)
    }
}

impl Drop for Quarantine {
    fn drop(&mut self) {
        if !self.promoted {
            tracing::debug!(dir = %self.dir.display(), "discarding quarantine");
            fs::remove_dir_all(&self.dir).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashKind;
    use crate::internal::object::blob::Blob;

    const KIND: HashKind = HashKind::Sha1;

    fn main_store() -> (tempfile::TempDir, LooseStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::open(dir.path().join("main"), KIND).unwrap();
        (dir, store)
    }

    /// Staged objects are invisible to the main store until promotion.
    #[test]
    fn staged_objects_are_isolated() {
        let (_dir, main) = main_store();
        let q = Quarantine::open(&main).unwrap();
        let blob = Blob::from_content(KIND, "incoming");
        q.store().write_object(&AnyObject::Blob(blob.clone())).unwrap();

        assert!(!main.contains(&blob.id));
        assert!(q.contains_union(&main, &blob.id));

        let promoted = q.promote(&main).unwrap();
        assert_eq!(promoted, vec![blob.id]);
        assert!(main.contains(&blob.id));
    }

    /// Dropping an unpromoted quarantine removes the staging directory
    /// and the main store never sees the objects.
    #[test]
    fn abort_discards_everything() {
        let (_dir, main) = main_store();
        let staged_dir;
        {
            let q = Quarantine::open(&main).unwrap();
            let blob = Blob::from_content(KIND, "aborted push");
            q.store().write_object(&AnyObject::Blob(blob.clone())).unwrap();
            staged_dir = q.dir.clone();
            assert!(staged_dir.exists());
        }
        assert!(!staged_dir.exists());
        assert!(main.list().unwrap().is_empty());
    }

    /// The union read prefers staged content but falls through to main.
    #[test]
    fn union_reads_both_sides() {
        let (_dir, main) = main_store();
        let existing = Blob::from_content(KIND, "old");
        main.write_object(&AnyObject::Blob(existing.clone())).unwrap();

        let q = Quarantine::open(&main).unwrap();
        let incoming = Blob::from_content(KIND, "new");
        q.store()
            .write_object(&AnyObject::Blob(incoming.clone()))
            .unwrap();

        assert!(q.read_union(&main, &existing.id).is_ok());
        assert!(q.read_union(&main, &incoming.id).is_ok());
        let ghost = crate::hash::ObjectHash::new(KIND, b"ghost");
        assert_eq!(q.read_union(&main, &ghost).unwrap_err().status(), 404);
    }

    /// Promotion into a store that already has an object is idempotent.
    #[test]
    fn promote_over_existing() {
        let (_dir, main) = main_store();
        let blob = Blob::from_content(KIND, "both sides");
        main.write_object(&AnyObject::Blob(blob.clone())).unwrap();

        let q = Quarantine::open(&main).unwrap();
        q.store().write_object(&AnyObject::Blob(blob.clone())).unwrap();
        q.promote(&main).unwrap();
        assert!(main.contains(&blob.id));
    }
}
