//! The VFS index.
//!
//! Maps identifiers to file and directory documents, enforces parent/name
//! uniqueness, and answers path lookups through a small LRU cache. All
//! operations are synchronous and never block on I/O; the byte side lives
//! in [`crate::blob`].

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use nimbus_core::{Error, Result};

use crate::doc::{DirDoc, DocKind, FileDoc, ROOT_DIR_ID};

/// Entries kept in the path lookup cache.
const PATH_CACHE_SIZE: usize = 512;

#[derive(Default)]
struct Inner {
    dirs: HashMap<String, DirDoc>,
    files: HashMap<String, FileDoc>,
    /// parent id -> child name -> child id
    by_parent: HashMap<String, HashMap<String, String>>,
}

/// In-memory index of the virtual filesystem.
pub struct VfsIndex {
    inner: RwLock<Inner>,
    path_cache: Mutex<LruCache<String, String>>,
}

impl VfsIndex {
    /// Create an index holding the root and trash directories.
    pub fn new(now: DateTime<Utc>) -> Self {
        let index = Self {
            inner: RwLock::new(Inner::default()),
            path_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(PATH_CACHE_SIZE).unwrap(),
            )),
        };
        {
            let mut inner = index.inner.write();
            let root = DirDoc::root(now);
            let trash = DirDoc::trash(now);
            inner
                .by_parent
                .entry(root.id.clone())
                .or_default()
                .insert(trash.name.clone(), trash.id.clone());
            inner.dirs.insert(root.id.clone(), root);
            inner.dirs.insert(trash.id.clone(), trash);
        }
        index
    }

    /// Look up a directory by id.
    pub fn dir(&self, id: &str) -> Option<DirDoc> {
        self.inner.read().dirs.get(id).cloned()
    }

    /// Look up a file by id.
    pub fn file(&self, id: &str) -> Option<FileDoc> {
        self.inner.read().files.get(id).cloned()
    }

    /// Look up either kind by id.
    pub fn doc(&self, id: &str) -> Option<DocKind> {
        let inner = self.inner.read();
        if let Some(file) = inner.files.get(id) {
            return Some(DocKind::File(file.clone()));
        }
        inner.dirs.get(id).cloned().map(DocKind::Dir)
    }

    /// All entries directly under a directory.
    pub fn children(&self, dir_id: &str) -> Vec<DocKind> {
        let inner = self.inner.read();
        let Some(names) = inner.by_parent.get(dir_id) else {
            return Vec::new();
        };
        let mut out: Vec<DocKind> = names
            .values()
            .filter_map(|id| {
                inner
                    .files
                    .get(id)
                    .cloned()
                    .map(DocKind::File)
                    .or_else(|| inner.dirs.get(id).cloned().map(DocKind::Dir))
            })
            .collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    /// The child with the given name, if any.
    pub fn child_by_name(&self, dir_id: &str, name: &str) -> Option<DocKind> {
        let inner = self.inner.read();
        let id = inner.by_parent.get(dir_id)?.get(name)?;
        inner
            .files
            .get(id)
            .cloned()
            .map(DocKind::File)
            .or_else(|| inner.dirs.get(id).cloned().map(DocKind::Dir))
    }

    /// Resolve a directory by its full path.
    pub fn dir_by_path(&self, path: &str) -> Option<DirDoc> {
        let path = normalize_path(path);
        if path == "/" {
            return self.dir(ROOT_DIR_ID);
        }
        if let Some(id) = self.path_cache.lock().get(&path).cloned() {
            // The cached entry may be stale after a move.
            if let Some(dir) = self.dir(&id) {
                if dir.fullpath == path {
                    return Some(dir);
                }
            }
        }
        let dir = self.walk_path(&path)?;
        self.path_cache.lock().put(path, dir.id.clone());
        Some(dir)
    }

    fn walk_path(&self, path: &str) -> Option<DirDoc> {
        let inner = self.inner.read();
        let mut current = ROOT_DIR_ID.to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let id = inner.by_parent.get(&current)?.get(segment)?;
            inner.dirs.get(id)?;
            current = id.clone();
        }
        inner.dirs.get(&current).cloned()
    }

    /// Directory ids above the given directory, nearest first, the
    /// directory itself included.
    pub fn ancestors(&self, dir_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = dir_id.to_string();
        while let Some(dir) = inner.dirs.get(&current) {
            if !seen.insert(current.clone()) {
                break;
            }
            out.push(current.clone());
            if dir.dir_id.is_empty() {
                break;
            }
            current = dir.dir_id.clone();
        }
        out
    }

    /// Insert a new file. Fails with `PathExists` when the slot is taken
    /// and `NotFound` when the parent is missing.
    pub fn add_file(&self, file: FileDoc) -> Result<()> {
        let mut inner = self.inner.write();
        let parent_path = parent_path(&inner, &file.dir_id)?;
        let slot = inner
            .by_parent
            .entry(file.dir_id.clone())
            .or_default();
        if slot.contains_key(&file.name) {
            return Err(Error::PathExists(join_path(&parent_path, &file.name)));
        }
        slot.insert(file.name.clone(), file.id.clone());
        debug!("Indexed file: id={}, name={}", file.id, file.name);
        inner.files.insert(file.id.clone(), file);
        Ok(())
    }

    /// Insert a new directory. `fullpath` is recomputed from the parent so
    /// the invariant cannot drift.
    pub fn add_dir(&self, mut dir: DirDoc) -> Result<()> {
        let mut inner = self.inner.write();
        let parent_path = parent_path(&inner, &dir.dir_id)?;
        dir.fullpath = join_path(&parent_path, &dir.name);
        let slot = inner.by_parent.entry(dir.dir_id.clone()).or_default();
        if slot.contains_key(&dir.name) {
            return Err(Error::PathExists(dir.fullpath));
        }
        slot.insert(dir.name.clone(), dir.id.clone());
        debug!("Indexed directory: id={}, path={}", dir.id, dir.fullpath);
        inner.dirs.insert(dir.id.clone(), dir);
        Ok(())
    }

    /// Replace a file document, moving it when parent or name changed.
    pub fn update_file(&self, file: FileDoc) -> Result<()> {
        let mut inner = self.inner.write();
        let old = inner
            .files
            .get(&file.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file {}", file.id)))?;

        if old.dir_id != file.dir_id || old.name != file.name {
            let parent_path = parent_path(&inner, &file.dir_id)?;
            let target = inner
                .by_parent
                .entry(file.dir_id.clone())
                .or_default();
            if let Some(existing) = target.get(&file.name) {
                if *existing != file.id {
                    return Err(Error::PathExists(join_path(&parent_path, &file.name)));
                }
            }
            target.insert(file.name.clone(), file.id.clone());
            if let Some(old_slot) = inner.by_parent.get_mut(&old.dir_id) {
                old_slot.remove(&old.name);
            }
        }
        inner.files.insert(file.id.clone(), file);
        Ok(())
    }

    /// Replace a directory document, rewriting descendant paths on a move.
    pub fn update_dir(&self, mut dir: DirDoc) -> Result<()> {
        let mut inner = self.inner.write();
        let old = inner
            .dirs
            .get(&dir.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("directory {}", dir.id)))?;

        let parent_path = parent_path(&inner, &dir.dir_id)?;
        dir.fullpath = join_path(&parent_path, &dir.name);

        if old.dir_id != dir.dir_id || old.name != dir.name {
            let target = inner.by_parent.entry(dir.dir_id.clone()).or_default();
            if let Some(existing) = target.get(&dir.name) {
                if *existing != dir.id {
                    return Err(Error::PathExists(dir.fullpath));
                }
            }
            target.insert(dir.name.clone(), dir.id.clone());
            if let Some(old_slot) = inner.by_parent.get_mut(&old.dir_id) {
                old_slot.remove(&old.name);
            }
        }

        let old_path = old.fullpath.clone();
        let new_path = dir.fullpath.clone();
        inner.dirs.insert(dir.id.clone(), dir);
        if old_path != new_path {
            rewrite_subtree_paths(&mut inner, &old_path, &new_path);
            self.path_cache.lock().clear();
        }
        Ok(())
    }

    /// Drop a file from the index.
    pub fn remove_file(&self, id: &str) -> Result<FileDoc> {
        let mut inner = self.inner.write();
        let file = inner
            .files
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
        if let Some(slot) = inner.by_parent.get_mut(&file.dir_id) {
            slot.remove(&file.name);
        }
        Ok(file)
    }

    /// Drop an empty directory from the index.
    pub fn remove_dir(&self, id: &str) -> Result<DirDoc> {
        let mut inner = self.inner.write();
        if inner.by_parent.get(id).map_or(false, |c| !c.is_empty()) {
            return Err(Error::Conflict(format!("directory {} is not empty", id)));
        }
        let dir = inner
            .dirs
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("directory {}", id)))?;
        if let Some(slot) = inner.by_parent.get_mut(&dir.dir_id) {
            slot.remove(&dir.name);
        }
        inner.by_parent.remove(id);
        self.path_cache.lock().clear();
        Ok(dir)
    }
}

fn parent_path(inner: &Inner, dir_id: &str) -> Result<String> {
    inner
        .dirs
        .get(dir_id)
        .map(|d| d.fullpath.clone())
        .ok_or_else(|| Error::NotFound(format!("directory {}", dir_id)))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn rewrite_subtree_paths(inner: &mut Inner, old_prefix: &str, new_prefix: &str) {
    for dir in inner.dirs.values_mut() {
        if let Some(rest) = dir.fullpath.strip_prefix(old_prefix) {
            if rest.starts_with('/') {
                dir.fullpath = format!("{}{}", new_prefix, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn index_with_photos() -> VfsIndex {
        let index = VfsIndex::new(now());
        index
            .add_dir(DirDoc::new("d-photos", ROOT_DIR_ID, "Photos", "", now()))
            .unwrap();
        index
    }

    #[test]
    fn test_root_and_trash_exist() {
        let index = VfsIndex::new(now());
        assert_eq!(index.dir(ROOT_DIR_ID).unwrap().fullpath, "/");
        assert!(index.dir_by_path("/.cozy_trash").is_some());
    }

    #[test]
    fn test_parent_name_uniqueness() {
        let index = index_with_photos();
        let file = FileDoc::new("f1", "d-photos", "a.jpg", now());
        index.add_file(file.clone()).unwrap();

        let dup = FileDoc::new("f2", "d-photos", "a.jpg", now());
        match index.add_file(dup) {
            Err(Error::PathExists(path)) => assert_eq!(path, "/Photos/a.jpg"),
            other => panic!("expected PathExists, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_parent() {
        let index = VfsIndex::new(now());
        let file = FileDoc::new("f1", "nope", "a.jpg", now());
        assert!(matches!(index.add_file(file), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_path_lookup_and_cache() {
        let index = index_with_photos();
        index
            .add_dir(DirDoc::new("d-sub", "d-photos", "2024", "", now()))
            .unwrap();

        let dir = index.dir_by_path("/Photos/2024").unwrap();
        assert_eq!(dir.id, "d-sub");
        // Second lookup is served by the cache and must agree.
        let again = index.dir_by_path("/Photos/2024/").unwrap();
        assert_eq!(again.id, "d-sub");
    }

    #[test]
    fn test_children_sorted() {
        let index = index_with_photos();
        index
            .add_file(FileDoc::new("f1", "d-photos", "b.jpg", now()))
            .unwrap();
        index
            .add_file(FileDoc::new("f2", "d-photos", "a.jpg", now()))
            .unwrap();
        let names: Vec<_> = index
            .children("d-photos")
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_file_rename_and_move() {
        let index = index_with_photos();
        index
            .add_file(FileDoc::new("f1", "d-photos", "a.jpg", now()))
            .unwrap();

        let mut moved = index.file("f1").unwrap();
        moved.dir_id = ROOT_DIR_ID.to_string();
        moved.name = "b.jpg".to_string();
        index.update_file(moved).unwrap();

        assert!(index.child_by_name("d-photos", "a.jpg").is_none());
        assert_eq!(index.child_by_name(ROOT_DIR_ID, "b.jpg").unwrap().id(), "f1");
    }

    #[test]
    fn test_rename_collision() {
        let index = index_with_photos();
        index
            .add_file(FileDoc::new("f1", "d-photos", "a.jpg", now()))
            .unwrap();
        index
            .add_file(FileDoc::new("f2", "d-photos", "b.jpg", now()))
            .unwrap();

        let mut clash = index.file("f1").unwrap();
        clash.name = "b.jpg".to_string();
        assert!(matches!(
            index.update_file(clash),
            Err(Error::PathExists(_))
        ));
    }

    #[test]
    fn test_dir_move_rewrites_descendants() {
        let index = index_with_photos();
        index
            .add_dir(DirDoc::new("d-sub", "d-photos", "2024", "", now()))
            .unwrap();
        index
            .add_dir(DirDoc::new("d-deep", "d-sub", "trip", "", now()))
            .unwrap();

        let mut renamed = index.dir("d-photos").unwrap();
        renamed.name = "Pictures".to_string();
        index.update_dir(renamed).unwrap();

        assert_eq!(index.dir("d-sub").unwrap().fullpath, "/Pictures/2024");
        assert_eq!(index.dir("d-deep").unwrap().fullpath, "/Pictures/2024/trip");
        assert!(index.dir_by_path("/Photos/2024").is_none());
        assert_eq!(index.dir_by_path("/Pictures/2024/trip").unwrap().id, "d-deep");
    }

    #[test]
    fn test_ancestors() {
        let index = index_with_photos();
        index
            .add_dir(DirDoc::new("d-sub", "d-photos", "2024", "", now()))
            .unwrap();
        assert_eq!(
            index.ancestors("d-sub"),
            vec!["d-sub", "d-photos", ROOT_DIR_ID]
        );
    }

    #[test]
    fn test_remove_dir_requires_empty() {
        let index = index_with_photos();
        index
            .add_file(FileDoc::new("f1", "d-photos", "a.jpg", now()))
            .unwrap();
        assert!(index.remove_dir("d-photos").is_err());
        index.remove_file("f1").unwrap();
        assert!(index.remove_dir("d-photos").is_ok());
    }
}
