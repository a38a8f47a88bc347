//! Content-addressable object store backing the CA `DirectoryHandler`
//! variant: every blob and tree is named by the SHA-1 of its serialized
//! form, stored zlib-compressed under `objects/<2-hex>/<38-hex>`, mirroring
//! Git's loose-object layout. `refs/heads/master` holds the current commit
//! id; `refs/snapshots/<name>` holds additional named commits.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};

pub type ObjectId = String;

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub name: String,
    pub is_dir: bool,
    pub object_id: ObjectId,
}

#[derive(Debug, Clone)]
pub enum Object {
    Blob(Vec<u8>),
    Tree(Vec<TreeEntry>),
    /// No `parent` link: the master ref rolls forward to a fresh commit on
    /// every mutation, and history is preserved only where a caller asked
    /// for it explicitly via `refs/snapshots/*`. A commit chain back through
    /// every superseded tree would keep every one of them permanently live.
    Commit { tree: ObjectId },
}

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("corrupt object {0}: {1}")]
    Corrupt(String, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single CA repository rooted at `root` (typically the file service's
/// configured storage directory).
pub struct CaBackend {
    root: PathBuf,
}

impl CaBackend {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs/heads"))?;
        fs::create_dir_all(root.join("refs/snapshots"))?;
        Ok(Self { root })
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join("objects").join(&id[0..2]).join(&id[2..])
    }

    /// Hashes and stores `object`, returning its id. A no-op (besides the
    /// hash computation) if the object is already present -- this is what
    /// makes writing identical content twice produce exactly one blob.
    pub fn put(&self, object: &Object) -> Result<ObjectId, CaError> {
        let bytes = serialize(object);
        let id = hex::encode(Sha1::digest(&bytes));
        let path = self.object_path(&id);
        if !path.exists() {
            fs::create_dir_all(path.parent().unwrap())?;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&bytes)?;
            let compressed = encoder.finish()?;
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, compressed)?;
            fs::rename(&tmp, &path)?;
        }
        Ok(id)
    }

    pub fn get(&self, id: &ObjectId) -> Result<Object, CaError> {
        let path = self.object_path(id);
        let compressed = fs::read(&path).map_err(|_| CaError::NotFound(id.clone()))?;
        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        deserialize(&bytes).ok_or_else(|| CaError::Corrupt(id.clone(), "unreadable header".to_string()))
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn read_ref(&self, name: &str) -> std::io::Result<Option<ObjectId>> {
        match fs::read_to_string(self.ref_path(name)) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write_ref(&self, name: &str, id: &ObjectId) -> std::io::Result<()> {
        let path = self.ref_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, id)
    }

    pub fn remove_ref(&self, name: &str) -> std::io::Result<()> {
        let path = self.ref_path(name);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn list_snapshots(&self) -> std::io::Result<Vec<String>> {
        let dir = self.root.join("refs/snapshots");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Records a new, parentless commit pointing at `tree` and rolls
    /// `refs/heads/master` forward to it, then sweeps every object
    /// unreachable from any ref. Called after every mutation that reaches
    /// the root, so the object store never accumulates orphans from
    /// superseded trees -- only the current master tree and whatever a
    /// caller pinned under `refs/snapshots/*` stay live.
    pub fn commit_and_collect(&self, tree: ObjectId) -> Result<ObjectId, CaError> {
        let commit_id = self.put(&Object::Commit { tree })?;
        self.write_ref("refs/heads/master", &commit_id)?;
        self.collect_garbage()?;
        Ok(commit_id)
    }

    fn collect_garbage(&self) -> Result<(), CaError> {
        let mut roots = Vec::new();
        if let Some(id) = self.read_ref("refs/heads/master")? {
            roots.push(id);
        }
        for snapshot in self.list_snapshots()? {
            if let Some(id) = self.read_ref(&format!("refs/snapshots/{snapshot}"))? {
                roots.push(id);
            }
        }

        let mut live = HashSet::new();
        let mut queue: VecDeque<ObjectId> = roots.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if !live.insert(id.clone()) {
                continue;
            }
            match self.get(&id) {
                Ok(Object::Commit { tree }) => {
                    queue.push_back(tree);
                }
                Ok(Object::Tree(entries)) => {
                    for entry in entries {
                        queue.push_back(entry.object_id);
                    }
                }
                Ok(Object::Blob(_)) => {}
                Err(_) => {}
            }
        }

        let objects_dir = self.root.join("objects");
        if !objects_dir.exists() {
            return Ok(());
        }
        for shard in fs::read_dir(&objects_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for file in fs::read_dir(shard.path())? {
                let file = file?;
                let id = format!("{prefix}{}", file.file_name().to_string_lossy());
                if !live.contains(&id) {
                    let _ = fs::remove_file(file.path());
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn object_count(&self) -> usize {
        let objects_dir = self.root.join("objects");
        let mut count = 0;
        if let Ok(shards) = fs::read_dir(&objects_dir) {
            for shard in shards.flatten() {
                if let Ok(files) = fs::read_dir(shard.path()) {
                    count += files.count();
                }
            }
        }
        count
    }
}

fn serialize(object: &Object) -> Vec<u8> {
    match object {
        Object::Blob(content) => {
            let mut out = format!("blob {}\0", content.len()).into_bytes();
            out.extend_from_slice(content);
            out
        }
        Object::Tree(entries) => {
            let mut sorted = entries.clone();
            sorted.sort_by(|a, b| a.name.cmp(&b.name));
            let mut body = String::new();
            for entry in &sorted {
                let mode = if entry.is_dir { "040000" } else { "100644" };
                body.push_str(&format!("{mode} {}\0{}\n", entry.name, entry.object_id));
            }
            let mut out = format!("tree {}\0", body.len()).into_bytes();
            out.extend_from_slice(body.as_bytes());
            out
        }
        Object::Commit { tree } => {
            let body = format!("tree {tree}\n");
            let mut out = format!("commit {}\0", body.len()).into_bytes();
            out.extend_from_slice(body.as_bytes());
            out
        }
    }
}

fn deserialize(bytes: &[u8]) -> Option<Object> {
    let nul = bytes.iter().position(|&b| b == 0)?;
    let header = std::str::from_utf8(&bytes[..nul]).ok()?;
    let (kind, _len) = header.split_once(' ')?;
    let body = &bytes[nul + 1..];
    match kind {
        "blob" => Some(Object::Blob(body.to_vec())),
        "tree" => {
            let body = std::str::from_utf8(body).ok()?;
            let mut entries = Vec::new();
            for line in body.lines() {
                let (mode_name, object_id) = line.split_once('\0')?;
                let (mode, name) = mode_name.split_once(' ')?;
                entries.push(TreeEntry {
                    name: name.to_string(),
                    is_dir: mode == "040000",
                    object_id: object_id.to_string(),
                });
            }
            Some(Object::Tree(entries))
        }
        "commit" => {
            let body = std::str::from_utf8(body).ok()?;
            let mut tree = None;
            for line in body.lines() {
                if let Some(id) = line.strip_prefix("tree ") {
                    tree = Some(id.to_string());
                }
            }
            Some(Object::Commit { tree: tree? })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (CaBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (CaBackend::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn identical_content_produces_one_blob() {
        let (ca, _dir) = backend();
        let a = ca.put(&Object::Blob(b"hello".to_vec())).unwrap();
        let b = ca.put(&Object::Blob(b"hello".to_vec())).unwrap();
        assert_eq!(a, b);
        assert_eq!(ca.object_count(), 1);
    }

    #[test]
    fn different_content_produces_different_ids() {
        let (ca, _dir) = backend();
        let a = ca.put(&Object::Blob(b"hello".to_vec())).unwrap();
        let b = ca.put(&Object::Blob(b"world".to_vec())).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tree_and_commit_roundtrip() {
        let (ca, _dir) = backend();
        let blob = ca.put(&Object::Blob(b"content".to_vec())).unwrap();
        let tree_id = ca
            .put(&Object::Tree(vec![TreeEntry { name: "a".to_string(), is_dir: false, object_id: blob.clone() }]))
            .unwrap();
        match ca.get(&tree_id).unwrap() {
            Object::Tree(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].object_id, blob);
            }
            other => panic!("expected tree, got {other:?}"),
        }

        let commit_id = ca.commit_and_collect(tree_id.clone()).unwrap();
        match ca.get(&commit_id).unwrap() {
            Object::Commit { tree } => {
                assert_eq!(tree, tree_id);
            }
            other => panic!("expected commit, got {other:?}"),
        }
        assert_eq!(ca.read_ref("refs/heads/master").unwrap(), Some(commit_id));
    }

    #[test]
    fn garbage_collection_drops_unreferenced_trees() {
        let (ca, _dir) = backend();
        let blob_a = ca.put(&Object::Blob(b"hello".to_vec())).unwrap();
        let tree1 = ca.put(&Object::Tree(vec![TreeEntry { name: "a".to_string(), is_dir: false, object_id: blob_a }])).unwrap();
        ca.commit_and_collect(tree1).unwrap();

        let blob_b = ca.put(&Object::Blob(b"world".to_vec())).unwrap();
        let tree2 = ca.put(&Object::Tree(vec![TreeEntry { name: "a".to_string(), is_dir: false, object_id: blob_b }])).unwrap();
        ca.commit_and_collect(tree2).unwrap();

        // Only the new commit, its tree, and its blob stay live -- the
        // superseded commit/tree/blob from before the second
        // `commit_and_collect` are unreachable from master (no parent
        // chain keeps them pinned) and must be swept.
        assert_eq!(ca.object_count(), 3);
    }

    /// Mirrors the worked example in the system's testable-properties
    /// scenario for this backend: identical content written under two
    /// different directories collapses to a shared tree object, and GC
    /// converges to the same count once every directory converges on the
    /// same content again.
    #[test]
    fn scenario_shared_content_dedups_and_gc_converges() {
        let (ca, _dir) = backend();

        let hello = ca.put(&Object::Blob(b"hello".to_vec())).unwrap();
        let leaf = ca.put(&Object::Tree(vec![TreeEntry { name: "a".to_string(), is_dir: false, object_id: hello }])).unwrap();
        let root = ca
            .put(&Object::Tree(vec![
                TreeEntry { name: "dir1".to_string(), is_dir: true, object_id: leaf.clone() },
                TreeEntry { name: "dir2".to_string(), is_dir: true, object_id: leaf.clone() },
            ]))
            .unwrap();
        ca.commit_and_collect(root).unwrap();
        // one blob, one shared leaf tree (dir1 and dir2 dedup to it), one
        // root tree, one commit
        assert_eq!(ca.object_count(), 4);

        // Overwrite dir2/a with "world": dir1 still points at the old leaf.
        let world = ca.put(&Object::Blob(b"world".to_vec())).unwrap();
        let leaf2 = ca.put(&Object::Tree(vec![TreeEntry { name: "a".to_string(), is_dir: false, object_id: world }])).unwrap();
        let root2 = ca
            .put(&Object::Tree(vec![
                TreeEntry { name: "dir1".to_string(), is_dir: true, object_id: leaf.clone() },
                TreeEntry { name: "dir2".to_string(), is_dir: true, object_id: leaf2.clone() },
            ]))
            .unwrap();
        ca.commit_and_collect(root2).unwrap();
        assert_eq!(ca.object_count(), 6);

        // Set dir1/a to "world" too: dir1's new leaf dedups with dir2's.
        let root3 = ca
            .put(&Object::Tree(vec![
                TreeEntry { name: "dir1".to_string(), is_dir: true, object_id: leaf2.clone() },
                TreeEntry { name: "dir2".to_string(), is_dir: true, object_id: leaf2 },
            ]))
            .unwrap();
        ca.commit_and_collect(root3).unwrap();
        assert_eq!(ca.object_count(), 4);
    }
}
