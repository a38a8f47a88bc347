//! Backend-specific directory operations: local filesystem, in-memory, and
//! content-addressable storage. `DirectoryItem` (see `tree.rs`) layers
//! caching, permissions, and control-file handling on top of this; `Handler`
//! itself performs no permission checks and only the consistency checks
//! needed to avoid corrupting its own storage.
//!
//! Modeled as a tagged enum rather than a trait object: the set of backends
//! is closed and known at mount time, so dynamic dispatch buys nothing here.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::ca::{CaBackend, Object, TreeEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Unknown,
}

/// Backend-supplied description of one directory entry.
#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub content_id: Option<String>,
}

impl Info {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self { name: name.into(), kind: EntryKind::File, size: Some(size), content_id: None }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: EntryKind::Directory, size: None, content_id: None }
    }
}

pub struct LocalHandler {
    path: PathBuf,
}

#[derive(Clone, Default)]
struct MemNode {
    files: BTreeMap<String, Vec<u8>>,
    subdirs: BTreeMap<String, Arc<Mutex<MemNode>>>,
}

pub struct MemoryHandler {
    node: Arc<Mutex<MemNode>>,
}

/// A directory within the content-addressable backend. `entries` mirrors
/// the most recently persisted tree object's contents so reads do not need
/// to round-trip through the object store; mutations update `entries`,
/// persist a new tree object, and (if `parent` is set) notify the parent so
/// the change can bubble up to a new commit on `refs/heads/master`.
pub struct CaHandler {
    store: Arc<CaBackend>,
    entries: BTreeMap<String, TreeEntry>,
    tree_id: Option<String>,
    parent: Option<(Arc<Mutex<CaHandler>>, String)>,
}

pub enum Handler {
    Local(LocalHandler),
    Memory(MemoryHandler),
    ContentAddressed(Arc<Mutex<CaHandler>>),
}

impl Handler {
    pub fn local(path: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Handler::Local(LocalHandler { path }))
    }

    pub fn memory() -> Self {
        Handler::Memory(MemoryHandler { node: Arc::new(Mutex::new(MemNode::default())) })
    }

    pub fn content_addressed(store: Arc<CaBackend>) -> anyhow::Result<Self> {
        let master = store.read_ref("refs/heads/master")?;
        let (entries, tree_id) = match master {
            Some(commit_id) => match store.get(&commit_id)? {
                Object::Commit { tree } => (load_tree_entries(&store, &tree)?, Some(tree)),
                _ => (BTreeMap::new(), None),
            },
            None => (BTreeMap::new(), None),
        };
        Ok(Handler::ContentAddressed(Arc::new(Mutex::new(CaHandler { store, entries, tree_id, parent: None }))))
    }

    pub fn read_content(&self) -> anyhow::Result<Vec<Info>> {
        match self {
            Handler::Local(h) => {
                let mut out = Vec::new();
                for entry in fs::read_dir(&h.path)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let meta = entry.metadata()?;
                    if meta.is_dir() {
                        out.push(Info::directory(name));
                    } else if meta.is_file() {
                        out.push(Info::file(name, meta.len()));
                    } else {
                        out.push(Info { name, kind: EntryKind::Unknown, size: None, content_id: None });
                    }
                }
                Ok(out)
            }
            Handler::Memory(h) => {
                let node = h.node.lock().unwrap();
                let mut out = Vec::new();
                for name in node.subdirs.keys() {
                    out.push(Info::directory(name.clone()));
                }
                for (name, content) in &node.files {
                    out.push(Info::file(name.clone(), content.len() as u64));
                }
                Ok(out)
            }
            Handler::ContentAddressed(h) => {
                let h = h.lock().unwrap();
                Ok(h.entries
                    .values()
                    .map(|e| {
                        if e.is_dir {
                            Info::directory(e.name.clone())
                        } else {
                            Info {
                                name: e.name.clone(),
                                kind: EntryKind::File,
                                size: None,
                                content_id: Some(e.object_id.clone()),
                            }
                        }
                    })
                    .collect())
            }
        }
    }

    pub fn get_file(&self, info: &Info) -> anyhow::Result<Vec<u8>> {
        match self {
            Handler::Local(h) => Ok(fs::read(h.path.join(&info.name))?),
            Handler::Memory(h) => {
                let node = h.node.lock().unwrap();
                node.files.get(&info.name).cloned().ok_or_else(|| anyhow::anyhow!("file not found: {}", info.name))
            }
            Handler::ContentAddressed(h) => {
                let h = h.lock().unwrap();
                let entry = h.entries.get(&info.name).ok_or_else(|| anyhow::anyhow!("file not found: {}", info.name))?;
                match h.store.get(&entry.object_id)? {
                    Object::Blob(bytes) => Ok(bytes),
                    _ => anyhow::bail!("object {} is not a blob", entry.object_id),
                }
            }
        }
    }

    pub fn create_file(&mut self, name: &str, content: &[u8]) -> anyhow::Result<Info> {
        match self {
            Handler::Local(h) => {
                fs::write(h.path.join(name), content)?;
                Ok(Info::file(name, content.len() as u64))
            }
            Handler::Memory(h) => {
                let mut node = h.node.lock().unwrap();
                node.files.insert(name.to_string(), content.to_vec());
                Ok(Info::file(name, content.len() as u64))
            }
            Handler::ContentAddressed(h) => {
                let object_id = {
                    let h = h.lock().unwrap();
                    h.store.put(&Object::Blob(content.to_vec()))?
                };
                let mut info = Info::file(name, content.len() as u64);
                info.content_id = Some(object_id.clone());
                CaHandler::set_entry(h, name, TreeEntry { name: name.to_string(), is_dir: false, object_id })?;
                Ok(info)
            }
        }
    }

    pub fn remove_file(&mut self, name: &str) -> anyhow::Result<()> {
        match self {
            Handler::Local(h) => Ok(fs::remove_file(h.path.join(name))?),
            Handler::Memory(h) => {
                h.node.lock().unwrap().files.remove(name);
                Ok(())
            }
            Handler::ContentAddressed(h) => CaHandler::remove_entry(h, name),
        }
    }

    pub fn create_directory(&mut self, name: &str) -> anyhow::Result<(Info, Handler)> {
        match self {
            Handler::Local(h) => {
                let path = h.path.join(name);
                fs::create_dir(&path)?;
                Ok((Info::directory(name), Handler::Local(LocalHandler { path })))
            }
            Handler::Memory(h) => {
                let child = Arc::new(Mutex::new(MemNode::default()));
                h.node.lock().unwrap().subdirs.insert(name.to_string(), child.clone());
                Ok((Info::directory(name), Handler::Memory(MemoryHandler { node: child })))
            }
            Handler::ContentAddressed(h) => {
                let store = h.lock().unwrap().store.clone();
                let child = Arc::new(Mutex::new(CaHandler {
                    store,
                    entries: BTreeMap::new(),
                    tree_id: None,
                    parent: Some((h.clone(), name.to_string())),
                }));
                // An empty directory has no tree object yet; it gets one on
                // its first mutation, at which point it notifies us.
                Ok((Info::directory(name), Handler::ContentAddressed(child)))
            }
        }
    }

    pub fn remove_directory(&mut self, name: &str) -> anyhow::Result<()> {
        match self {
            Handler::Local(h) => Ok(fs::remove_dir(h.path.join(name))?),
            Handler::Memory(h) => {
                h.node.lock().unwrap().subdirs.remove(name);
                Ok(())
            }
            Handler::ContentAddressed(h) => CaHandler::remove_entry(h, name),
        }
    }

    /// Attempts a backend-level copy, letting backends that can reuse
    /// storage (the CA backend reuses the source blob's object id) do so.
    /// `None` means "decline, caller should read+write instead".
    pub fn copy_file(&mut self, source: &Handler, source_info: &Info, name: &str) -> anyhow::Result<Option<Info>> {
        match (self, source) {
            (Handler::ContentAddressed(dest), Handler::ContentAddressed(src)) => {
                let entry = {
                    let src = src.lock().unwrap();
                    src.entries.get(&source_info.name).cloned()
                };
                let Some(mut entry) = entry else { return Ok(None) };
                entry.name = name.to_string();
                let mut info = Info::file(name, source_info.size.unwrap_or(0));
                info.content_id = Some(entry.object_id.clone());
                CaHandler::set_entry(dest, name, entry)?;
                Ok(Some(info))
            }
            _ => Ok(None),
        }
    }

    /// Obtains a handler scoped to an existing subdirectory previously
    /// reported by `read_content`. Used when descending into a directory
    /// discovered on disk rather than one just created in this process.
    pub fn get_directory_handler(&self, info: &Info) -> anyhow::Result<Handler> {
        match self {
            Handler::Local(h) => Ok(Handler::Local(LocalHandler { path: h.path.join(&info.name) })),
            Handler::Memory(h) => {
                let node = h.node.lock().unwrap();
                let child = node
                    .subdirs
                    .get(&info.name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("directory not found: {}", info.name))?;
                Ok(Handler::Memory(MemoryHandler { node: child }))
            }
            Handler::ContentAddressed(h) => {
                let (store, entry) = {
                    let h = h.lock().unwrap();
                    let entry = h
                        .entries
                        .get(&info.name)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("directory not found: {}", info.name))?;
                    (h.store.clone(), entry)
                };
                let entries = load_tree_entries(&store, &entry.object_id)?;
                let child = Arc::new(Mutex::new(CaHandler {
                    store,
                    entries,
                    tree_id: Some(entry.object_id),
                    parent: Some((h.clone(), info.name.clone())),
                }));
                Ok(Handler::ContentAddressed(child))
            }
        }
    }

    pub fn name_hint(&self) -> &'static str {
        match self {
            Handler::Local(_) => "local",
            Handler::Memory(_) => "memory",
            Handler::ContentAddressed(_) => "content-addressed",
        }
    }
}

impl CaHandler {
    fn set_entry(handler: &Arc<Mutex<CaHandler>>, name: &str, entry: TreeEntry) -> anyhow::Result<()> {
        let (tree_id, store, parent) = {
            let mut h = handler.lock().unwrap();
            h.entries.insert(name.to_string(), entry);
            let tree_id = h.store.put(&Object::Tree(h.entries.values().cloned().collect()))?;
            h.tree_id = Some(tree_id.clone());
            (tree_id, h.store.clone(), h.parent.clone())
        };
        Self::propagate(store, parent, tree_id)
    }

    fn remove_entry(handler: &Arc<Mutex<CaHandler>>, name: &str) -> anyhow::Result<()> {
        let (tree_id, store, parent) = {
            let mut h = handler.lock().unwrap();
            h.entries.remove(name);
            let tree_id = h.store.put(&Object::Tree(h.entries.values().cloned().collect()))?;
            h.tree_id = Some(tree_id.clone());
            (tree_id, h.store.clone(), h.parent.clone())
        };
        Self::propagate(store, parent, tree_id)
    }

    /// Bubbles a new tree id up through ancestors, updating each one's own
    /// tree object in turn, and finally records a new commit on the root.
    fn propagate(
        store: Arc<CaBackend>,
        parent: Option<(Arc<Mutex<CaHandler>>, String)>,
        mut tree_id: String,
    ) -> anyhow::Result<()> {
        let mut current_parent = parent;
        loop {
            match current_parent {
                None => {
                    store.commit_and_collect(tree_id)?;
                    return Ok(());
                }
                Some((parent_handler, child_name)) => {
                    let (next_tree_id, next_parent) = {
                        let mut parent = parent_handler.lock().unwrap();
                        parent.entries.insert(
                            child_name.clone(),
                            TreeEntry { name: child_name.clone(), is_dir: true, object_id: tree_id.clone() },
                        );
                        let next_tree_id = parent.store.put(&Object::Tree(parent.entries.values().cloned().collect()))?;
                        parent.tree_id = Some(next_tree_id.clone());
                        (next_tree_id, parent.parent.clone())
                    };
                    tree_id = next_tree_id;
                    current_parent = next_parent;
                }
            }
        }
    }
}

fn load_tree_entries(store: &CaBackend, tree_id: &str) -> anyhow::Result<BTreeMap<String, TreeEntry>> {
    match store.get(tree_id)? {
        Object::Tree(entries) => Ok(entries.into_iter().map(|e| (e.name.clone(), e)).collect()),
        _ => anyhow::bail!("object {tree_id} is not a tree"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_handler_create_then_list_roundtrips() {
        let mut handler = Handler::memory();
        handler.create_file("a.txt", b"hello").unwrap();
        let content = handler.read_content().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].name, "a.txt");
    }

    #[test]
    fn ca_handler_persists_file_across_a_fresh_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CaBackend::open(dir.path()).unwrap());
        {
            let mut handler = Handler::content_addressed(store.clone()).unwrap();
            handler.create_file("a.txt", b"hello").unwrap();
        }
        let reopened = Handler::content_addressed(store).unwrap();
        let content = reopened.read_content().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].name, "a.txt");
    }

    #[test]
    fn ca_handler_subdirectory_changes_bubble_to_root_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CaBackend::open(dir.path()).unwrap());
        let mut root = Handler::content_addressed(store.clone()).unwrap();
        let (_, mut child) = root.create_directory("sub").unwrap();
        child.create_file("a.txt", b"hello").unwrap();

        let reopened = Handler::content_addressed(store).unwrap();
        let top = reopened.read_content().unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].name, "sub");
    }
}
