//! In-memory cached representation of the virtual file namespace.
//!
//! `DirTree` is an arena: every directory is a `DirNode` living in one
//! `Vec`, addressed by `NodeId` (a plain index). Parent back-references are
//! therefore just another `NodeId`, not an `Rc`/`Weak` pair -- the arena
//! itself is what guarantees a parent outlives its children.

use std::collections::BTreeMap;

use forge_protocol::ServiceError;

use crate::handler::{EntryKind, Handler, Info};

pub type NodeId = usize;

/// The four access flags a directory can grant per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission(u8);

impl Permission {
    pub const READ: Permission = Permission(0b0001);
    pub const WRITE: Permission = Permission(0b0010);
    pub const LIST: Permission = Permission(0b0100);
    pub const ACCESS: Permission = Permission(0b1000);

    pub fn empty() -> Permission {
        Permission(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: Permission) {
        self.0 |= other.0;
    }

    pub fn from_str(s: &str) -> Permission {
        let mut result = Permission::empty();
        for c in s.chars() {
            match c {
                'r' => result.insert(Permission::READ),
                'w' => result.insert(Permission::WRITE),
                'l' => result.insert(Permission::LIST),
                'a' => result.insert(Permission::ACCESS),
                _ => {}
            }
        }
        result
    }

    pub fn to_wire_string(self) -> String {
        let mut out = String::new();
        if self.contains(Permission::READ) {
            out.push('r');
        }
        if self.contains(Permission::WRITE) {
            out.push('w');
        }
        if self.contains(Permission::LIST) {
            out.push('l');
        }
        if self.contains(Permission::ACCESS) {
            out.push('a');
        }
        if out.is_empty() {
            out.push('0');
        }
        out
    }
}

/// A file leaf: just the backend's description, no children of its own.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub info: Info,
}

pub struct DirNode {
    pub name: String,
    pub parent: Option<NodeId>,
    handler: Handler,

    subdirectories: Vec<NodeId>,
    files: Vec<FileEntry>,
    has_unknown_content: bool,
    has_control_file: bool,
    was_read: bool,

    owner: String,
    control_info: BTreeMap<String, String>,
}

const CONTROL_FILE: &str = ".c2file";

impl DirNode {
    fn new(name: String, parent: Option<NodeId>, handler: Handler) -> Self {
        Self {
            name,
            parent,
            handler,
            subdirectories: Vec::new(),
            files: Vec::new(),
            has_unknown_content: false,
            has_control_file: false,
            was_read: false,
            owner: String::new(),
            control_info: BTreeMap::new(),
        }
    }
}

/// The arena holding every `DirNode` reached so far. Nodes are created
/// lazily as `readContent` descends into subdirectories; `forget` prunes a
/// subtree back to a single unread node without shifting any other node's
/// id, so existing `NodeId`s elsewhere in the tree stay valid.
pub struct DirTree {
    nodes: Vec<Option<DirNode>>,
    root: NodeId,
}

impl DirTree {
    pub fn new(root_handler: Handler) -> Self {
        let root_node = DirNode::new(String::new(), None, root_handler);
        Self { nodes: vec![Some(root_node)], root: 0 }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn node(&self, id: NodeId) -> &DirNode {
        self.nodes[id].as_ref().expect("dangling NodeId")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut DirNode {
        self.nodes[id].as_mut().expect("dangling NodeId")
    }

    pub fn was_read(&self, id: NodeId) -> bool {
        self.node(id).was_read
    }

    /// Reads directory metadata from the backend unless already cached.
    /// Backend errors are swallowed: the directory is simply left appearing
    /// empty, matching the original's "log and move on" behavior, since a
    /// storage hiccup here must not crash the service.
    pub fn read_content(&mut self, id: NodeId) {
        if self.node(id).was_read {
            return;
        }
        self.node_mut(id).was_read = true;

        let listing = match self.node(id).handler.read_content() {
            Ok(listing) => listing,
            Err(err) => {
                tracing::error!(node = id, error = %err, "failed to read directory content");
                return;
            }
        };

        for info in listing {
            if info.name.is_empty() || info.name.starts_with('.') {
                if info.kind == EntryKind::File && info.name == CONTROL_FILE {
                    self.node_mut(id).has_control_file = true;
                } else {
                    self.node_mut(id).has_unknown_content = true;
                }
                continue;
            }
            match info.kind {
                EntryKind::Directory => {
                    let child_handler = match self.node(id).handler.get_directory_handler(&info) {
                        Ok(handler) => handler,
                        Err(err) => {
                            tracing::error!(node = id, name = %info.name, error = %err, "failed to descend into subdirectory");
                            continue;
                        }
                    };
                    let child = DirNode::new(info.name.clone(), Some(id), child_handler);
                    let child_id = self.nodes.len();
                    self.nodes.push(Some(child));
                    self.node_mut(id).subdirectories.push(child_id);
                }
                EntryKind::File => {
                    self.node_mut(id).files.push(FileEntry { info });
                }
                EntryKind::Unknown => {
                    self.node_mut(id).has_unknown_content = true;
                }
            }
        }

        self.load_control_file(id);
        self.update_owner(id);
    }

    /// Resets `id` and every descendant to unread status, dropping cached
    /// children entirely so the next `read_content` resynchronises against
    /// the backend.
    pub fn forget_content(&mut self, id: NodeId) {
        if !self.node(id).was_read {
            return;
        }
        let children = std::mem::take(&mut self.node_mut(id).subdirectories);
        for child in children {
            self.drop_subtree(child);
        }
        let node = self.node_mut(id);
        node.files.clear();
        node.has_unknown_content = false;
        node.has_control_file = false;
        node.was_read = false;
        node.owner.clear();
        node.control_info.clear();
    }

    fn drop_subtree(&mut self, id: NodeId) {
        let children = self.node(id).subdirectories.clone();
        for child in children {
            self.drop_subtree(child);
        }
        self.nodes[id] = None;
    }

    pub fn find_directory(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.node(id).subdirectories.iter().copied().find(|&child| self.node(child).name == name)
    }

    pub fn find_file(&self, id: NodeId, name: &str) -> Option<usize> {
        self.node(id).files.iter().position(|f| f.info.name == name)
    }

    pub fn num_directories(&self, id: NodeId) -> usize {
        self.node(id).subdirectories.len()
    }

    pub fn directory_by_index(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.node(id).subdirectories.get(index).copied()
    }

    pub fn num_files(&self, id: NodeId) -> usize {
        self.node(id).files.len()
    }

    pub fn file_by_index(&self, id: NodeId, index: usize) -> Option<&FileEntry> {
        self.node(id).files.get(index)
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    pub fn file_content(&self, id: NodeId, file_index: usize) -> anyhow::Result<Vec<u8>> {
        let file = &self.node(id).files[file_index];
        self.node(id).handler.get_file(&file.info)
    }

    pub fn create_file(&mut self, id: NodeId, name: &str, content: &[u8]) -> Result<(), ServiceError> {
        if self.find_directory(id, name).is_some() {
            return Err(ServiceError::already_exists());
        }
        let info = self
            .node_mut(id)
            .handler
            .create_file(name, content)
            .map_err(|_| ServiceError::internal_error())?;
        if let Some(index) = self.find_file(id, name) {
            self.node_mut(id).files[index].info = info;
        } else {
            self.node_mut(id).files.push(FileEntry { info });
        }
        Ok(())
    }

    /// Tries a backend-level copy; returns `true` if the backend handled it
    /// (no caller-side read+write needed), `false` if it declined.
    pub fn copy_file(&mut self, dest: NodeId, source: NodeId, source_file_index: usize, name: &str) -> Result<bool, ServiceError> {
        if self.find_directory(dest, name).is_some() {
            return Err(ServiceError::already_exists());
        }
        let source_info = self.node(source).files[source_file_index].info.clone();

        let copied = {
            let (dest_node, source_node) = self.node_pair_mut(dest, source);
            dest_node.handler.copy_file(&source_node.handler, &source_info, name)
        }
        .map_err(|_| ServiceError::internal_error())?;

        match copied {
            Some(info) => {
                if let Some(index) = self.find_file(dest, name) {
                    self.node_mut(dest).files[index].info = info;
                } else {
                    self.node_mut(dest).files.push(FileEntry { info });
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn node_pair_mut(&mut self, a: NodeId, b: NodeId) -> (&mut DirNode, &mut DirNode) {
        assert_ne!(a, b, "cannot borrow the same node mutably twice");
        if a < b {
            let (left, right) = self.nodes.split_at_mut(b);
            (left[a].as_mut().unwrap(), right[0].as_mut().unwrap())
        } else {
            let (left, right) = self.nodes.split_at_mut(a);
            (right[0].as_mut().unwrap(), left[b].as_mut().unwrap())
        }
    }

    pub fn create_directory(&mut self, id: NodeId, name: &str) -> Result<NodeId, ServiceError> {
        if self.find_directory(id, name).is_some() || self.find_file(id, name).is_some() {
            return Err(ServiceError::already_exists());
        }
        let (_, child_handler) =
            self.node_mut(id).handler.create_directory(name).map_err(|_| ServiceError::internal_error())?;
        let child = DirNode::new(name.to_string(), Some(id), child_handler);
        let child_id = self.nodes.len();
        self.nodes.push(Some(child));
        self.node_mut(id).was_read = true;
        self.node_mut(id).subdirectories.push(child_id);
        Ok(child_id)
    }

    /// Removes a subdirectory of `id`. The subdirectory must itself be
    /// empty once its own system content (a bare control file) is cleared;
    /// anything else still in it, or unknown content, blocks the removal.
    /// Files are removed with `remove_file` instead.
    pub fn remove_subdirectory(&mut self, id: NodeId, target: NodeId) -> Result<(), ServiceError> {
        if !self.node(id).subdirectories.contains(&target) {
            return Err(ServiceError::not_found());
        }
        self.read_content(target);
        if self.num_directories(target) != 0 || self.num_files(target) != 0 {
            return Err(ServiceError::permission_denied());
        }
        self.remove_system_content(target)?;
        let name = self.node(target).name.clone();
        self.node_mut(id).handler.remove_directory(&name).map_err(|_| ServiceError::internal_error())?;
        self.node_mut(id).subdirectories.retain(|&c| c != target);
        self.drop_subtree(target);
        Ok(())
    }

    pub fn remove_file(&mut self, id: NodeId, file_index: usize) -> Result<(), ServiceError> {
        let name = self.node(id).files[file_index].info.name.clone();
        self.node_mut(id).handler.remove_file(&name).map_err(|_| ServiceError::internal_error())?;
        self.node_mut(id).files.remove(file_index);
        Ok(())
    }

    /// Removes every file and every (recursively empty) subdirectory of
    /// `id`, leaving `id` itself as an empty, unread directory afterward.
    pub fn remove_user_content(&mut self, id: NodeId) -> Result<(), ServiceError> {
        self.read_content(id);
        let result = self.remove_user_content_inner(id);
        self.forget_content(id);
        result
    }

    fn remove_user_content_inner(&mut self, id: NodeId) -> Result<(), ServiceError> {
        let file_names: Vec<String> = self.node(id).files.iter().map(|f| f.info.name.clone()).collect();
        for name in file_names {
            self.node_mut(id).handler.remove_file(&name).map_err(|_| ServiceError::internal_error())?;
        }
        let children = self.node(id).subdirectories.clone();
        for child in children {
            self.read_content(child);
            if self.num_directories(child) != 0 || self.num_files(child) != 0 {
                return Err(ServiceError::permission_denied());
            }
            self.remove_system_content(child)?;
            let name = self.node(child).name.clone();
            self.node_mut(id).handler.remove_directory(&name).map_err(|_| ServiceError::internal_error())?;
        }
        Ok(())
    }

    fn remove_system_content(&mut self, id: NodeId) -> Result<(), ServiceError> {
        if self.node(id).has_unknown_content {
            return Err(ServiceError::permission_denied());
        }
        if self.node(id).has_control_file {
            self.node_mut(id).handler.remove_file(CONTROL_FILE).map_err(|_| ServiceError::internal_error())?;
            self.node_mut(id).has_control_file = false;
        }
        Ok(())
    }

    pub fn property(&self, id: NodeId, key: &str) -> String {
        self.node(id).control_info.get(key).cloned().unwrap_or_default()
    }

    /// Setting to the empty string does not remove the property -- this
    /// mirrors a known inconsistency in the system this was modeled on
    /// rather than "fixing" it, since callers may depend on the property
    /// still being enumerable afterward.
    pub fn set_property(&mut self, id: NodeId, key: &str, value: &str) {
        self.node_mut(id).control_info.insert(key.to_string(), value.to_string());
        self.save_control_file(id);
        if key == "owner" {
            self.update_owner(id);
        }
    }

    pub fn owner(&self, id: NodeId) -> &str {
        &self.node(id).owner
    }

    pub fn has_permission(&self, id: NodeId, user: &str, permission: Permission) -> bool {
        if user.is_empty() || user == self.owner(id) {
            return true;
        }
        let node = self.node(id);
        if let Some(value) = node.control_info.get(&format!("perms:{user}")) {
            return Permission::from_str(value).contains(permission);
        }
        if let Some(value) = node.control_info.get("perms:*") {
            return Permission::from_str(value).contains(permission);
        }
        false
    }

    pub fn list_permissions(&self, id: NodeId) -> Vec<(String, String)> {
        self.node(id)
            .control_info
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("perms:").map(|user| (user.to_string(), v.clone())))
            .collect()
    }

    pub fn set_permission(&mut self, id: NodeId, user_id: &str, permission: &str) {
        let normalized = Permission::from_str(permission).to_wire_string();
        self.set_property(id, &format!("perms:{user_id}"), &normalized);
    }

    /// 0 = only the owner can access, 1 = some per-user grant exists, 2 = a
    /// world (`perms:*`) grant exists.
    pub fn visibility_level(&self, id: NodeId) -> i32 {
        let node = self.node(id);
        for (key, value) in &node.control_info {
            if let Some(rest) = key.strip_prefix("perms:") {
                if !Permission::from_str(value).is_empty() {
                    return if rest == "*" { 2 } else { 1 };
                }
            }
        }
        0
    }

    pub fn compute_totals(&mut self, id: NodeId, num_items: &mut i64, total_kbytes: &mut i64) {
        *num_items += 1;
        *total_kbytes += 1;
        self.read_content(id);
        let children = self.node(id).subdirectories.clone();
        for child in children {
            self.compute_totals(child, num_items, total_kbytes);
        }
        for file in &self.node(id).files {
            *num_items += 1;
            if let Some(size) = file.info.size {
                *total_kbytes += ((size + 1023) / 1024) as i64;
            }
        }
    }

    pub fn has_unknown_content(&self, id: NodeId) -> bool {
        self.node(id).has_unknown_content
    }

    pub fn handler_label(&self, id: NodeId) -> &'static str {
        self.node(id).handler.name_hint()
    }

    fn load_control_file(&mut self, id: NodeId) {
        if !self.node(id).has_control_file {
            return;
        }
        // The control file is a dotfile, so `read_content` never adds it to
        // `node.files` -- it is tracked only via `has_control_file`. Fetch it
        // directly through the handler, the same way `save_control_file`
        // writes it directly through the handler rather than via the
        // regular file list.
        let info = Info { name: CONTROL_FILE.to_string(), kind: EntryKind::File, size: None, content_id: None };
        let Ok(bytes) = self.node(id).handler.get_file(&info) else { return };
        let Ok(text) = String::from_utf8(bytes) else { return };
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                self.node_mut(id).control_info.insert(key.to_string(), value.to_string());
            }
        }
    }

    fn save_control_file(&mut self, id: NodeId) {
        if self.node(id).control_info.is_empty() {
            if self.node(id).has_control_file {
                let _ = self.node_mut(id).handler.remove_file(CONTROL_FILE);
                self.node_mut(id).has_control_file = false;
            }
            return;
        }
        let mut body = String::new();
        for (key, value) in &self.node(id).control_info {
            body.push_str(key);
            body.push('=');
            body.push_str(value);
            body.push('\n');
        }
        if self.node_mut(id).handler.create_file(CONTROL_FILE, body.as_bytes()).is_ok() {
            self.node_mut(id).has_control_file = true;
        }
    }

    fn update_owner(&mut self, id: NodeId) {
        if let Some(owner) = self.node(id).control_info.get("owner").cloned() {
            self.node_mut(id).owner = owner;
        } else if let Some(parent) = self.node(id).parent {
            let parent_owner = self.node(parent).owner.clone();
            self.node_mut(id).owner = parent_owner;
        } else {
            self.node_mut(id).owner.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;

    #[test]
    fn control_file_properties_survive_forget_and_reread() {
        let mut tree = DirTree::new(Handler::memory());
        let root = tree.root();
        tree.read_content(root);
        tree.set_property(root, "owner", "1001");
        tree.set_property(root, "prop:name", "Foo");
        tree.set_permission(root, "1002", "rl");

        // Drop the cached state entirely, as a `FORGET` would, and force a
        // fresh read from the backend.
        tree.forget_content(root);
        tree.read_content(root);

        assert_eq!(tree.owner(root), "1001");
        assert_eq!(tree.property(root, "prop:name"), "Foo");
        assert!(tree.has_permission(root, "1002", Permission::READ));
        assert!(tree.has_permission(root, "1002", Permission::LIST));
        assert!(!tree.has_permission(root, "1002", Permission::WRITE));
    }

    #[test]
    fn permission_lookup_falls_through_owner_specific_then_world_then_refuses() {
        let mut tree = DirTree::new(Handler::memory());
        let root = tree.root();
        tree.read_content(root);
        tree.set_property(root, "owner", "1001");

        assert!(!tree.has_permission(root, "1002", Permission::READ));

        tree.set_permission(root, "*", "l");
        assert!(tree.has_permission(root, "1002", Permission::LIST));
        assert!(!tree.has_permission(root, "1002", Permission::READ));

        tree.set_permission(root, "1002", "r");
        assert!(tree.has_permission(root, "1002", Permission::READ));
    }
}
