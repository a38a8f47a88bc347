//! Resolves slash-separated request paths against a `DirTree`, applying the
//! 404-vs-403 visibility rule consistently: a caller who cannot list a
//! directory is told "not found" instead of "permission denied" for
//! anything that would reveal whether a name exists inside it.

use forge_protocol::ServiceError;

use crate::tree::{DirTree, NodeId, Permission};

fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['\0', ':', '/', '\\'])
}

/// Either a directory or a file found by resolution, named relative to its
/// containing directory.
pub enum ResolvedItem {
    Directory(NodeId),
    File(NodeId, usize),
}

pub struct PathResolver<'a> {
    tree: &'a mut DirTree,
    base: NodeId,
    user: String,
}

impl<'a> PathResolver<'a> {
    pub fn new(tree: &'a mut DirTree, base: NodeId, user: impl Into<String>) -> Self {
        Self { tree, base, user: user.into() }
    }

    pub fn directory(&self) -> NodeId {
        self.base
    }

    /// Walks every `/`-separated component but the last, descending `base`
    /// into each named subdirectory. Returns the final component, still
    /// unresolved, for callers that want to inspect or create it themselves
    /// (`resolve_leaf`/`resolve_leaf_kind`, `MKDIR`'s own existence check).
    pub fn resolve_path(&mut self, path: &str) -> Result<String, ServiceError> {
        self.resolve_path_ref(path).map(str::to_string)
    }

    fn resolve_path_ref<'p>(&mut self, path: &'p str) -> Result<&'p str, ServiceError> {
        let mut rest = path;
        while let Some(slash) = rest.find('/') {
            let (component, remainder) = rest.split_at(slash);
            if !is_valid_file_name(component) {
                return Err(ServiceError::bad_request());
            }

            self.tree.read_content(self.base);
            match self.tree.find_directory(self.base, component) {
                Some(dir) => self.base = dir,
                None => {
                    if self.tree.has_permission(self.base, &self.user, Permission::LIST) {
                        return Err(ServiceError::not_found());
                    } else {
                        return Err(ServiceError::permission_denied());
                    }
                }
            }
            rest = &remainder[1..];
        }

        if !is_valid_file_name(rest) {
            return Err(ServiceError::bad_request());
        }
        Ok(rest)
    }

    fn resolve_leaf(&mut self, name: &str) -> Option<ResolvedItem> {
        self.tree.read_content(self.base);
        if let Some(index) = self.tree.find_file(self.base, name) {
            return Some(ResolvedItem::File(self.base, index));
        }
        self.tree.find_directory(self.base, name).map(ResolvedItem::Directory)
    }

    /// `Some(true)` if `name` exists in the current directory and is itself
    /// a directory, `Some(false)` if it exists as a file, `None` if absent.
    pub fn resolve_leaf_kind(&mut self, name: &str) -> Option<bool> {
        match self.resolve_leaf(name) {
            Some(ResolvedItem::Directory(_)) => Some(true),
            Some(ResolvedItem::File(_, _)) => Some(false),
            None => None,
        }
    }

    pub fn has_permission(&mut self, permission: Permission) -> bool {
        self.tree.read_content(self.base);
        self.tree.has_permission(self.base, &self.user, permission)
    }

    pub fn check_permission(&mut self, permission: Permission) -> Result<(), ServiceError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(ServiceError::permission_denied())
        }
    }

    pub fn resolve_to_directory(&mut self, path: &str, permission: Permission) -> Result<NodeId, ServiceError> {
        let leaf = self.resolve_path_ref(path)?.to_string();
        let resolved = self.resolve_leaf(&leaf);
        let dir = match resolved {
            Some(ResolvedItem::Directory(dir)) => dir,
            other => {
                return if self.has_permission(Permission::LIST) {
                    if other.is_some() {
                        Err(ServiceError::not_a_directory())
                    } else {
                        Err(ServiceError::not_found())
                    }
                } else {
                    Err(ServiceError::permission_denied())
                };
            }
        };
        self.tree.read_content(dir);
        if !self.tree.has_permission(dir, &self.user, permission) {
            return Err(ServiceError::permission_denied());
        }
        Ok(dir)
    }

    pub fn resolve_to_file(&mut self, path: &str, permission: Permission) -> Result<(NodeId, usize), ServiceError> {
        let leaf = self.resolve_path_ref(path)?.to_string();
        let file = match self.resolve_leaf(&leaf) {
            Some(ResolvedItem::File(dir, index)) => (dir, index),
            _ => {
                return if self.has_permission(Permission::LIST) {
                    Err(ServiceError::not_found())
                } else {
                    Err(ServiceError::permission_denied())
                };
            }
        };
        self.check_permission(permission)?;
        Ok(file)
    }

    /// STAT semantics: a directory target is judged on whether it can list
    /// *itself*; a file target is judged on whether its container can.
    pub fn resolve_to_item(&mut self, path: &str, permission: Permission) -> Result<ResolvedItem, ServiceError> {
        let leaf = self.resolve_path_ref(path)?.to_string();
        let item = match self.resolve_leaf(&leaf) {
            Some(item) => item,
            None => {
                return if self.has_permission(Permission::LIST) {
                    Err(ServiceError::not_found())
                } else {
                    Err(ServiceError::permission_denied())
                };
            }
        };

        if permission == Permission::LIST {
            if let ResolvedItem::Directory(dir) = &item {
                self.tree.read_content(*dir);
                if !self.tree.has_permission(*dir, &self.user, permission) {
                    return Err(ServiceError::permission_denied());
                }
                return Ok(item);
            }
        }
        self.check_permission(permission)?;
        Ok(item)
    }

    /// Resolves `path` to a directory for RMDIR, without yet checking write
    /// access on the target itself (the caller walks the whole subtree to
    /// do that). `directory()` afterward is the *parent* the target is
    /// removed from.
    pub fn resolve_to_directory_for_removal(&mut self, path: &str) -> Result<NodeId, ServiceError> {
        let leaf = self.resolve_path_ref(path)?.to_string();
        let dir = match self.resolve_leaf(&leaf) {
            Some(ResolvedItem::Directory(dir)) => dir,
            other => {
                return if self.has_permission(Permission::LIST) {
                    if other.is_some() {
                        Err(ServiceError::not_a_directory())
                    } else {
                        Err(ServiceError::not_found())
                    }
                } else {
                    Err(ServiceError::permission_denied())
                };
            }
        };
        self.check_permission(Permission::WRITE)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;

    fn tree_with_world_readable_subdir() -> DirTree {
        let mut tree = DirTree::new(Handler::memory());
        let root = tree.root();
        let sub = tree.create_directory(root, "pub").unwrap();
        tree.set_permission(sub, "*", "rl");
        tree.create_file(sub, "readme.txt", b"hi").unwrap();
        tree
    }

    #[test]
    fn unknown_top_level_component_hides_behind_403_without_list() {
        let mut tree = DirTree::new(Handler::memory());
        let root = tree.root();
        let mut resolver = PathResolver::new(&mut tree, root, "someone");
        let err = resolver.resolve_to_directory("missing/inner", Permission::READ).unwrap_err();
        assert_eq!(err.code, 403);
    }

    #[test]
    fn world_readable_subdirectory_is_reachable_by_anyone() {
        let mut tree = tree_with_world_readable_subdir();
        let root = tree.root();
        let mut resolver = PathResolver::new(&mut tree, root, "anyone");
        let (dir, index) = resolver.resolve_to_file("pub/readme.txt", Permission::READ).unwrap();
        assert_eq!(tree.name(dir), "pub");
        assert_eq!(tree.file_by_index(dir, index).unwrap().info.name, "readme.txt");
    }

    #[test]
    fn stat_on_directory_checks_its_own_listability_not_the_parents() {
        let mut tree = DirTree::new(Handler::memory());
        let root = tree.root();
        let sub = tree.create_directory(root, "locked").unwrap();
        tree.set_permission(root, "*", "l");
        let mut resolver = PathResolver::new(&mut tree, root, "anyone");
        let err = resolver.resolve_to_item("locked", Permission::LIST).unwrap_err();
        assert_eq!(err.code, 403);
        let _ = sub;
    }

    #[test]
    fn invalid_component_is_a_bad_request() {
        let mut tree = DirTree::new(Handler::memory());
        let root = tree.root();
        let mut resolver = PathResolver::new(&mut tree, root, "someone");
        let err = resolver.resolve_to_directory("../etc", Permission::READ).unwrap_err();
        assert_eq!(err.code, 400);
    }
}
