//! Command dispatch for the file service's RESP-style protocol.

use std::sync::Arc;

use forge_protocol::resp::RespValue;
use forge_protocol::ServiceError;

use crate::ca::CaBackend;
use crate::gameprobe::{self, GameInfo, KeyInfo, ProbeSource};
use crate::handler::Handler;
use crate::pathresolver::{PathResolver, ResolvedItem};
use crate::tree::{DirTree, NodeId, Permission};

pub struct FileService {
    tree: DirTree,
    ca_backend: Option<Arc<CaBackend>>,
    max_file_size: u64,
}

impl FileService {
    pub fn new(root_handler: Handler, ca_backend: Option<Arc<CaBackend>>, max_file_size: u64) -> Self {
        Self { tree: DirTree::new(root_handler), ca_backend, max_file_size }
    }

    pub fn run_command(&mut self, user: &mut String, verb: &str, args: &[String]) -> Result<RespValue, ServiceError> {
        match verb.to_ascii_uppercase().as_str() {
            "PING" => Ok(RespValue::Simple("PONG".to_string())),
            "HELP" => Ok(RespValue::bulk(help_text())),

            "USER" => {
                let [new_user] = require_args(args)?;
                *new_user.clone_into(user);
                Ok(RespValue::ok())
            }

            "STAT" => {
                let [path] = require_args(args)?;
                self.stat(user, path)
            }
            "LS" => {
                let [path] = require_args(args)?;
                self.ls(user, path)
            }
            "GET" => {
                let [path] = require_args(args)?;
                self.get(user, path)
            }
            "PUT" => {
                let [path, content] = require_args(args)?;
                self.put(user, path, content.as_bytes())
            }
            "CP" => {
                let [source, dest] = require_args(args)?;
                self.copy(user, source, dest)
            }
            "RM" => {
                let [path] = require_args(args)?;
                self.remove(user, path)
            }
            "RMDIR" => {
                let [path] = require_args(args)?;
                self.remove_directory(user, path)
            }
            "MKDIR" => {
                let [path] = require_args(args)?;
                self.create_directory_common(user, path, None)
            }
            "MKDIRAS" => {
                let [path, owner] = require_args(args)?;
                if !user.is_empty() {
                    return Err(ServiceError::permission_denied());
                }
                if owner.is_empty() {
                    return Err(ServiceError::bad_request());
                }
                self.create_directory_common(user, path, Some(owner))
            }
            "MKDIRHIER" => {
                let [path] = require_args(args)?;
                self.create_directory_hier(user, path)
            }
            "USAGE" => {
                let [path] = require_args(args)?;
                self.usage(user, path)
            }
            "FORGET" => {
                let [path] = require_args(args)?;
                self.forget(path);
                Ok(RespValue::ok())
            }
            "FTEST" => self.file_test(user, args),

            "STATREG" => {
                let [path] = require_args(args)?;
                self.stat_registration(user, path)
            }
            "LSREG" => {
                let path = args.iter().find(|a| !a.starts_with('-')).ok_or_else(ServiceError::bad_request)?;
                self.list_registration(user, path)
            }
            "STATGAME" => {
                let [path] = require_args(args)?;
                self.stat_game(user, path)
            }
            "LSGAME" => {
                let [path] = require_args(args)?;
                self.list_game(user, path)
            }

            "PROPGET" => {
                let [path, prop] = require_args(args)?;
                self.prop_get(user, path, prop)
            }
            "PROPSET" => {
                let [path, prop, value] = require_args(args)?;
                self.prop_set(user, path, prop, value)
            }
            "SETPERM" => {
                let [path, other_user, perm] = require_args(args)?;
                self.set_perm(user, path, other_user, perm)
            }
            "LSPERM" => {
                let [path] = require_args(args)?;
                self.list_perm(user, path)
            }

            "SNAPCREATE" => {
                let [name] = require_args(args)?;
                self.snap_create(user, name)
            }
            "SNAPCP" => {
                let [old_name, new_name] = require_args(args)?;
                self.snap_copy(user, old_name, new_name)
            }
            "SNAPRM" => {
                let [name] = require_args(args)?;
                self.snap_remove(user, name)
            }
            "SNAPLS" => self.snap_list(user),

            _ => Err(ServiceError::bad_request()),
        }
    }

    fn stat(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
        let item = resolver.resolve_to_item(path, Permission::LIST)?;
        Ok(describe_item(&self.tree, item))
    }

    fn ls(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
        let dir = resolver.resolve_to_directory(path, Permission::LIST)?;
        self.tree.read_content(dir);

        let mut entries = Vec::new();
        for i in 0..self.tree.num_directories(dir) {
            let child = self.tree.directory_by_index(dir, i).unwrap();
            let name = self.tree.name(child).to_string();
            entries.push(RespValue::Array(vec![RespValue::bulk(name), describe_item(&self.tree, ResolvedItem::Directory(child))]));
        }
        for i in 0..self.tree.num_files(dir) {
            let name = self.tree.file_by_index(dir, i).unwrap().info.name.clone();
            entries.push(RespValue::Array(vec![RespValue::bulk(name), describe_item(&self.tree, ResolvedItem::File(dir, i))]));
        }
        Ok(RespValue::Array(entries))
    }

    fn get(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let (dir, index) = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_file(path, Permission::READ)?
        };
        let content = self.tree.file_content(dir, index).map_err(|_| ServiceError::internal_error())?;
        if content.len() as u64 > self.max_file_size {
            return Err(ServiceError::file_too_large());
        }
        Ok(RespValue::bulk(content))
    }

    fn put(&mut self, user: &str, path: &str, content: &[u8]) -> Result<RespValue, ServiceError> {
        if content.len() as u64 > self.max_file_size {
            return Err(ServiceError::file_too_large());
        }
        let (dir, leaf) = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            let leaf = resolver.resolve_path(path)?;
            resolver.check_permission(Permission::WRITE)?;
            (resolver.directory(), leaf)
        };
        self.tree.read_content(dir);
        self.tree.create_file(dir, &leaf, content)?;
        if leaf == "pconfig.src" {
            snoop_pconfig(&mut self.tree, dir, content);
        }
        Ok(RespValue::ok())
    }

    fn copy(&mut self, user: &str, source: &str, dest: &str) -> Result<RespValue, ServiceError> {
        let (source_dir, source_index) = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_file(source, Permission::READ)?
        };
        let (dest_dir, dest_leaf) = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            let leaf = resolver.resolve_path(dest)?;
            resolver.check_permission(Permission::WRITE)?;
            (resolver.directory(), leaf)
        };
        self.tree.read_content(dest_dir);

        let handled = self.tree.copy_file(dest_dir, source_dir, source_index, &dest_leaf)?;
        if !handled {
            let content = self.tree.file_content(source_dir, source_index).map_err(|_| ServiceError::internal_error())?;
            if content.len() as u64 > self.max_file_size {
                return Err(ServiceError::file_too_large());
            }
            self.tree.create_file(dest_dir, &dest_leaf, &content)?;
        }
        if dest_leaf == "pconfig.src" {
            let content = self.tree.file_content(dest_dir, self.tree.find_file(dest_dir, &dest_leaf).unwrap())
                .map_err(|_| ServiceError::internal_error())?;
            snoop_pconfig(&mut self.tree, dest_dir, &content);
        }
        Ok(RespValue::ok())
    }

    fn remove(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let (containing, item) = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            let item = resolver.resolve_to_item(path, Permission::WRITE)?;
            (resolver.directory(), item)
        };
        match item {
            ResolvedItem::File(dir, index) => self.tree.remove_file(dir, index)?,
            ResolvedItem::Directory(child) => self.tree.remove_subdirectory(containing, child)?,
        }
        Ok(RespValue::ok())
    }

    fn remove_directory(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let (parent, target) = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            let target = resolver.resolve_to_directory_for_removal(path)?;
            (resolver.directory(), target)
        };

        // Breadth-first collection, parents before children, checking Write
        // on every directory in the subtree; a failure here aborts before
        // anything is removed.
        let mut dirs = vec![target];
        let mut index = 0;
        while index < dirs.len() {
            let current = dirs[index];
            index += 1;
            self.tree.read_content(current);
            if !self.tree.has_permission(current, user, Permission::WRITE) {
                return Err(ServiceError::permission_denied());
            }
            for i in 0..self.tree.num_directories(current) {
                dirs.push(self.tree.directory_by_index(current, i).unwrap());
            }
        }

        // Strip user content bottom-up, then remove each directory
        // bottom-up. A failure partway leaves the already-stripped
        // directories cleared but not removed -- the same limited
        // atomicity the rest of this design accepts for RMDIR.
        for &dir in dirs.iter().rev() {
            self.tree.remove_user_content(dir)?;
        }
        self.tree.remove_subdirectory(parent, target)?;
        Ok(RespValue::ok())
    }

    fn create_directory_common(&mut self, user: &str, path: &str, owner: Option<&str>) -> Result<RespValue, ServiceError> {
        let (dir, leaf) = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            let leaf = resolver.resolve_path(path)?;
            resolver.check_permission(Permission::WRITE)?;
            if resolver.resolve_leaf_kind(&leaf).is_some() {
                return Err(ServiceError::already_exists());
            }
            (resolver.directory(), leaf)
        };
        let child = self.tree.create_directory(dir, &leaf)?;
        if let Some(owner) = owner {
            self.tree.set_property(child, "owner", owner);
        }
        Ok(RespValue::ok())
    }

    /// For each prefix of `path`, resolve fresh from the root and create it
    /// if missing -- matching the deliberately simple "try each prefix"
    /// approach rather than tracking state across prefixes.
    fn create_directory_hier(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let bytes = path.as_bytes();
        for i in 0..=bytes.len() {
            if i != bytes.len() && bytes[i] != b'/' {
                continue;
            }
            let part = &path[..i];
            if part.is_empty() {
                continue;
            }
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            let leaf = resolver.resolve_path(part)?;
            match resolver.resolve_leaf_kind(&leaf) {
                Some(true) => continue,
                Some(false) => return Err(ServiceError::already_exists()),
                None => {
                    resolver.check_permission(Permission::WRITE)?;
                    let dir = resolver.directory();
                    self.tree.create_directory(dir, &leaf)?;
                }
            }
        }
        Ok(RespValue::ok())
    }

    fn usage(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let dir = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::LIST)?
        };
        let mut num_items = 0i64;
        let mut total_kbytes = 0i64;
        self.tree.compute_totals(dir, &mut num_items, &mut total_kbytes);
        Ok(RespValue::Array(vec![RespValue::Integer(num_items), RespValue::Integer(total_kbytes)]))
    }

    /// No permission or syntax checks: walks only already-cached
    /// directories, so it can never reveal or touch anything a later
    /// request couldn't already see.
    fn forget(&mut self, path: &str) {
        let mut current = self.tree.root();
        let mut rest = path;
        loop {
            let (component, tail) = match rest.split_once('/') {
                Some((c, t)) => (c, Some(t)),
                None => (rest, None),
            };
            if !self.tree.was_read(current) {
                return;
            }
            let Some(next) = self.tree.find_directory(current, component) else { return };
            current = next;
            match tail {
                Some(t) => rest = t,
                None => break,
            }
        }
        self.tree.forget_content(current);
    }

    fn file_test(&mut self, user: &str, paths: &[String]) -> Result<RespValue, ServiceError> {
        let results = paths
            .iter()
            .map(|path| {
                let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
                RespValue::Integer(if resolver.resolve_to_file(path, Permission::READ).is_ok() { 1 } else { 0 })
            })
            .collect();
        Ok(RespValue::Array(results))
    }

    fn stat_registration(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let dir = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::READ)?
        };
        self.tree.read_content(dir);
        let key = gameprobe::probe_registration(&TreeProbeSource { tree: &self.tree, dir });
        key.map(|k| key_info_to_resp(path, &k)).ok_or_else(ServiceError::not_found)
    }

    fn list_registration(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let root = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::READ)?
        };
        let mut results = Vec::new();
        let mut work = vec![(path.to_string(), root)];
        while let Some((name, dir)) = work.pop() {
            self.tree.read_content(dir);
            if let Some(key) = gameprobe::probe_registration(&TreeProbeSource { tree: &self.tree, dir }) {
                results.push(key_info_to_resp(&name, &key));
            }
            for i in 0..self.tree.num_directories(dir) {
                let child = self.tree.directory_by_index(dir, i).unwrap();
                self.tree.read_content(child);
                if self.tree.has_permission(child, user, Permission::READ) {
                    let child_name = format!("{name}/{}", self.tree.name(child));
                    work.push((child_name, child));
                }
            }
        }
        Ok(RespValue::Array(results))
    }

    fn stat_game(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let dir = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::READ)?
        };
        self.tree.read_content(dir);
        let info = gameprobe::probe_game(&TreeProbeSource { tree: &self.tree, dir });
        info.map(|g| game_info_to_resp(path, &g, &self.tree, dir)).ok_or_else(ServiceError::not_found)
    }

    fn list_game(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let root = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::READ)?
        };
        let mut results = Vec::new();
        let mut work = vec![(path.to_string(), root)];
        while let Some((name, dir)) = work.pop() {
            self.tree.read_content(dir);
            if let Some(info) = gameprobe::probe_game(&TreeProbeSource { tree: &self.tree, dir }) {
                results.push(game_info_to_resp(&name, &info, &self.tree, dir));
            }
            for i in 0..self.tree.num_directories(dir) {
                let child = self.tree.directory_by_index(dir, i).unwrap();
                self.tree.read_content(child);
                if self.tree.has_permission(child, user, Permission::READ) {
                    let child_name = format!("{name}/{}", self.tree.name(child));
                    work.push((child_name, child));
                }
            }
        }
        Ok(RespValue::Array(results))
    }

    fn prop_get(&mut self, user: &str, path: &str, prop: &str) -> Result<RespValue, ServiceError> {
        let dir = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::READ)?
        };
        self.tree.read_content(dir);
        Ok(RespValue::bulk(self.tree.property(dir, &format!("prop:{prop}"))))
    }

    fn prop_set(&mut self, user: &str, path: &str, prop: &str, value: &str) -> Result<RespValue, ServiceError> {
        if value.contains(['\r', '\n']) || prop.contains(['\r', '\n', '=']) {
            return Err(ServiceError::bad_request());
        }
        let dir = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::WRITE)?
        };
        self.tree.read_content(dir);
        self.tree.set_property(dir, &format!("prop:{prop}"), value);
        Ok(RespValue::ok())
    }

    fn set_perm(&mut self, user: &str, path: &str, other_user: &str, perm: &str) -> Result<RespValue, ServiceError> {
        if other_user.is_empty() {
            return Err(ServiceError::bad_request());
        }
        let dir = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::ACCESS)?
        };
        self.tree.read_content(dir);
        self.tree.set_permission(dir, other_user, perm);
        Ok(RespValue::ok())
    }

    fn list_perm(&mut self, user: &str, path: &str) -> Result<RespValue, ServiceError> {
        let dir = {
            let mut resolver = PathResolver::new(&mut self.tree, self.tree.root(), user);
            resolver.resolve_to_directory(path, Permission::ACCESS)?
        };
        self.tree.read_content(dir);
        let owner = self.tree.owner(dir).to_string();
        let entries = self
            .tree
            .list_permissions(dir)
            .into_iter()
            .map(|(user, perm)| RespValue::Array(vec![RespValue::bulk(user), RespValue::bulk(perm)]))
            .collect();
        Ok(RespValue::Array(vec![RespValue::bulk(owner), RespValue::Array(entries)]))
    }

    fn snap_create(&mut self, user: &str, name: &str) -> Result<RespValue, ServiceError> {
        let ca = self.require_admin_ca(user)?;
        verify_snapshot_name(name)?;
        let master = ca.read_ref("refs/heads/master").map_err(|_| ServiceError::internal_error())?;
        let Some(commit) = master else { return Err(ServiceError::not_found()) };
        ca.write_ref(&format!("refs/snapshots/{name}"), &commit).map_err(|_| ServiceError::internal_error())?;
        Ok(RespValue::ok())
    }

    fn snap_copy(&mut self, user: &str, old_name: &str, new_name: &str) -> Result<RespValue, ServiceError> {
        let ca = self.require_admin_ca(user)?;
        verify_snapshot_name(old_name)?;
        verify_snapshot_name(new_name)?;
        let commit = ca
            .read_ref(&format!("refs/snapshots/{old_name}"))
            .map_err(|_| ServiceError::internal_error())?
            .ok_or_else(ServiceError::not_found)?;
        ca.write_ref(&format!("refs/snapshots/{new_name}"), &commit).map_err(|_| ServiceError::internal_error())?;
        Ok(RespValue::ok())
    }

    fn snap_remove(&mut self, user: &str, name: &str) -> Result<RespValue, ServiceError> {
        let ca = self.require_admin_ca(user)?;
        verify_snapshot_name(name)?;
        ca.remove_ref(&format!("refs/snapshots/{name}")).map_err(|_| ServiceError::internal_error())?;
        Ok(RespValue::ok())
    }

    fn snap_list(&mut self, user: &str) -> Result<RespValue, ServiceError> {
        let ca = self.require_admin_ca(user)?;
        let names = ca.list_snapshots().map_err(|_| ServiceError::internal_error())?;
        Ok(RespValue::Array(names.into_iter().map(RespValue::bulk).collect()))
    }

    fn require_admin_ca(&self, user: &str) -> Result<&Arc<CaBackend>, ServiceError> {
        if !user.is_empty() {
            return Err(ServiceError::permission_denied());
        }
        self.ca_backend.as_ref().ok_or_else(|| ServiceError::new(415, "Snapshotting not available"))
    }
}

fn verify_snapshot_name(name: &str) -> Result<(), ServiceError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && !name.contains("..")
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'+'));
    if valid {
        Ok(())
    } else {
        Err(ServiceError::unprocessable("Invalid snapshot name"))
    }
}

fn describe_item(tree: &DirTree, item: ResolvedItem) -> RespValue {
    match item {
        ResolvedItem::Directory(dir) => {
            RespValue::Array(vec![RespValue::bulk("DIR"), RespValue::Integer(tree.visibility_level(dir) as i64)])
        }
        ResolvedItem::File(dir, index) => {
            let file = tree.file_by_index(dir, index).unwrap();
            RespValue::Array(vec![
                RespValue::bulk("FILE"),
                RespValue::Integer(file.info.size.unwrap_or(0) as i64),
                file.info.content_id.clone().map(RespValue::bulk).unwrap_or_else(RespValue::nil),
            ])
        }
    }
}

fn snoop_pconfig(tree: &mut DirTree, dir: NodeId, content: &[u8]) {
    let Ok(text) = std::str::from_utf8(content) else { return };
    let mut gamename = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(['#', ';']) {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim().to_ascii_lowercase();
        if key == "phost.gamename" || key == "gamename" {
            gamename = Some(value.trim().to_string());
            if key == "phost.gamename" {
                break;
            }
        }
    }
    if let Some(name) = gamename {
        if !name.is_empty() {
            tree.set_property(dir, "prop:name", &name);
        }
    }
}

struct TreeProbeSource<'a> {
    tree: &'a DirTree,
    dir: NodeId,
}

impl ProbeSource for TreeProbeSource<'_> {
    fn read(&self, name: &str) -> Option<Vec<u8>> {
        let index = self.tree.find_file(self.dir, name)?;
        self.tree.file_content(self.dir, index).ok()
    }
}

fn key_info_to_resp(path: &str, key: &KeyInfo) -> RespValue {
    RespValue::Array(vec![
        RespValue::bulk(path),
        RespValue::bulk(format!("{path}/{}", key.file_name)),
        RespValue::Integer(key.is_registered as i64),
        RespValue::bulk(key.label1.clone()),
        RespValue::bulk(key.label2.clone()),
    ])
}

fn game_info_to_resp(path: &str, info: &GameInfo, tree: &DirTree, dir: NodeId) -> RespValue {
    let slots = info
        .slots
        .iter()
        .map(|(slot, name)| RespValue::Array(vec![RespValue::Integer(*slot as i64), RespValue::bulk(name.clone())]))
        .collect();
    let missing = info.missing_files.iter().cloned().map(RespValue::bulk).collect();
    RespValue::Array(vec![
        RespValue::bulk(path),
        RespValue::bulk(tree.property(dir, "prop:name")),
        RespValue::Array(slots),
        RespValue::Array(missing),
        RespValue::bulk(info.host_version.clone()),
    ])
}

fn require_args<'a, const N: usize>(args: &'a [String]) -> Result<[&'a str; N], ServiceError> {
    if args.len() != N {
        return Err(ServiceError::bad_request());
    }
    let mut out = [""; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.as_str();
    }
    Ok(out)
}

fn help_text() -> &'static str {
    "Commands:\nPING\nHELP\nUSER user\nSTAT path\nLS path\nGET path\nPUT path content\nCP src dst\n\
RM path\nRMDIR path\nMKDIR path\nMKDIRAS path user\nMKDIRHIER path\nUSAGE path\nFORGET path\n\
FTEST path...\nSTATREG dir\nLSREG dir\nSTATGAME dir\nLSGAME dir\nPROPGET dir prop\n\
PROPSET dir prop value\nSETPERM dir user perms\nLSPERM dir\n\
SNAPCREATE name\nSNAPCP old new\nSNAPRM name\nSNAPLS\n"
}
