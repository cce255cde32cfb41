//! Isolated virtual filesystem.
//!
//! An in-memory tree rooted at `/`, private to one execution unit. Created
//! fresh at the start of every run and discarded at the end unless a
//! subtree is exported. The quota/readonly decisions live in the guard;
//! this module only maintains the tree and its aggregate byte size.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub content: Vec<u8>,
    pub children: BTreeMap<String, Node>,
    pub created_ms: u64,
    pub modified_ms: u64,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        let now = now_ms();
        Node {
            kind,
            content: Vec::new(),
            children: BTreeMap::new(),
            created_ms: now,
            modified_ms: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Bytes held by this node and everything below it.
    pub fn subtree_bytes(&self) -> u64 {
        self.content.len() as u64
            + self
                .children
                .values()
                .map(Node::subtree_bytes)
                .sum::<u64>()
    }
}

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: String,
    pub writable: bool,
}

#[derive(Debug, Clone)]
pub struct NodeStat {
    pub kind: NodeKind,
    pub size: u64,
    pub created_ms: u64,
    pub modified_ms: u64,
}

#[derive(Debug)]
pub struct Ivfs {
    root: Node,
    mounts: BTreeMap<String, MountEntry>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Normalize an absolute VFS path: collapses `//`, resolves `.` and `..`
/// (never above `/`).
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Resolve `path` against `cwd` (used when `path` is relative).
pub fn resolve(path: &str, cwd: &str) -> String {
    if path.starts_with('/') {
        normalize(path)
    } else if path.is_empty() {
        normalize(cwd)
    } else {
        normalize(&format!("{cwd}/{path}"))
    }
}

impl Default for Ivfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Ivfs {
    pub fn new() -> Self {
        Ivfs {
            root: Node::new(NodeKind::Directory),
            mounts: BTreeMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.root = Node::new(NodeKind::Directory);
        self.mounts.clear();
    }

    pub fn total_bytes(&self) -> u64 {
        self.root.subtree_bytes()
    }

    fn node(&self, path: &str) -> Option<&Node> {
        let path = normalize(path);
        let mut node = &self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.children.get(part)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let path = normalize(path);
        let mut node = &mut self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.children.get_mut(part)?;
        }
        Some(node)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.node(path).is_some_and(Node::is_dir)
    }

    pub fn stat(&self, path: &str) -> Option<NodeStat> {
        self.node(path).map(|n| NodeStat {
            kind: n.kind,
            size: if n.is_dir() {
                n.subtree_bytes()
            } else {
                n.content.len() as u64
            },
            created_ms: n.created_ms,
            modified_ms: n.modified_ms,
        })
    }

    pub fn mkdir_all(&mut self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut node = &mut self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node
                .children
                .entry(part.to_string())
                .or_insert_with(|| Node::new(NodeKind::Directory));
            if !node.is_dir() {
                anyhow::bail!("not a directory: {part:?} in {path}");
            }
        }
        Ok(())
    }

    /// Write a file, creating parent directories. Bumps the node's
    /// modification timestamp (and the parents', since their aggregate
    /// size changed).
    pub fn write_file(&mut self, path: &str, content: &[u8], append: bool) -> Result<()> {
        let path = normalize(path);
        let (parent, name) = split_parent(&path)?;
        self.mkdir_all(parent)?;
        let now = now_ms();

        let parent_node = self
            .node_mut(parent)
            .context("parent vanished during write")?;
        parent_node.modified_ms = now;
        let node = parent_node
            .children
            .entry(name.to_string())
            .or_insert_with(|| Node::new(NodeKind::File));
        if node.is_dir() {
            anyhow::bail!("is a directory: {path}");
        }
        if append {
            node.content.extend_from_slice(content);
        } else {
            node.content = content.to_vec();
        }
        node.modified_ms = now;
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<&[u8]> {
        let node = self
            .node(path)
            .with_context(|| format!("no such file: {}", normalize(path)))?;
        if node.is_dir() {
            anyhow::bail!("is a directory: {}", normalize(path));
        }
        Ok(&node.content)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let node = self
            .node(path)
            .with_context(|| format!("no such directory: {}", normalize(path)))?;
        if !node.is_dir() {
            anyhow::bail!("not a directory: {}", normalize(path));
        }
        Ok(node.children.keys().cloned().collect())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let path = normalize(path);
        let (parent, name) = split_parent(&path)?;
        let parent_node = self
            .node_mut(parent)
            .with_context(|| format!("no such directory: {parent}"))?;
        match parent_node.children.get(name) {
            Some(node) if node.is_dir() => anyhow::bail!("is a directory: {path}"),
            Some(_) => {
                parent_node.children.remove(name);
                parent_node.modified_ms = now_ms();
                Ok(())
            }
            None => anyhow::bail!("no such file: {path}"),
        }
    }

    /// Remove a directory. Non-empty directories require `recursive`.
    pub fn remove_dir(&mut self, path: &str, recursive: bool) -> Result<()> {
        let path = normalize(path);
        if path == "/" {
            anyhow::bail!("refusing to remove the VFS root");
        }
        let (parent, name) = split_parent(&path)?;
        let parent_node = self
            .node_mut(parent)
            .with_context(|| format!("no such directory: {parent}"))?;
        match parent_node.children.get(name) {
            Some(node) if !node.is_dir() => anyhow::bail!("not a directory: {path}"),
            Some(node) if !node.children.is_empty() && !recursive => {
                anyhow::bail!("directory not empty: {path}")
            }
            Some(_) => {
                parent_node.children.remove(name);
                parent_node.modified_ms = now_ms();
                Ok(())
            }
            None => anyhow::bail!("no such directory: {path}"),
        }
    }

    /// Record a mount binding and materialize the mount point. The binding
    /// is conceptual: no host path is traversed here.
    pub fn mount(&mut self, target: &str, source: &str, writable: bool) -> Result<()> {
        let target = normalize(target);
        if self.mounts.contains_key(&target) {
            anyhow::bail!("mount point busy: {target}");
        }
        self.mkdir_all(&target)?;
        self.mounts.insert(
            target,
            MountEntry {
                source: source.to_string(),
                writable,
            },
        );
        Ok(())
    }

    pub fn unmount(&mut self, target: &str) -> Result<()> {
        let target = normalize(target);
        self.mounts
            .remove(&target)
            .map(|_| ())
            .with_context(|| format!("not mounted: {target}"))
    }

    pub fn mounts(&self) -> &BTreeMap<String, MountEntry> {
        &self.mounts
    }

    /// Populate from a seed tree: JSON objects are directories, strings
    /// are file contents.
    pub fn populate_from_seed(&mut self, base: &str, seed: &Value) -> Result<()> {
        match seed {
            Value::Null => Ok(()),
            Value::Object(entries) => {
                self.mkdir_all(base)?;
                for (name, child) in entries {
                    if name.contains('/') {
                        anyhow::bail!("seed entry name contains '/': {name:?}");
                    }
                    let path = format!("{}/{}", base.trim_end_matches('/'), name);
                    match child {
                        Value::Object(_) => self.populate_from_seed(&path, child)?,
                        Value::String(content) => {
                            self.write_file(&path, content.as_bytes(), false)?
                        }
                        other => anyhow::bail!(
                            "seed entry {name:?} must be an object or string, got {other}"
                        ),
                    }
                }
                Ok(())
            }
            other => anyhow::bail!("seed root must be an object, got {other}"),
        }
    }

    /// Serialize a subtree back into the seed-tree shape. File contents
    /// that are not UTF-8 are dropped with a placeholder marker.
    pub fn export_subtree(&self, path: &str) -> Result<Value> {
        let node = self
            .node(path)
            .with_context(|| format!("no such path: {}", normalize(path)))?;
        Ok(export_node(node))
    }
}

fn export_node(node: &Node) -> Value {
    if node.is_dir() {
        let mut map = serde_json::Map::new();
        for (name, child) in &node.children {
            map.insert(name.clone(), export_node(child));
        }
        Value::Object(map)
    } else {
        match std::str::from_utf8(&node.content) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String(format!("<{} binary bytes>", node.content.len())),
        }
    }
}

fn split_parent(path: &str) -> Result<(&str, &str)> {
    if path == "/" {
        anyhow::bail!("the VFS root has no parent");
    }
    match path.rsplit_once('/') {
        Some(("", name)) => Ok(("/", name)),
        Some((parent, name)) => Ok((parent, name)),
        None => anyhow::bail!("path is not absolute: {path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_handles_dots_and_doubles() {
        assert_eq!(normalize("/a//b/./c"), "/a/b/c");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("/../.."), "/");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn resolve_relative_against_cwd() {
        assert_eq!(resolve("x/y", "/work"), "/work/x/y");
        assert_eq!(resolve("/abs", "/work"), "/abs");
        assert_eq!(resolve("../up", "/work/sub"), "/work/up");
        assert_eq!(resolve("", "/work"), "/work");
    }

    #[test]
    fn write_read_round_trip() {
        let mut vfs = Ivfs::new();
        vfs.write_file("/a/b/file.txt", b"hello", false).unwrap();
        assert_eq!(vfs.read_file("/a/b/file.txt").unwrap(), b"hello");
        assert!(vfs.is_dir("/a/b"));
        assert_eq!(vfs.total_bytes(), 5);

        vfs.write_file("/a/b/file.txt", b" world", true).unwrap();
        assert_eq!(vfs.read_file("/a/b/file.txt").unwrap(), b"hello world");
    }

    #[test]
    fn read_missing_or_dir_fails() {
        let mut vfs = Ivfs::new();
        vfs.mkdir_all("/d").unwrap();
        assert!(vfs.read_file("/nope").is_err());
        assert!(vfs.read_file("/d").is_err());
        assert!(vfs.write_file("/d", b"x", false).is_err());
    }

    #[test]
    fn list_dir_returns_sorted_names() {
        let mut vfs = Ivfs::new();
        vfs.write_file("/d/b.txt", b"2", false).unwrap();
        vfs.write_file("/d/a.txt", b"1", false).unwrap();
        vfs.mkdir_all("/d/sub").unwrap();
        assert_eq!(vfs.list_dir("/d").unwrap(), vec!["a.txt", "b.txt", "sub"]);
        assert!(vfs.list_dir("/d/a.txt").is_err());
        assert!(vfs.list_dir("/missing").is_err());
    }

    #[test]
    fn remove_dir_requires_recursive_when_non_empty() {
        let mut vfs = Ivfs::new();
        vfs.write_file("/d/f", b"x", false).unwrap();
        assert!(vfs.remove_dir("/d", false).is_err());
        vfs.remove_dir("/d", true).unwrap();
        assert!(!vfs.exists("/d"));
        assert!(vfs.remove_dir("/", true).is_err());
    }

    #[test]
    fn seed_round_trips_through_export() {
        let mut vfs = Ivfs::new();
        let seed = json!({
            "etc": {"motd": "hi\n"},
            "empty": {},
            "top.txt": "content"
        });
        vfs.populate_from_seed("/", &seed).unwrap();
        assert_eq!(vfs.read_file("/etc/motd").unwrap(), b"hi\n");
        assert!(vfs.is_dir("/empty"));
        assert_eq!(vfs.export_subtree("/").unwrap(), seed);
    }

    #[test]
    fn mounts_record_bindings() {
        let mut vfs = Ivfs::new();
        vfs.mount("/mnt/data", "host:/srv/data", false).unwrap();
        assert!(vfs.is_dir("/mnt/data"));
        assert!(vfs.mount("/mnt/data", "elsewhere", true).is_err());
        vfs.unmount("/mnt/data").unwrap();
        assert!(vfs.unmount("/mnt/data").is_err());
    }

    #[test]
    fn timestamps_move_on_write() {
        let mut vfs = Ivfs::new();
        vfs.write_file("/f", b"1", false).unwrap();
        let before = vfs.stat("/f").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        vfs.write_file("/f", b"22", false).unwrap();
        let after = vfs.stat("/f").unwrap();
        assert!(after.modified_ms >= before.modified_ms);
        assert_eq!(after.size, 2);
    }
}
