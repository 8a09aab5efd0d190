//! In-memory virtual filesystem owned by a toolchain module.
//!
//! Paths are absolute and `/`-separated. `.` and `..` components are
//! resolved lexically; `..` above the root stays at the root. Directory
//! listings include the `.` and `..` pseudo-entries, which callers that walk
//! a directory are expected to skip.

use std::collections::BTreeMap;

use crate::error::FsError;

/// Default permission bits for newly written files.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default permission bits for new directories.
const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
enum NodeKind {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    mode: u32,
}

/// Metadata for a single filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub is_dir: bool,
    pub len: usize,
    pub mode: u32,
}

impl Metadata {
    /// Whether any execute bit is set on a regular file.
    pub fn is_executable(&self) -> bool {
        !self.is_dir && self.mode & 0o111 != 0
    }
}

/// An in-memory tree of files and directories.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    nodes: BTreeMap<String, Node>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// Create a filesystem containing only the root directory.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                kind: NodeKind::Dir,
                mode: DEFAULT_DIR_MODE,
            },
        );
        Self { nodes }
    }

    /// Create a directory. The parent must exist.
    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path)?;
        if self.nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.require_parent_dir(&path)?;
        self.nodes.insert(
            path,
            Node {
                kind: NodeKind::Dir,
                mode: DEFAULT_DIR_MODE,
            },
        );
        Ok(())
    }

    /// Create a directory and any missing ancestors.
    ///
    /// Succeeds when the directory already exists.
    pub fn create_dir_all(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path)?;
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            match self.nodes.get(&current) {
                Some(Node {
                    kind: NodeKind::Dir,
                    ..
                }) => {}
                Some(_) => return Err(FsError::NotADirectory(current)),
                None => {
                    self.nodes.insert(
                        current.clone(),
                        Node {
                            kind: NodeKind::Dir,
                            mode: DEFAULT_DIR_MODE,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Write a file, replacing existing contents. Existing permission bits
    /// are kept on overwrite.
    pub fn write_file(&mut self, path: &str, data: impl Into<Vec<u8>>) -> Result<(), FsError> {
        let path = normalize(path)?;
        let mode = match self.nodes.get(&path) {
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => return Err(FsError::IsADirectory(path)),
            Some(node) => node.mode,
            None => {
                self.require_parent_dir(&path)?;
                DEFAULT_FILE_MODE
            }
        };
        self.nodes.insert(
            path,
            Node {
                kind: NodeKind::File(data.into()),
                mode,
            },
        );
        Ok(())
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let path = normalize(path)?;
        match self.nodes.get(&path) {
            Some(Node {
                kind: NodeKind::File(data),
                ..
            }) => Ok(data.clone()),
            Some(_) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Set permission bits.
    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let path = normalize(path)?;
        let node = self
            .nodes
            .get_mut(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        node.mode = mode & 0o7777;
        Ok(())
    }

    /// Entry metadata.
    pub fn metadata(&self, path: &str) -> Result<Metadata, FsError> {
        let path = normalize(path)?;
        let node = self.nodes.get(&path).ok_or(FsError::NotFound(path))?;
        Ok(match &node.kind {
            NodeKind::File(data) => Metadata {
                is_dir: false,
                len: data.len(),
                mode: node.mode,
            },
            NodeKind::Dir => Metadata {
                is_dir: true,
                len: 0,
                mode: node.mode,
            },
        })
    }

    /// Whether anything exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        normalize(path).is_ok_and(|p| self.nodes.contains_key(&p))
    }

    /// Remove a regular file.
    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path)?;
        match self.nodes.get(&path) {
            Some(Node {
                kind: NodeKind::File(_),
                ..
            }) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(_) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(FsError::InvalidPath(path));
        }
        match self.nodes.get(&path) {
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => {
                if self.children(&path).next().is_some() {
                    return Err(FsError::NotEmpty(path));
                }
                self.nodes.remove(&path);
                Ok(())
            }
            Some(_) => Err(FsError::NotADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Remove a file, or a directory and everything beneath it.
    pub fn remove_all(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(FsError::InvalidPath(path));
        }
        if !self.nodes.contains_key(&path) {
            return Err(FsError::NotFound(path));
        }
        let prefix = format!("{path}/");
        self.nodes
            .retain(|key, _| key != &path && !key.starts_with(&prefix));
        Ok(())
    }

    /// List a directory: `.`, `..`, then child names in sorted order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = normalize(path)?;
        match self.nodes.get(&path) {
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => {}
            Some(_) => return Err(FsError::NotADirectory(path)),
            None => return Err(FsError::NotFound(path)),
        }
        let mut entries = vec![".".to_string(), "..".to_string()];
        entries.extend(self.children(&path).map(|(name, _)| name.to_string()));
        Ok(entries)
    }

    /// Every entry at or below `dir`, as `(path, metadata)` pairs in path order.
    pub fn walk(&self, dir: &str) -> Result<Vec<(String, Metadata)>, FsError> {
        let dir = normalize(dir)?;
        if !self.nodes.contains_key(&dir) {
            return Err(FsError::NotFound(dir));
        }
        let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
        let mut out = Vec::new();
        for key in self.nodes.keys() {
            if key.starts_with(&prefix) && key != &dir {
                out.push((key.clone(), self.metadata(key)?));
            }
        }
        Ok(out)
    }

    /// Direct children of a normalized directory path.
    fn children<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a str, &'a Node)> + 'a {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
        let start = prefix.len();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .filter_map(move |(key, node)| {
                let rest = &key[start..];
                (!rest.is_empty() && !rest.contains('/')).then_some((rest, node))
            })
    }

    fn require_parent_dir(&self, path: &str) -> Result<(), FsError> {
        let parent = parent_of(path);
        match self.nodes.get(parent) {
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => Ok(()),
            Some(_) => Err(FsError::NotADirectory(parent.to_string())),
            None => Err(FsError::NotFound(parent.to_string())),
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Resolve `path` to a canonical absolute form.
pub fn normalize(path: &str) -> Result<String, FsError> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Join a directory and a single file name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
