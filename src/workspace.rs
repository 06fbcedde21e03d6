use ignore::WalkBuilder;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Receives successful mutations so an external watcher (out of scope here)
/// can fan them out to connected editors.
pub trait ChangeNotifier: Send + Sync {
    fn file_changed(&self, rel_path: &str, content: Option<&str>);
}

pub struct NullNotifier;

impl ChangeNotifier for NullNotifier {
    fn file_changed(&self, _rel_path: &str, _content: Option<&str>) {}
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Access denied: path outside workspace")]
    OutsideRoot,
    #[error("Access denied: restricted path: {0}")]
    Restricted(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Serialize)]
pub struct SearchMatch {
    pub file: String,
    pub line: usize,
    pub content: String,
}

pub const DEFAULT_RESTRICTED: &[&str] =
    &[".git", "node_modules", "vendor", ".env", "wp-config.php"];

/// Sandboxed accessor for the workspace subtree. Every operation resolves its
/// path argument against the root and fails closed on traversal escapes or
/// restricted subtrees before touching the filesystem.
pub struct Workspace {
    root: PathBuf,
    restricted: Vec<String>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>, notifier: Arc<dyn ChangeNotifier>) -> anyhow::Result<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self {
            root,
            restricted: DEFAULT_RESTRICTED.iter().map(|s| (*s).to_string()).collect(),
            notifier,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically normalize a relative path, dropping `.` and applying `..`
    /// without ever walking above the empty prefix.
    fn normalize_rel(rel: &str) -> PathBuf {
        Path::new(rel)
            .components()
            .fold(PathBuf::new(), |mut acc, comp| {
                match comp {
                    Component::ParentDir => {
                        acc.pop();
                    }
                    Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                    Component::Normal(c) => acc.push(c),
                }
                acc
            })
    }

    /// Resolve `rel` against the root. Returns `None` when the path escapes
    /// the root or when resolution is ambiguous (fail closed). Nonexistent
    /// targets are allowed as long as their nearest existing ancestor
    /// canonicalizes inside the root, so new files can be created. The result
    /// is always symlink-free up to the deepest existing component.
    pub fn resolve(&self, rel: &str) -> Option<PathBuf> {
        let joined = self.root.join(rel);
        let normalized = joined.components().fold(PathBuf::new(), |mut acc, comp| {
            match comp {
                Component::ParentDir => {
                    acc.pop();
                }
                Component::CurDir => {}
                other => acc.push(other.as_os_str()),
            }
            acc
        });
        let mut missing: Vec<std::ffi::OsString> = Vec::new();
        let mut cursor = normalized.as_path();
        let canonical = loop {
            match cursor.canonicalize() {
                Ok(c) => break c,
                Err(_) => {
                    missing.push(cursor.file_name()?.to_os_string());
                    cursor = cursor.parent()?;
                }
            }
        };
        if !canonical.starts_with(&self.root) {
            return None;
        }
        let mut out = canonical;
        for comp in missing.iter().rev() {
            out.push(comp);
        }
        Some(out)
    }

    pub fn is_safe(&self, rel: &str) -> bool {
        self.resolve(rel).is_some()
    }

    /// True when any component of the normalized path names a restricted
    /// subtree, however deeply nested the target is.
    pub fn is_restricted(&self, rel: &str) -> bool {
        Self::normalize_rel(rel).components().any(|c| match c {
            Component::Normal(name) => self
                .restricted
                .iter()
                .any(|r| name.to_string_lossy() == r.as_str()),
            _ => false,
        })
    }

    fn checked(&self, rel: &str) -> Result<PathBuf, WorkspaceError> {
        if self.is_restricted(rel) {
            return Err(WorkspaceError::Restricted(rel.to_string()));
        }
        let path = self.resolve(rel).ok_or(WorkspaceError::OutsideRoot)?;
        // a symlink inside the workspace can alias a restricted subtree, so
        // the resolved path gets the same check
        if self.is_restricted(&self.rel_of(&path)) {
            return Err(WorkspaceError::Restricted(rel.to_string()));
        }
        Ok(path)
    }

    fn rel_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    pub fn read(&self, rel: &str, max_bytes: usize) -> Result<String, WorkspaceError> {
        let path = self.checked(rel)?;
        let meta = fs::metadata(&path).map_err(|_| WorkspaceError::NotFound(rel.to_string()))?;
        if !meta.is_file() {
            return Err(WorkspaceError::NotAFile(rel.to_string()));
        }
        let mut file = fs::File::open(&path)?;
        // the caller's cap is untrusted, so never allocate past the file size
        let cap = (meta.len() as usize).min(max_bytes);
        let mut bytes = vec![0u8; cap];
        let n = file.read(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes[..n]).to_string())
    }

    pub fn write(&self, rel: &str, content: &str, notify: bool) -> Result<(), WorkspaceError> {
        let path = self.checked(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content.as_bytes())?;
        if notify {
            self.notifier.file_changed(&self.rel_of(&path), Some(content));
        }
        Ok(())
    }

    pub fn delete(&self, rel: &str, notify: bool) -> Result<(), WorkspaceError> {
        let path = self.checked(rel)?;
        if !path.exists() {
            return Err(WorkspaceError::NotFound(rel.to_string()));
        }
        if path.is_file() {
            fs::remove_file(&path)?;
        } else {
            fs::remove_dir_all(&path)?;
        }
        if notify {
            self.notifier.file_changed(&self.rel_of(&path), None);
        }
        Ok(())
    }

    /// List entries under `rel`, gitignore-aware, restricted subtrees
    /// excluded. Paths in the result are relative to the workspace root.
    pub fn list(&self, rel: &str, max: usize) -> Result<Vec<FileEntry>, WorkspaceError> {
        let dir = self.checked(rel)?;
        if !dir.is_dir() {
            return Err(WorkspaceError::NotADirectory(rel.to_string()));
        }
        let mut out = Vec::new();
        for res in WalkBuilder::new(&dir).hidden(false).git_ignore(true).build() {
            if out.len() >= max {
                break;
            }
            let Ok(dirent) = res else { continue };
            let path = dirent.path();
            if path == dir {
                continue;
            }
            let rel_path = self.rel_of(path);
            if self.is_restricted(&rel_path) {
                continue;
            }
            out.push(FileEntry {
                path: rel_path,
                is_dir: path.is_dir(),
            });
        }
        Ok(out)
    }

    /// Grep file contents for `query` (regex, falling back to a literal match
    /// when the pattern does not compile). Result count is capped at `max`.
    pub fn search(&self, query: &str, max: usize) -> Result<Vec<SearchMatch>, WorkspaceError> {
        let re = Regex::new(query).ok();
        let mut out = Vec::new();
        'walk: for res in WalkBuilder::new(&self.root).hidden(false).git_ignore(true).build() {
            let Ok(dirent) = res else { continue };
            let path = dirent.path();
            if !path.is_file() {
                continue;
            }
            let rel_path = self.rel_of(path);
            if self.is_restricted(&rel_path) {
                continue;
            }
            let Ok(content) = fs::read_to_string(path) else {
                continue; // skip binary / unreadable files
            };
            for (idx, line) in content.lines().enumerate() {
                let hit = match &re {
                    Some(re) => re.is_match(line),
                    None => line.contains(query),
                };
                if hit {
                    out.push(SearchMatch {
                        file: rel_path.clone(),
                        line: idx + 1,
                        content: line.trim_end().to_string(),
                    });
                    if out.len() >= max {
                        break 'walk;
                    }
                }
            }
        }
        Ok(out)
    }
}
