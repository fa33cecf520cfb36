//! The transfer format shared by artifact uploads and output retrieval.
//!
//! A [Bundle] is a list of [Entry] headers relative to the artifact root plus the
//! concatenated bytes of every file entry, in header order. A single file or an in-memory
//! buffer is one file entry with an empty path.

use std::{
    fs,
    io::{self, Read, Write},
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub len: u64,
}

/// Sum of the file lengths that follow a frame carrying these entries.
pub fn body_len(entries: &[Entry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.kind == EntryKind::File)
        .map(|e| e.len)
        .sum()
}

/// Return true if `path` is a relative path that stays inside its root. `.` components
/// are allowed, `..` and absolute paths are not.
pub fn is_safe_relative(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }

    let mut normal = false;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => normal = true,
            Component::CurDir => {}
            _ => return false,
        }
    }
    normal
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    pub entries: Vec<Entry>,
    pub body: Vec<u8>,
}

impl Bundle {
    /// A bundle holding a single file's contents.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Bundle {
            entries: vec![Entry {
                path: String::new(),
                kind: EntryKind::File,
                len: bytes.len() as u64,
            }],
            body: bytes,
        }
    }

    /// Read a file or a directory tree into a bundle. Directory entries are sorted so that the
    /// same tree always produces the same bundle.
    pub fn read_path(path: &Path) -> io::Result<Bundle> {
        let mut entries = scan_path(path)?;
        let mut body = Vec::with_capacity(body_len(&entries) as usize);
        for entry in entries.iter_mut().filter(|e| e.kind == EntryKind::File) {
            let start = body.len();
            fs::File::open(entry_path(path, entry))?.read_to_end(&mut body)?;
            entry.len = (body.len() - start) as u64;
        }

        Ok(Bundle { entries, body })
    }

    pub fn is_single_file(&self) -> bool {
        self.entries.len() == 1
            && self.entries[0].path.is_empty()
            && self.entries[0].kind == EntryKind::File
    }

    /// Total number of bytes in the body.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    /// Check that the entry headers agree with the body and only name paths inside the root.
    pub fn validate(&self) -> Result<(), String> {
        if self.is_single_file() {
            return if self.entries[0].len == self.size() {
                Ok(())
            } else {
                Err(format!(
                    "entry length {} does not match body length {}",
                    self.entries[0].len,
                    self.size()
                ))
            };
        }

        for entry in &self.entries {
            if !is_safe_relative(&entry.path) {
                return Err(format!("entry path {:?} escapes the artifact root", entry.path));
            }
        }

        let expected = body_len(&self.entries);
        if expected != self.size() {
            return Err(format!(
                "entries describe {expected} bytes but the body holds {}",
                self.size()
            ));
        }

        Ok(())
    }

    /// Iterate over each entry along with its slice of the body.
    pub fn iter(&self) -> impl Iterator<Item = (&Entry, &[u8])> {
        let mut offset = 0usize;
        self.entries.iter().map(move |entry| {
            let data = match entry.kind {
                EntryKind::File => {
                    let start = offset;
                    offset += entry.len as usize;
                    &self.body[start..offset]
                }
                EntryKind::Dir => &self.body[0..0],
            };
            (entry, data)
        })
    }

    /// Materialize the bundle at `dest`, which must not exist yet. A single-file bundle becomes
    /// a file, anything else becomes a directory.
    pub fn write_to(&self, dest: &Path) -> io::Result<()> {
        self.validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if self.is_single_file() {
            let mut file = fs::File::create(dest)?;
            file.write_all(&self.body)?;
            return file.sync_all();
        }

        fs::create_dir_all(dest)?;
        for (entry, data) in self.iter() {
            let target: PathBuf = dest.join(&entry.path);
            match entry.kind {
                EntryKind::Dir => fs::create_dir_all(&target)?,
                EntryKind::File => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, data)?;
                }
            }
        }

        Ok(())
    }
}

/// List the entries [Bundle::read_path] would produce for `path` without reading any file
/// contents. Lengths come from the file metadata.
pub fn scan_path(path: &Path) -> io::Result<Vec<Entry>> {
    let metadata = fs::metadata(path)?;
    if metadata.is_file() {
        return Ok(vec![Entry {
            path: String::new(),
            kind: EntryKind::File,
            len: metadata.len(),
        }]);
    }

    let mut entries = Vec::new();
    scan_dir_into(path, "", &mut entries)?;
    Ok(entries)
}

/// Where an entry of the tree rooted at `root` lives on disk.
pub fn entry_path(root: &Path, entry: &Entry) -> PathBuf {
    if entry.path.is_empty() {
        root.to_path_buf()
    } else {
        root.join(&entry.path)
    }
}

fn scan_dir_into(root: &Path, prefix: &str, entries: &mut Vec<Entry>) -> io::Result<()> {
    let mut children = fs::read_dir(root)?.collect::<Result<Vec<_>, _>>()?;
    children.sort_by_key(|c| c.file_name());

    for child in children {
        let name = child.file_name().to_string_lossy().to_string();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        // Follow symlinks, so linked inputs inside an output directory are copied by value.
        let path = child.path();
        let metadata = fs::metadata(&path)?;
        if metadata.is_dir() {
            entries.push(Entry {
                path: rel.clone(),
                kind: EntryKind::Dir,
                len: 0,
            });
            scan_dir_into(&path, &rel, entries)?;
        } else {
            entries.push(Entry {
                path: rel,
                kind: EntryKind::File,
                len: metadata.len(),
            });
        }
    }

    Ok(())
}
