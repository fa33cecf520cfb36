use std::{
    fmt, fs,
    io::{self, Read},
    path::Path,
};

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::bundle::{entry_path, scan_path, Bundle, Entry, EntryKind};

const READ_CHUNK: usize = 64 * 1024;

/// What an artifact was declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Directory,
    Buffer,
}

impl ArtifactKind {
    fn tag(&self) -> &'static str {
        match self {
            ArtifactKind::File => "file",
            ArtifactKind::Directory => "dir",
            ArtifactKind::Buffer => "buffer",
        }
    }

    fn from_tag(tag: &str) -> Option<ArtifactKind> {
        match tag {
            "file" => Some(ArtifactKind::File),
            "dir" => Some(ArtifactKind::Directory),
            "buffer" => Some(ArtifactKind::Buffer),
            _ => None,
        }
    }
}

/// Computes a [Fingerprint] from entries and data fed in order, so content can be hashed a
/// chunk at a time instead of being held in memory.
pub struct FingerprintBuilder {
    kind: ArtifactKind,
    hasher: Hasher,
}

impl FingerprintBuilder {
    pub fn new(kind: ArtifactKind, unpack: bool) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(kind.tag().as_bytes());
        if unpack {
            hasher.update(b"+unpack");
        }
        FingerprintBuilder { kind, hasher }
    }

    /// Start a new entry. A file entry must be followed by exactly `entry.len` bytes of
    /// [FingerprintBuilder::update].
    pub fn entry(&mut self, entry: &Entry) {
        self.hasher.update(&[0]);
        self.hasher.update(entry.path.as_bytes());
        self.hasher.update(&[match entry.kind {
            EntryKind::File => b'f',
            EntryKind::Dir => b'd',
        }]);
        self.hasher.update(&entry.len.to_le_bytes());
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> Fingerprint {
        let hash = self.hasher.finalize().to_hex();
        Fingerprint(format!("{}-{}", self.kind.tag(), &hash.as_str()[..32]))
    }
}

/// Content-derived identity of an artifact. Two artifacts with the same fingerprint are
/// interchangeable, so a worker only ever needs one copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash a bundle's entries and contents. Requesting extraction changes the fingerprint,
    /// since the unpacked tree is a different cache object than the archive.
    pub fn of(kind: ArtifactKind, unpack: bool, bundle: &Bundle) -> Fingerprint {
        let mut builder = FingerprintBuilder::new(kind, unpack);
        for (entry, data) in bundle.iter() {
            builder.entry(entry);
            builder.update(data);
        }
        builder.finish()
    }

    /// Fingerprint a file or directory tree on disk, reading it through a fixed-size buffer.
    /// Gives the same result as [Fingerprint::of] on [Bundle::read_path], and also returns the
    /// entries that were hashed.
    pub fn of_path(unpack: bool, path: &Path) -> io::Result<(Fingerprint, Vec<Entry>)> {
        let entries = scan_path(path)?;
        let single_file = entries.len() == 1 && entries[0].path.is_empty();
        let kind = if single_file {
            ArtifactKind::File
        } else {
            ArtifactKind::Directory
        };

        let mut builder = FingerprintBuilder::new(kind, unpack);
        let mut buf = vec![0u8; READ_CHUNK];
        for entry in &entries {
            builder.entry(entry);
            if entry.kind != EntryKind::File {
                continue;
            }

            let source = entry_path(path, entry);
            let mut file = fs::File::open(&source)?.take(entry.len);
            let mut read = 0u64;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                builder.update(&buf[..n]);
                read += n as u64;
            }

            if read != entry.len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} changed while it was read", source.display()),
                ));
            }
        }

        Ok((builder.finish(), entries))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kind of artifact this fingerprint was computed for.
    pub fn kind(&self) -> Option<ArtifactKind> {
        self.0
            .split_once('-')
            .and_then(|(tag, _)| ArtifactKind::from_tag(tag))
    }

    /// Only fingerprints produced by [Fingerprint::of] are valid cache directory names.
    pub fn parse(s: &str) -> Option<Fingerprint> {
        let (tag, hash) = s.split_once('-')?;
        let tag_ok = ArtifactKind::from_tag(tag).is_some();
        let hash_ok = hash.len() == 32 && hash.bytes().all(|b| b.is_ascii_hexdigit());
        (tag_ok && hash_ok).then(|| Fingerprint(s.to_string()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fingerprint present in a worker cache, along with its size on disk in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub fingerprint: Fingerprint,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_content_same_fingerprint() {
        let a = Fingerprint::of(ArtifactKind::Buffer, false, &Bundle::from_bytes(b"abc".to_vec()));
        let b = Fingerprint::of(ArtifactKind::Buffer, false, &Bundle::from_bytes(b"abc".to_vec()));
        let c = Fingerprint::of(ArtifactKind::Buffer, false, &Bundle::from_bytes(b"abd".to_vec()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unpack_and_kind_change_fingerprint() {
        let bundle = Bundle::from_bytes(b"archive".to_vec());
        let plain = Fingerprint::of(ArtifactKind::File, false, &bundle);
        let unpacked = Fingerprint::of(ArtifactKind::File, true, &bundle);
        let buffer = Fingerprint::of(ArtifactKind::Buffer, false, &bundle);
        assert_ne!(plain, unpacked);
        assert_ne!(plain, buffer);
    }

    #[test]
    fn streamed_path_matches_loaded_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("bbmap");
        std::fs::create_dir_all(tree.join("resources")).unwrap();
        std::fs::write(tree.join("bbduk.sh"), b"#!/bin/sh\n").unwrap();
        // Larger than one read chunk.
        std::fs::write(tree.join("resources/adapters.fa"), vec![b'A'; READ_CHUNK * 2 + 17]).unwrap();
        let single = dir.path().join("reads.fastq");
        std::fs::write(&single, b"@r1\nACGT\n+\nIIII\n").unwrap();

        for (path, unpack) in [(&tree, false), (&single, false), (&single, true)] {
            let bundle = Bundle::read_path(path).unwrap();
            let kind = if bundle.is_single_file() {
                ArtifactKind::File
            } else {
                ArtifactKind::Directory
            };
            let (streamed, entries) = Fingerprint::of_path(unpack, path).unwrap();
            assert_eq!(streamed, Fingerprint::of(kind, unpack, &bundle));
            assert_eq!(entries, bundle.entries);
            assert_eq!(streamed.kind(), Some(kind));
        }
    }

    #[test]
    fn of_path_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = Fingerprint::of_path(false, &dir.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn parse_accepts_only_generated_names() {
        let fp = Fingerprint::of(ArtifactKind::File, false, &Bundle::from_bytes(vec![1, 2, 3]));
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp));
        assert_eq!(Fingerprint::parse(".staging"), None);
        assert_eq!(Fingerprint::parse("file-../../etc"), None);
    }
}
