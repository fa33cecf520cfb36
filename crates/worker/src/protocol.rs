//! Messages exchanged between the manager and its workers, and the framing used to carry them.
//!
//! Each frame is a single line of JSON, optionally followed by a binary body. Frames that carry
//! artifact data describe their body with [Entry] headers and the body length is the sum of the
//! file entry lengths, so the reader always knows how many bytes follow the header line.

use std::{fmt, path::Path};

use error_stack::{Report, ResultExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    bundle::{body_len, entry_path, Entry, EntryKind},
    fingerprint::{CachedArtifact, Fingerprint},
    resources::Resources,
    stats::Statistics,
};

/// Header lines longer than this are rejected rather than buffered.
const MAX_HEADER_LEN: usize = 16 * 1024 * 1024;
const STREAM_CHUNK: usize = 64 * 1024;

/// Monotonically increasing id assigned to a task when it is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id the manager assigns to a worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub fingerprint: Fingerprint,
    pub remote_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub remote_path: String,
    pub watch: bool,
}

/// Everything a worker needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSpec {
    pub task_id: TaskId,
    pub command: String,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub resources: Resources,
    pub watch_timeout_ms: u64,
}

/// How a task ended on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Exit code 0 and every watched output appeared.
    Succeeded,
    /// The command ran to completion but exited non-zero, or a watched output never appeared.
    ExecutionFailed {
        exit_code: i32,
        #[serde(default)]
        missing_outputs: Vec<String>,
    },
    /// The command could not be run or its results could not be collected.
    InfrastructureFailed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        name: String,
        resources: Resources,
        cache_capacity: Option<u64>,
        cached: Vec<CachedArtifact>,
    },
    Heartbeat {
        cached: Vec<CachedArtifact>,
        running: Vec<TaskId>,
    },
    TransferFailed {
        fingerprint: Fingerprint,
        error: String,
    },
    /// Contents of one output binding. Sent before the `result` of the same task.
    Output {
        task_id: TaskId,
        binding: usize,
        entries: Vec<Entry>,
    },
    Result {
        task_id: TaskId,
        outcome: Outcome,
        stdout: String,
        stats: Option<Statistics>,
    },
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    Welcome {
        worker_id: WorkerId,
        manager_name: String,
    },
    Put {
        fingerprint: Fingerprint,
        unpack: bool,
        entries: Vec<Entry>,
    },
    Evict {
        fingerprint: Fingerprint,
    },
    Dispatch(DispatchSpec),
    Cancel {
        task_id: TaskId,
    },
    Shutdown,
}

/// A message type that can be framed onto the wire.
pub trait Frame: Serialize + DeserializeOwned + fmt::Debug {
    /// The number of body bytes that follow this header.
    fn body_len(&self) -> u64;
}

impl Frame for WorkerMessage {
    fn body_len(&self) -> u64 {
        match self {
            WorkerMessage::Output { entries, .. } => body_len(entries),
            _ => 0,
        }
    }
}

impl Frame for ManagerMessage {
    fn body_len(&self) -> u64 {
        match self {
            ManagerMessage::Put { entries, .. } => body_len(entries),
            _ => 0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Failed to read from connection")]
    Read,
    #[error("Failed to write to connection")]
    Write,
    #[error("Malformed frame")]
    Malformed,
    #[error("Connection closed in the middle of a frame")]
    Truncated,
}

pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Read the next frame. Returns `None` when the peer closed the connection cleanly between
    /// frames. This is not cancel-safe; run it in a task of its own if it needs to race other
    /// events.
    pub async fn recv<M: Frame>(&mut self) -> Result<Option<(M, Vec<u8>)>, Report<ProtocolError>> {
        self.line.clear();
        let n = (&mut self.inner)
            .take(MAX_HEADER_LEN as u64)
            .read_line(&mut self.line)
            .await
            .change_context(ProtocolError::Read)?;
        if n == 0 {
            return Ok(None);
        }

        if !self.line.ends_with('\n') {
            return Err(Report::new(ProtocolError::Truncated))
                .attach_printable_lazy(|| format!("Header of {n} bytes has no terminator"));
        }

        let message: M = serde_json::from_str(self.line.trim_end())
            .change_context(ProtocolError::Malformed)
            .attach_printable_lazy(|| format!("Header: {}", self.line.trim_end()))?;

        let len = message.body_len() as usize;
        let mut body = vec![0u8; len];
        if len > 0 {
            self.inner
                .read_exact(&mut body)
                .await
                .change_context(ProtocolError::Truncated)
                .attach_printable_lazy(|| format!("Expected a body of {len} bytes"))?;
        }

        Ok(Some((message, body)))
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame. `body` must be exactly as long as the message declares.
    pub async fn send<M: Frame>(&mut self, message: &M, body: &[u8]) -> Result<(), Report<ProtocolError>> {
        if message.body_len() != body.len() as u64 {
            return Err(Report::new(ProtocolError::Malformed)).attach_printable_lazy(|| {
                format!(
                    "Message declares {} body bytes but {} were supplied",
                    message.body_len(),
                    body.len()
                )
            });
        }

        let mut header = serde_json::to_vec(message).change_context(ProtocolError::Malformed)?;
        header.push(b'\n');

        self.inner
            .write_all(&header)
            .await
            .change_context(ProtocolError::Write)?;
        if !body.is_empty() {
            self.inner
                .write_all(body)
                .await
                .change_context(ProtocolError::Write)?;
        }
        self.inner.flush().await.change_context(ProtocolError::Write)?;
        Ok(())
    }

    /// Write one frame whose body is streamed from the tree at `root` that `entries` describe.
    ///
    /// A file that has shrunk or vanished since the entries were listed is padded with zeros
    /// so the frame keeps the length its header declares. Returns false when that happened,
    /// in which case the receiver gets content that no longer matches its fingerprint.
    pub async fn send_tree<M: Frame>(
        &mut self,
        message: &M,
        root: &Path,
        entries: &[Entry],
    ) -> Result<bool, Report<ProtocolError>> {
        if message.body_len() != body_len(entries) {
            return Err(Report::new(ProtocolError::Malformed)).attach_printable_lazy(|| {
                format!(
                    "Message declares {} body bytes but the entries hold {}",
                    message.body_len(),
                    body_len(entries)
                )
            });
        }

        let mut header = serde_json::to_vec(message).change_context(ProtocolError::Malformed)?;
        header.push(b'\n');
        self.inner
            .write_all(&header)
            .await
            .change_context(ProtocolError::Write)?;

        let mut intact = true;
        let mut buf = vec![0u8; STREAM_CHUNK];
        for entry in entries.iter().filter(|e| e.kind == EntryKind::File) {
            let mut remaining = entry.len;
            if let Ok(file) = tokio::fs::File::open(entry_path(root, entry)).await {
                let mut file = file.take(entry.len);
                loop {
                    let n = match file.read(&mut buf).await {
                        Ok(n) => n,
                        Err(_) => break,
                    };
                    if n == 0 {
                        break;
                    }
                    self.inner
                        .write_all(&buf[..n])
                        .await
                        .change_context(ProtocolError::Write)?;
                    remaining -= n as u64;
                }
            }

            if remaining > 0 {
                intact = false;
                buf.fill(0);
                while remaining > 0 {
                    let n = remaining.min(buf.len() as u64) as usize;
                    self.inner
                        .write_all(&buf[..n])
                        .await
                        .change_context(ProtocolError::Write)?;
                    remaining -= n as u64;
                }
            }
        }

        self.inner.flush().await.change_context(ProtocolError::Write)?;
        Ok(intact)
    }

    pub async fn shutdown(&mut self) {
        self.inner.shutdown().await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Bundle, EntryKind};

    #[tokio::test]
    async fn frames_with_bodies_stay_aligned() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let bundle = Bundle::from_bytes(b"ACGTACGT".to_vec());
        let put = ManagerMessage::Put {
            fingerprint: Fingerprint::parse("buffer-0123456789abcdef0123456789abcdef").unwrap(),
            unpack: false,
            entries: bundle.entries.clone(),
        };

        let write = tokio::spawn(async move {
            writer.send(&put, &bundle.body).await.unwrap();
            writer.send(&ManagerMessage::Shutdown, &[]).await.unwrap();
        });

        let (first, body) = reader
            .recv::<ManagerMessage>()
            .await
            .expect("reading put")
            .expect("put frame");
        match first {
            ManagerMessage::Put { entries, .. } => {
                assert_eq!(entries[0].kind, EntryKind::File);
                assert_eq!(body, b"ACGTACGT");
            }
            other => panic!("unexpected message {other:?}"),
        }

        let (second, body) = reader
            .recv::<ManagerMessage>()
            .await
            .expect("reading shutdown")
            .expect("shutdown frame");
        assert!(matches!(second, ManagerMessage::Shutdown));
        assert!(body.is_empty());

        write.await.unwrap();
        assert!(reader.recv::<ManagerMessage>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tree_bodies_are_streamed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("ref");
        std::fs::create_dir_all(tree.join("index")).unwrap();
        std::fs::write(tree.join("genome.fa"), vec![b'G'; STREAM_CHUNK + 5]).unwrap();
        std::fs::write(tree.join("index/genome.1.bt2"), b"index").unwrap();

        let expected = Bundle::read_path(&tree).unwrap();
        let put = ManagerMessage::Put {
            fingerprint: Fingerprint::parse("dir-0123456789abcdef0123456789abcdef").unwrap(),
            unpack: false,
            entries: expected.entries.clone(),
        };

        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);
        let entries = expected.entries.clone();
        let write = tokio::spawn(async move { writer.send_tree(&put, &tree, &entries).await });

        let (_, body) = reader
            .recv::<ManagerMessage>()
            .await
            .expect("reading put")
            .expect("put frame");
        assert_eq!(body, expected.body);
        assert!(write.await.unwrap().expect("sending tree"), "files were unchanged");
    }

    #[tokio::test]
    async fn shrunken_file_keeps_frames_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fastq");
        std::fs::write(&path, b"@r1\nACGT\n").unwrap();
        let entries = Bundle::read_path(&path).unwrap().entries;
        std::fs::write(&path, b"@r1").unwrap();

        let put = ManagerMessage::Put {
            fingerprint: Fingerprint::parse("file-0123456789abcdef0123456789abcdef").unwrap(),
            unpack: false,
            entries: entries.clone(),
        };
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let intact = writer.send_tree(&put, &path, &entries).await.unwrap();
        writer.send(&ManagerMessage::Shutdown, &[]).await.unwrap();
        assert!(!intact);

        let (_, body) = reader.recv::<ManagerMessage>().await.unwrap().unwrap();
        assert_eq!(body, b"@r1\0\0\0\0\0\0");
        let (next, _) = reader.recv::<ManagerMessage>().await.unwrap().unwrap();
        assert!(matches!(next, ManagerMessage::Shutdown));
    }

    #[tokio::test]
    async fn rejects_body_length_mismatch() {
        let (client, _server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let message = WorkerMessage::Output {
            task_id: TaskId(1),
            binding: 0,
            entries: Bundle::from_bytes(b"abc".to_vec()).entries,
        };

        let err = writer.send(&message, b"ab").await.expect_err("length mismatch");
        assert_eq!(err.current_context(), &ProtocolError::Malformed);
    }

    #[tokio::test]
    async fn garbage_header_is_malformed() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client.write_all(b"not json\n").await.unwrap();

        let err = reader
            .recv::<WorkerMessage>()
            .await
            .expect_err("garbage header");
        assert_eq!(err.current_context(), &ProtocolError::Malformed);
    }
}
