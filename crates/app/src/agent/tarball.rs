//! Deterministic gzipped tar of an agent source directory, streamed into a
//! presigned PUT without touching disk.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use anyhow::{Context, Result};
use flate2::{Compression, GzBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cancel::Shutdown;
use crate::config::project_file::PROJECT_FILE_NAME;
use crate::error::CliError;
use crate::retry::RetryPolicy;

const CHUNK: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// Patterns excluded from every upload.
pub fn always_excluded() -> Vec<String> {
    vec![PROJECT_FILE_NAME.to_string(), ".git/".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    File { size: u64, mode: u32 },
    Symlink { target: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    rel: String,
    abs: PathBuf,
    kind: EntryKind,
}

/// The file list of an upload, fixed at collection time so every pass
/// produces identical bytes.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
    entries: Vec<Entry>,
}

fn build_matcher(root: &Path, lines: &[String], gitignore: bool) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    if gitignore {
        let path = root.join(".gitignore");
        if path.is_file()
            && let Some(err) = builder.add(&path)
        {
            return Err(err).with_context(|| format!("failed to parse {}", path.display()));
        }
    }
    for line in lines {
        builder
            .add_line(None, line)
            .with_context(|| format!("invalid exclude pattern `{line}`"))?;
    }
    builder.build().context("failed to build ignore matcher")
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 { 0o755 } else { 0o644 }
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

impl Archive {
    /// Walk `root`, honouring its `.gitignore` and `exclude` (gitignore
    /// syntax) plus the always-excluded set. Any walk error fails the call.
    pub fn collect(root: &Path, exclude: &[String]) -> Result<Self> {
        let gitignore = build_matcher(root, &[], true)?;
        let mut deny = always_excluded();
        deny.extend(exclude.iter().cloned());
        let denylist = build_matcher(root, &deny, false)?;

        let ignored = |rel: &Path, is_dir: bool| {
            denylist.matched(rel, is_dir).is_ignore() || gitignore.matched(rel, is_dir).is_ignore()
        };

        let mut entries = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let Ok(rel) = e.path().strip_prefix(root) else {
                    return true;
                };
                rel.as_os_str().is_empty() || !ignored(rel, e.file_type().is_dir())
            });
        for item in walker {
            let item = item.with_context(|| format!("failed to walk {}", root.display()))?;
            if item.file_type().is_dir() {
                continue;
            }
            let rel_path = item
                .path()
                .strip_prefix(root)
                .with_context(|| format!("{} escapes {}", item.path().display(), root.display()))?;
            let rel = rel_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let kind = if item.path_is_symlink() {
                let target = fs::read_link(item.path())
                    .with_context(|| format!("failed to read link {}", item.path().display()))?;
                EntryKind::Symlink { target }
            } else {
                let meta = item
                    .metadata()
                    .with_context(|| format!("failed to stat {}", item.path().display()))?;
                EntryKind::File {
                    size: meta.len(),
                    mode: file_mode(&meta),
                }
            };
            entries.push(Entry {
                rel,
                abs: item.path().to_path_buf(),
                kind,
            });
        }
        debug!(root = %root.display(), files = entries.len(), "collected upload");
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.rel.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode into `writer`, checking `shutdown` between entries.
    pub fn write_to<W: Write>(&self, writer: W, shutdown: Option<&Shutdown>) -> Result<W, CliError> {
        let io_err = |what: &str, err: io::Error| {
            if err.kind() == io::ErrorKind::BrokenPipe {
                CliError::Transport(format!("upload stream closed while writing {what}"))
            } else {
                CliError::Fatal(format!("failed to archive {what}: {err}"))
            }
        };
        let gz = GzBuilder::new().mtime(0).write(writer, Compression::default());
        let mut tar = tar::Builder::new(gz);
        for entry in &self.entries {
            if let Some(shutdown) = shutdown {
                shutdown.check()?;
            }
            let mut header = tar::Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            match &entry.kind {
                EntryKind::File { size, mode } => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(*size);
                    header.set_mode(*mode);
                    let file = File::open(&entry.abs).map_err(|err| io_err(&entry.rel, err))?;
                    // Guards against the file growing between the passes.
                    tar.append_data(&mut header, &entry.rel, file.take(*size))
                        .map_err(|err| io_err(&entry.rel, err))?;
                }
                EntryKind::Symlink { target } => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    tar.append_link(&mut header, &entry.rel, target)
                        .map_err(|err| io_err(&entry.rel, err))?;
                }
            }
        }
        let gz = tar.into_inner().map_err(|err| io_err("archive trailer", err))?;
        let mut inner = gz.finish().map_err(|err| io_err("gzip trailer", err))?;
        inner.flush().map_err(|err| io_err("archive", err))?;
        Ok(inner)
    }

    /// Exact encoded size, for the `Content-Length` object stores require.
    pub fn encoded_len(&self) -> Result<u64, CliError> {
        Ok(self.write_to(CountingSink::default(), None)?.0)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CliError> {
        self.write_to(Vec::new(), None)
    }
}

#[derive(Default)]
struct CountingSink(u64);

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ChannelWriter {
    tx: SyncSender<io::Result<Vec<u8>>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn push(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK));
        self.tx
            .send(Ok(chunk))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK {
            self.push()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.push()
    }
}

struct ChannelReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.current.len() - self.pos);
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Streams an [`Archive`] to a presigned URL with bounded retries.
pub struct Uploader {
    agent: ureq::Agent,
    policy: RetryPolicy,
    shutdown: Shutdown,
}

impl Uploader {
    pub fn new(agent: ureq::Agent, policy: RetryPolicy, shutdown: Shutdown) -> Self {
        Self {
            agent,
            policy,
            shutdown,
        }
    }

    /// Returns the number of bytes uploaded.
    pub fn upload(&self, archive: &Archive, url: &str) -> Result<u64, CliError> {
        let len = archive.encoded_len()?;
        info!(files = archive.len(), bytes = len, "uploading source");
        self.policy.run("upload", |attempt| {
            self.shutdown.check()?;
            debug!(attempt, "upload attempt");
            self.attempt(archive, url, len)
        })?;
        Ok(len)
    }

    fn attempt(&self, archive: &Archive, url: &str, len: u64) -> Result<(), CliError> {
        let (tx, rx) = mpsc::sync_channel::<io::Result<Vec<u8>>>(CHANNEL_DEPTH);
        thread::scope(|scope| {
            let shutdown = &self.shutdown;
            let producer = scope.spawn(move || {
                let writer = ChannelWriter {
                    tx: tx.clone(),
                    buf: Vec::with_capacity(CHUNK),
                };
                let result = archive.write_to(writer, Some(shutdown)).map(|_| ());
                if let Err(err) = &result {
                    let _ = tx.send(Err(io::Error::other(err.to_string())));
                }
                result
            });

            let mut reader = ChannelReader {
                rx,
                current: Vec::new(),
                pos: 0,
            };
            let sent = self
                .agent
                .put(url)
                .header("Content-Type", "application/gzip")
                .header("Content-Length", &len.to_string())
                .send(ureq::SendBody::from_reader(&mut reader));
            drop(reader);

            let produced = producer
                .join()
                .unwrap_or_else(|_| Err(CliError::Fatal("archive writer panicked".into())));
            if let Err(err) = produced
                && !matches!(err, CliError::Transport(_))
            {
                return Err(err);
            }
            let response = sent?;
            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                return Ok(());
            }
            let body = response.into_body().read_to_string().unwrap_or_default();
            Err(CliError::protocol(status, "upload", body.trim().to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_sim::{CloudSim, Faults};
    use flate2::read::GzDecoder;
    use tempfile::tempdir;

    fn touch(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, body).unwrap();
    }

    fn entries_of(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn excludes_gitignore_denylist_and_project_file() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(root, "agent.py", "print('hi')");
        touch(root, "livekit.toml", "[project]\nsubdomain = \"x\"\n");
        touch(root, ".gitignore", "*.log\nbuild/\n");
        touch(root, "debug.log", "noise");
        touch(root, "build/out.bin", "x");
        touch(root, ".git/HEAD", "ref");
        touch(root, "secrets/.env", "K=V");
        touch(root, "src/util.py", "");

        let archive = Archive::collect(root, &["secrets/".to_string()]).unwrap();
        let paths: Vec<&str> = archive.paths().collect();
        assert_eq!(paths, vec![".gitignore", "agent.py", "src/util.py"]);
        assert_eq!(entries_of(&archive.to_bytes().unwrap()), paths);
    }

    #[test]
    fn encoding_is_deterministic_and_counted_exactly() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt", "alpha");
        touch(dir.path(), "nested/b.txt", &"b".repeat(200_000));
        let archive = Archive::collect(dir.path(), &[]).unwrap();
        let first = archive.to_bytes().unwrap();
        let second = archive.to_bytes().unwrap();
        assert_eq!(first, second);
        assert_eq!(archive.encoded_len().unwrap(), first.len() as u64);
    }

    #[test]
    fn channel_pipe_round_trips_bytes() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "big.bin", &"z".repeat(3 * CHUNK + 17));
        let archive = Archive::collect(dir.path(), &[]).unwrap();
        let expected = archive.to_bytes().unwrap();

        let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let streamed = thread::scope(|scope| {
            scope.spawn(|| {
                let writer = ChannelWriter {
                    tx,
                    buf: Vec::new(),
                };
                archive.write_to(writer, None).unwrap();
            });
            let mut reader = ChannelReader {
                rx,
                current: Vec::new(),
                pos: 0,
            };
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        });
        assert_eq!(streamed, expected);
    }

    #[test]
    fn cancellation_stops_encoding() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt", "alpha");
        let archive = Archive::collect(dir.path(), &[]).unwrap();
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let err = archive.write_to(Vec::new(), Some(&shutdown)).unwrap_err();
        assert!(matches!(err, CliError::Cancelled));
    }

    fn quick_uploader(attempts: u32) -> Uploader {
        let policy = RetryPolicy {
            attempts,
            initial_delay: std::time::Duration::from_millis(5),
            max_delay: std::time::Duration::from_millis(20),
        };
        let agent = crate::services::build_agent(std::time::Duration::from_secs(10));
        Uploader::new(agent, policy, Shutdown::new())
    }

    #[test]
    fn upload_retries_a_transient_rejection() {
        let sim = CloudSim::start_with(Faults {
            upload_failures: 1,
            ..Faults::default()
        })
        .unwrap();
        let dir = tempdir().unwrap();
        touch(dir.path(), "agent.py", "print('hi')");
        let archive = Archive::collect(dir.path(), &[]).unwrap();

        let url = format!("{}/uploads/CA_0001/v1", sim.url());
        let sent = quick_uploader(3).upload(&archive, &url).unwrap();
        assert_eq!(sent, archive.encoded_len().unwrap());

        let uploads = sim.state().uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].bytes as u64, sent);
    }

    #[test]
    fn upload_gives_up_after_the_attempt_budget() {
        let sim = CloudSim::start_with(Faults {
            upload_failures: 5,
            ..Faults::default()
        })
        .unwrap();
        let dir = tempdir().unwrap();
        touch(dir.path(), "agent.py", "print('hi')");
        let archive = Archive::collect(dir.path(), &[]).unwrap();

        let url = format!("{}/uploads/CA_0001/v1", sim.url());
        let err = quick_uploader(2).upload(&archive, &url).unwrap_err();
        assert!(matches!(err, CliError::Protocol { status: 503, .. }));
        assert!(sim.state().uploads().is_empty());
    }
}
