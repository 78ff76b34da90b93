//! Build/deploy log streaming.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::cancel::Shutdown;
use crate::error::CliError;
use crate::retry::RetryPolicy;

const POLL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipeline phase whose logs are streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Deploy,
    Update,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Update => "update",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Self::Build),
            "deploy" => Ok(Self::Deploy),
            "update" => Ok(Self::Update),
            other => Err(CliError::Input(format!(
                "unknown log phase `{other}` (expected build, deploy or update)"
            ))),
        }
    }
}

/// Yields lines until the stream closes.
pub trait LineSource: Send {
    fn next_line(&mut self) -> io::Result<Option<String>>;
}

/// Any buffered reader is a line source.
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: BufRead + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead + Send> LineSource for ReaderSource<R> {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Log {
        level: String,
        timestamp: String,
        message: String,
    },
    Status(String),
    Done {
        success: bool,
        message: String,
    },
    Error(String),
}

/// `None` for blank lines, SSE comments and frames that cannot be used.
pub fn parse_frame(line: &str) -> Option<Frame> {
    let line = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
    let trimmed = line.trim();
    if trimmed.is_empty() || line.starts_with(':') {
        return None;
    }
    if !trimmed.starts_with('{') {
        return Some(Frame::Log {
            level: String::new(),
            timestamp: String::new(),
            message: line.trim_end().to_string(),
        });
    }
    let raw: RawFrame = match serde_json::from_str(trimmed) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "skipping malformed log frame");
            return None;
        }
    };
    match raw.kind.as_str() {
        "log" | "" => Some(Frame::Log {
            level: raw.level,
            timestamp: raw.timestamp,
            message: raw.message,
        }),
        "status" => Some(Frame::Status(if raw.message.is_empty() {
            raw.status
        } else {
            raw.message
        })),
        "done" => Some(Frame::Done {
            success: !matches!(raw.status.to_ascii_lowercase().as_str(), "failed" | "error"),
            message: raw.message,
        }),
        "error" => Some(Frame::Error(raw.message)),
        other => {
            debug!(kind = other, "skipping unknown log frame");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Succeeded,
    Failed(String),
    /// The server closed the stream without a terminal marker.
    Closed,
}

fn marker(message: &str) -> Option<StreamOutcome> {
    match message.trim().trim_end_matches('.').to_ascii_lowercase().as_str() {
        "build complete" | "deploy complete" | "deployment complete" => Some(StreamOutcome::Succeeded),
        "build failed" | "deploy failed" => Some(StreamOutcome::Failed(message.trim().to_string())),
        _ => None,
    }
}

/// Render one frame; returns the terminal outcome if the frame ends the stream.
pub fn render_frame(frame: Frame, out: &mut dyn Write) -> io::Result<Option<StreamOutcome>> {
    match frame {
        Frame::Log {
            level,
            timestamp,
            message,
        } => {
            match (timestamp.is_empty(), level.is_empty()) {
                (true, true) => writeln!(out, "{message}")?,
                (true, false) => writeln!(out, "[{level}] {message}")?,
                (false, true) => writeln!(out, "{timestamp} {message}")?,
                (false, false) => writeln!(out, "{timestamp} [{level}] {message}")?,
            }
            Ok(marker(&message))
        }
        Frame::Status(status) => {
            writeln!(out, "{status}")?;
            Ok(marker(&status))
        }
        Frame::Done { success, message } => {
            if !message.is_empty() {
                writeln!(out, "{message}")?;
            }
            Ok(Some(if success {
                StreamOutcome::Succeeded
            } else {
                StreamOutcome::Failed(message)
            }))
        }
        Frame::Error(message) => {
            writeln!(out, "{message}")?;
            Ok(Some(StreamOutcome::Failed(message)))
        }
    }
}

/// Drain `source` to `out` until closed, a terminal marker arrives, or
/// `shutdown` fires. Reading happens on its own thread so cancellation
/// never waits on the network.
pub fn follow(
    mut source: Box<dyn LineSource>,
    out: &mut dyn Write,
    shutdown: &Shutdown,
) -> Result<StreamOutcome, CliError> {
    let (tx, rx) = mpsc::sync_channel::<io::Result<String>>(64);
    thread::spawn(move || {
        loop {
            let next = source.next_line();
            let stop = !matches!(next, Ok(Some(_)));
            let item = match next {
                Ok(Some(line)) => Ok(line),
                Ok(None) => break,
                Err(err) => Err(err),
            };
            if tx.send(item).is_err() || stop {
                break;
            }
        }
    });

    let write_err = |err: io::Error| CliError::Fatal(format!("failed to write logs: {err}"));
    loop {
        shutdown.check()?;
        let line = match rx.recv_timeout(POLL) {
            Ok(Ok(line)) => line,
            Ok(Err(err)) => return Err(CliError::Transport(format!("log stream failed: {err}"))),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(StreamOutcome::Closed),
        };
        let Some(frame) = parse_frame(&line) else {
            continue;
        };
        if let Some(outcome) = render_frame(frame, out).map_err(write_err)? {
            out.flush().map_err(write_err)?;
            return Ok(outcome);
        }
    }
}

/// Opens log streams over HTTP.
#[derive(Debug, Clone)]
pub struct LogStreamer {
    agent: ureq::Agent,
    policy: RetryPolicy,
}

impl LogStreamer {
    pub fn new(policy: RetryPolicy) -> Self {
        // Streams are long-lived; only the connect is bounded.
        let agent = ureq::Agent::config_builder()
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent, policy }
    }

    /// Open `url` with retries on transient failures.
    pub fn attach(&self, url: &str, bearer: &str) -> Result<Box<dyn LineSource>, CliError> {
        self.policy.run("log attach", |attempt| {
            debug!(url, attempt, "attaching to log stream");
            let response = self
                .agent
                .get(url)
                .header("Authorization", &format!("Bearer {bearer}"))
                .header("Accept", "text/event-stream")
                .call()?;
            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                let body = response.into_body().read_to_string().unwrap_or_default();
                return Err(CliError::protocol(status, "logs", body.trim().to_string()));
            }
            let reader: Box<dyn Read + Send> = Box::new(response.into_body().into_reader());
            Ok(Box::new(ReaderSource::new(BufReader::new(reader))) as Box<dyn LineSource>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(text: &str) -> Box<dyn LineSource> {
        Box::new(ReaderSource::new(Cursor::new(text.to_string().into_bytes())))
    }

    #[test]
    fn frames_parse() {
        assert_eq!(parse_frame(""), None);
        assert_eq!(parse_frame(": keepalive"), None);
        assert_eq!(
            parse_frame("data: step 1/4"),
            Some(Frame::Log {
                level: String::new(),
                timestamp: String::new(),
                message: "step 1/4".into()
            })
        );
        assert_eq!(
            parse_frame(r#"{"type":"done","status":"failed","message":"oom"}"#),
            Some(Frame::Done {
                success: false,
                message: "oom".into()
            })
        );
        assert_eq!(parse_frame(r#"{"type":"mystery"}"#), None);
        assert_eq!(parse_frame("{not json"), None);
    }

    #[test]
    fn stops_at_terminal_marker() {
        let shutdown = Shutdown::new();
        let mut out = Vec::new();
        let text = "data: pulling base image\n\n{\"type\":\"log\",\"level\":\"info\",\"message\":\"Build complete\"}\nnever printed\n";
        let outcome = follow(source(text), &mut out, &shutdown).unwrap();
        assert_eq!(outcome, StreamOutcome::Succeeded);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("pulling base image"));
        assert!(printed.contains("[info] Build complete"));
        assert!(!printed.contains("never printed"));
    }

    #[test]
    fn error_frames_fail_and_eof_closes() {
        let shutdown = Shutdown::new();
        let mut out = Vec::new();
        let failed = follow(
            source("{\"type\":\"error\",\"message\":\"no space left\"}\n"),
            &mut out,
            &shutdown,
        )
        .unwrap();
        assert_eq!(failed, StreamOutcome::Failed("no space left".into()));
        let closed = follow(source("just a line\n"), &mut out, &shutdown).unwrap();
        assert_eq!(closed, StreamOutcome::Closed);
    }

    struct Stalled;

    impl LineSource for Stalled {
        fn next_line(&mut self) -> io::Result<Option<String>> {
            thread::sleep(Duration::from_secs(30));
            Ok(None)
        }
    }

    #[test]
    fn cancellation_does_not_wait_for_the_network() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = follow(Box::new(Stalled), &mut Vec::new(), &shutdown).unwrap_err();
        assert!(matches!(err, CliError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
