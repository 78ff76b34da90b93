use std::fmt::Write as _;
use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::Serialize;

pub use livekit_loadtester::report::trim_decimal;

/// Plain-text table with left-aligned, width-fitted columns.
#[derive(Debug, Clone, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row<I, S>(&mut self, cells: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut row: Vec<String> = cells.into_iter().map(Into::into).collect();
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (idx, cell) in row.iter().enumerate() {
                widths[idx] = widths[idx].max(cell.chars().count());
            }
        }
        let mut out = String::new();
        let mut line = |cells: &[String]| {
            let mut text = String::new();
            for (idx, cell) in cells.iter().enumerate() {
                if idx > 0 {
                    text.push_str("  ");
                }
                let pad = widths[idx] - cell.chars().count();
                text.push_str(cell);
                text.extend(std::iter::repeat_n(' ', pad));
            }
            let _ = writeln!(out, "{}", text.trim_end());
        };
        line(&self.headers);
        for row in &self.rows {
            line(row);
        }
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to encode JSON output")?;
    println!("{body}");
    Ok(())
}

/// Replace every `{.}` with a short random hex suffix, e.g. `caller-{.}`.
pub fn expand_template(template: &str) -> String {
    if !template.contains("{.}") {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len() + 8);
    let mut rest = template;
    while let Some(pos) = rest.find("{.}") {
        out.push_str(&rest[..pos]);
        let mut bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut bytes);
        out.push_str(&hex::encode(bytes));
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    out
}

pub fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Frames drawn on stderr while a blocking call runs. Silent when stderr is
/// not a terminal so logs and piped output stay clean.
pub struct Spinner {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    pub fn start(message: impl Into<String>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let message = message.into();
        let handle = io::stderr().is_terminal().then(|| {
            let running = running.clone();
            std::thread::spawn(move || {
                const FRAMES: [char; 4] = ['|', '/', '-', '\\'];
                let mut idx = 0;
                while running.load(Ordering::Relaxed) {
                    eprint!("\r{} {message}", FRAMES[idx % FRAMES.len()]);
                    let _ = io::stderr().flush();
                    idx += 1;
                    std::thread::sleep(Duration::from_millis(120));
                }
                eprint!("\r\x1b[2K");
                let _ = io::stderr().flush();
            })
        });
        Self { running, handle }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_pads_columns() {
        let mut table = Table::new(["Name", "Status"]);
        table.row(["support-agent", "Running"]);
        table.row(["x", "Failed"]);
        let rendered = table.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Name           Status");
        assert_eq!(lines[1], "support-agent  Running");
        assert_eq!(lines[2], "x              Failed");
    }

    #[test]
    fn short_rows_are_padded() {
        let mut table = Table::new(["A", "B", "C"]);
        table.row(["1"]);
        assert_eq!(table.rows()[0].len(), 3);
    }

    #[test]
    fn template_expands_each_placeholder() {
        let out = expand_template("caller-{.}-{.}");
        let parts: Vec<&str> = out.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(expand_template("plain"), "plain");
    }
}
