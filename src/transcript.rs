//! Per-client transcript files.
//!
//! Each client address gets one append-only file holding one line per
//! received message: `[<RFC3339 timestamp>] <message>`.

use chrono::{DateTime, Local, SecondsFormat};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Append-only record of the messages received on one session.
#[derive(Debug)]
pub struct Transcript<W> {
    writer: W,
    entries: u64,
}

impl Transcript<File> {
    /// Open (or create) the transcript file for `ip` under `dir`.
    pub async fn open(dir: &Path, ip: IpAddr) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(transcript_path(dir, ip))
            .await?;
        Ok(Self::new(file))
    }
}

impl<W: AsyncWrite + Unpin> Transcript<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, entries: 0 }
    }

    /// Record one message. The entry is flushed before returning.
    pub async fn append(&mut self, at: DateTime<Local>, message: &str) -> io::Result<()> {
        let entry = format_entry(at, message);
        self.writer.write_all(entry.as_bytes()).await?;
        self.writer.flush().await?;
        self.entries += 1;
        Ok(())
    }

    /// Number of entries written so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }
}

/// Transcript file location for a client address. Colons (IPv6) become
/// underscores so the name is safe on every filesystem.
pub fn transcript_path(dir: &Path, ip: IpAddr) -> PathBuf {
    dir.join(format!("{}.log", ip.to_string().replace(':', "_")))
}

fn format_entry(at: DateTime<Local>, message: &str) -> String {
    format!("[{}] {message}\n", at.to_rfc3339_opts(SecondsFormat::Secs, true))
}
