//! Per-batch Hands transcript: `{ts, stream, line}` JSONL, flushed on every
//! line (spec.md §6 "Transcript line format").

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
    Meta,
}

#[derive(Debug, Serialize)]
struct TranscriptLine<'a> {
    ts: String,
    stream: &'a str,
    line: &'a str,
}

pub struct TranscriptWriter {
    path: PathBuf,
}

impl TranscriptWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // Touch the file so it exists even if the child is killed before any line arrives.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to create transcript {}", path.display()))?;
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&self, stream: Stream, line: &str) -> Result<()> {
        let stream_str = match stream {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::Meta => "meta",
        };
        let record = TranscriptLine {
            ts: crate::ids::now_rfc3339(),
            stream: stream_str,
            line,
        };
        let serialized = serde_json::to_string(&record).context("failed to serialize transcript line")?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open transcript {}", self.path.display()))?;
        writeln!(file, "{serialized}").context("failed to write transcript line")?;
        file.flush().context("failed to flush transcript")?;
        Ok(())
    }

    pub fn meta(&self, note: &str) -> Result<()> {
        self.write_line(Stream::Meta, note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_touches_file_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        let _writer = TranscriptWriter::create(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn write_line_appends_jsonl_with_stream_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        let writer = TranscriptWriter::create(&path).unwrap();
        writer.write_line(Stream::Stdout, "hello").unwrap();
        writer.meta("mi.interrupt.sent=SIGINT").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["stream"], "stdout");
        assert_eq!(first["line"], "hello");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["stream"], "meta");
    }
}
