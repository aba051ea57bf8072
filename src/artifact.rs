//! Incremental artifact writer.
//!
//! The file is created on the first message, so a job that captured nothing
//! leaves no artifact behind. Every message is flushed as soon as it is
//! written, which keeps the partial result of a stopped job on disk.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::jobs::state::OutputFormat;
use crate::source::ChatMessage;

const CSV_HEADER: &str = "timestamp,author,message\n";

/// Writes chat messages to a job's artifact in its output format.
#[derive(Debug)]
pub struct ArtifactWriter {
    path: PathBuf,
    format: OutputFormat,
    file: Option<BufWriter<File>>,
    written: u64,
}

impl ArtifactWriter {
    pub fn new(path: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            path: path.into(),
            format,
            file: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Messages written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append one message and flush it.
    pub async fn write(&mut self, msg: &ChatMessage) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = BufWriter::new(File::create(&self.path).await?);
            match self.format {
                OutputFormat::Json => file.write_all(b"[\n").await?,
                OutputFormat::Csv => file.write_all(CSV_HEADER.as_bytes()).await?,
                OutputFormat::Jsonl | OutputFormat::Txt => {}
            }
            self.file = Some(file);
        }

        let record = encode(self.format, msg, self.written == 0)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(record.as_bytes()).await?;
            file.flush().await?;
        }
        self.written += 1;
        Ok(())
    }

    /// Close the artifact. Safe to call more than once, and when nothing was written.
    pub async fn finish(&mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            if self.format == OutputFormat::Json {
                file.write_all(b"\n]\n").await?;
            }
            file.flush().await?;
            file.into_inner().sync_all().await?;
        }
        Ok(())
    }
}

fn encode(format: OutputFormat, msg: &ChatMessage, first: bool) -> std::io::Result<String> {
    let line = match format {
        OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(msg)?),
        OutputFormat::Json => {
            let sep = if first { "" } else { ",\n" };
            format!("{sep}{}", serde_json::to_string(msg)?)
        }
        OutputFormat::Csv => format!(
            "{},{},{}\n",
            msg.timestamp.to_rfc3339(),
            escape_csv_field(&msg.author),
            escape_csv_field(&msg.message)
        ),
        OutputFormat::Txt => format!(
            "[{}] {}: {}\n",
            msg.timestamp.format("%Y-%m-%d %H:%M:%S"),
            msg.author,
            msg.message.replace('\n', " ")
        ),
    };
    Ok(line)
}

/// RFC 4180 escaping: quote fields containing separators, quotes or newlines.
fn escape_csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
