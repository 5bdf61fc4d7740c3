//! Append-only JSONL audit log of every gated command.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::diagnostics::CommandRecord;

pub const COMMAND_LOG_FILE_NAME: &str = "commands.jsonl";

/// Single-writer JSONL log; each record is flushed as soon as it is appended.
#[derive(Debug)]
pub struct CommandLog {
    path: PathBuf,
    file: File,
}

impl CommandLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create command log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open command log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &CommandRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize command record")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("append command log {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("flush command log {}", self.path.display()))?;
        Ok(())
    }
}

/// Read every record back, in order.
pub fn read_command_log(path: &Path) -> Result<Vec<CommandRecord>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}
