use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const LOG_FILENAME: &str = "upload_log.csv";

const CSV_HEADERS: [&str; 5] = ["Prompt", "Style", "Size", "Filename", "Drive URL"];

/// One provenance row per successfully uploaded artifact. Column names
/// match the CSV the run publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "Prompt")]
    pub prompt: String,
    #[serde(rename = "Style")]
    pub style: String,
    #[serde(rename = "Size")]
    pub size: String,
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "Drive URL")]
    pub remote_url: String,
}

/// Append-only run log; insertion order is processing order. Failed
/// items never appear here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLog {
    entries: Vec<LogEntry>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_csv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        if self.entries.is_empty() {
            // serde-driven writers only emit headers alongside a record.
            writer
                .write_record(CSV_HEADERS)
                .context("failed writing log headers")?;
        }
        for entry in &self.entries {
            writer
                .serialize(entry)
                .context("failed serializing log entry")?;
        }
        writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("failed flushing log csv: {err}"))
    }

    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_csv_bytes()?)
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{LogEntry, RunLog};

    fn entry(prompt: &str, filename: &str) -> LogEntry {
        LogEntry {
            prompt: prompt.to_string(),
            style: "watercolor".to_string(),
            size: "512x512".to_string(),
            filename: filename.to_string(),
            remote_url: format!("https://drive.google.com/uc?id={filename}"),
        }
    }

    #[test]
    fn csv_uses_published_headers() -> anyhow::Result<()> {
        let mut log = RunLog::new();
        log.append(entry("a cat", "image_1.png"));

        let raw = String::from_utf8(log.to_csv_bytes()?)?;
        let mut lines = raw.lines();
        assert_eq!(
            lines.next(),
            Some("Prompt,Style,Size,Filename,Drive URL")
        );
        assert_eq!(
            lines.next(),
            Some("a cat,watercolor,512x512,image_1.png,https://drive.google.com/uc?id=image_1.png")
        );
        assert_eq!(lines.next(), None);
        Ok(())
    }

    #[test]
    fn empty_log_still_writes_headers() -> anyhow::Result<()> {
        let raw = String::from_utf8(RunLog::new().to_csv_bytes()?)?;
        assert_eq!(raw.trim_end(), "Prompt,Style,Size,Filename,Drive URL");
        Ok(())
    }

    #[test]
    fn entries_keep_insertion_order() {
        let mut log = RunLog::new();
        log.append(entry("first", "image_1.png"));
        log.append(entry("second", "image_3.png"));

        let filenames: Vec<&str> = log
            .entries()
            .iter()
            .map(|row| row.filename.as_str())
            .collect();
        assert_eq!(filenames, vec!["image_1.png", "image_3.png"]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn write_csv_creates_parent_dirs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("upload_log.csv");
        let mut log = RunLog::new();
        log.append(entry("a cat", "image_1.png"));
        log.write_csv(&path)?;

        let raw = std::fs::read_to_string(&path)?;
        assert!(raw.starts_with("Prompt,Style,Size,Filename,Drive URL"));
        Ok(())
    }
}
