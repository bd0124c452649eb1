//! Append-only JSONL file writer, one file per node per day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::JsonLogEntry;

/// Appends log entries to `logs/<date>_<node>.jsonl`
pub struct NodeLogWriter {
    node: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl NodeLogWriter {
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> std::io::Result<Self> {
        let node = node.into();
        let logs_dir = logs_dir.as_ref();
        fs::create_dir_all(logs_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{}_{}.jsonl", date, node));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            node,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one entry as a line and flush.
    pub fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for NodeLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every entry from the JSONL files in `logs_dir`, oldest first.
///
/// Unparseable lines are skipped.
pub fn read_all_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<JsonLogEntry>> {
    let logs_dir = logs_dir.as_ref();
    if !logs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(logs_dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
            let content = fs::read_to_string(&path)?;
            entries.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .filter_map(|line| JsonLogEntry::from_json_line(line).ok()),
            );
        }
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_creates_file_named_after_node() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let writer = NodeLogWriter::new(&logs_dir, "00000000000000aa").unwrap();

        assert!(writer.path().exists());
        assert!(writer
            .path()
            .to_string_lossy()
            .ends_with("_00000000000000aa.jsonl"));
    }

    #[test]
    fn test_read_all_entries_merges_nodes() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let a = NodeLogWriter::new(&logs_dir, "a").unwrap();
        let b = NodeLogWriter::new(&logs_dir, "b").unwrap();
        a.write(&JsonLogEntry::new("info", "a", "t", "from a")).unwrap();
        b.write(&JsonLogEntry::new("info", "b", "t", "from b")).unwrap();
        drop(a);
        drop(b);

        let entries = read_all_entries(&logs_dir).unwrap();
        assert_eq!(entries.len(), 2);
        let nodes: Vec<_> = entries.iter().map(|e| e.node.as_str()).collect();
        assert!(nodes.contains(&"a"));
        assert!(nodes.contains(&"b"));
    }
}
