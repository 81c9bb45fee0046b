//! Non-blocking tail of a log file another process appends to.

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Holds a cursor into a growing log file and returns newly appended
/// complete lines on each read; a partial (unterminated) trailing line is
/// held back until the writer finishes it.
#[derive(Debug)]
pub struct LogTail {
    file: File,
    partial: Vec<u8>,
}

impl LogTail {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            partial: Vec::new(),
        })
    }

    /// Reads whatever the writer has appended since the previous call and
    /// returns the complete lines in it, trimmed and with empty lines
    /// dropped. Never blocks waiting for more output.
    pub fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        self.file.read_to_end(&mut self.partial)?;

        let mut lines = Vec::new();
        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_returns_only_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.log");
        let mut writer = File::create(&path).unwrap();
        let mut tail = LogTail::open(&path).unwrap();

        writer.write_all(b"first line\nsecond li").unwrap();
        assert_eq!(tail.read_new_lines().unwrap(), vec!["first line"]);

        // The held partial is completed by the next write.
        writer.write_all(b"ne\nthird line\n").unwrap();
        assert_eq!(
            tail.read_new_lines().unwrap(),
            vec!["second line", "third line"]
        );

        // Nothing new appended.
        assert!(tail.read_new_lines().unwrap().is_empty());
    }

    #[test]
    fn test_blank_lines_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.log");
        let mut writer = File::create(&path).unwrap();
        let mut tail = LogTail::open(&path).unwrap();

        writer.write_all(b"\n\n  \nreal content\n").unwrap();
        assert_eq!(tail.read_new_lines().unwrap(), vec!["real content"]);
    }
}
