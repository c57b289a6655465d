//! Process discovery under /proc.

use std::fs;
use std::path::{Path, PathBuf};

/// Process entry representing a directory in /proc filesystem.
#[derive(Debug, Clone)]
pub struct ProcEntry {
    pub pid: u32,
    pub proc_path: PathBuf,
}

/// Scans `root` for directories with numeric names.
pub fn collect_proc_entries(root: &Path) -> Vec<ProcEntry> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let p = entry.path();
            let name = match p.file_name().and_then(|s| s.to_str()) {
                Some(v) => v,
                None => continue,
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let pid: u32 = match name.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            out.push(ProcEntry { pid, proc_path: p });
        }
    }
    out
}

/// Reads process name from comm file or extracts from cmdline.
pub fn read_process_name(proc_path: &Path) -> Option<String> {
    if let Ok(s) = fs::read_to_string(proc_path.join("comm")) {
        let t = s.trim();
        if !t.is_empty() {
            return Some(t.into());
        }
    }

    let content = fs::read(proc_path.join("cmdline")).ok()?;
    let first = content.split(|&b| b == 0u8).next()?;
    let first = std::str::from_utf8(first).ok()?;
    Path::new(first)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_collect_proc_entries_numeric_only() {
        let dir = tempdir().expect("Failed to create temp dir");
        fs::create_dir(dir.path().join("1")).unwrap();
        fs::create_dir(dir.path().join("42")).unwrap();
        fs::create_dir(dir.path().join("self")).unwrap();
        fs::write(dir.path().join("uptime"), "1 1").unwrap();

        let mut pids: Vec<u32> = collect_proc_entries(dir.path())
            .into_iter()
            .map(|e| e.pid)
            .collect();
        pids.sort();
        assert_eq!(pids, vec![1, 42]);
    }

    #[test]
    fn test_read_process_name_prefers_comm() {
        let dir = tempdir().expect("Failed to create temp dir");
        fs::write(dir.path().join("comm"), "nginx\n").unwrap();
        fs::write(dir.path().join("cmdline"), b"/usr/sbin/other\0-g\0").unwrap();
        assert_eq!(read_process_name(dir.path()).as_deref(), Some("nginx"));
    }

    #[test]
    fn test_read_process_name_falls_back_to_cmdline() {
        let dir = tempdir().expect("Failed to create temp dir");
        fs::write(dir.path().join("cmdline"), b"/usr/bin/python3\0app.py\0").unwrap();
        assert_eq!(read_process_name(dir.path()).as_deref(), Some("python3"));
    }

    #[test]
    fn test_read_process_name_missing() {
        let dir = tempdir().expect("Failed to create temp dir");
        assert_eq!(read_process_name(dir.path()), None);
    }
}
