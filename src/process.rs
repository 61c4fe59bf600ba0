//! Process inspection through procfs
//!
//! Each field is read independently so a process that exits halfway
//! through inspection still yields whatever was readable.

use crate::error::{Result, WatchError};
use std::fs;
use std::path::PathBuf;

/// Reads identity fields of a live process
pub trait ProcessInspector: Send + Sync {
    fn name(&self, pid: u32) -> Result<String>;

    fn parent(&self, pid: u32) -> Result<u32>;

    fn cmdline(&self, pid: u32) -> Result<String>;

    /// Pids of every process whose name equals `name`
    fn find_by_name(&self, name: &str) -> Vec<u32>;
}

/// `ProcessInspector` over a procfs mount
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, pid: u32, file: &str) -> Result<String> {
        fs::read_to_string(self.root.join(pid.to_string()).join(file)).map_err(|e| {
            WatchError::ProcessInspection {
                pid,
                reason: format!("{}: {}", file, e),
            }
        })
    }

    /// Numeric entries of the procfs root
    pub fn list_pids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect()
    }
}

impl ProcessInspector for ProcFs {
    fn name(&self, pid: u32) -> Result<String> {
        Ok(self.read(pid, "comm")?.trim_end().to_string())
    }

    fn parent(&self, pid: u32) -> Result<u32> {
        let stat = self.read(pid, "stat")?;
        parse_stat_ppid(&stat).ok_or_else(|| WatchError::ProcessInspection {
            pid,
            reason: "malformed stat".to_string(),
        })
    }

    fn cmdline(&self, pid: u32) -> Result<String> {
        let raw = self.read(pid, "cmdline")?;
        Ok(raw.replace('\0', " ").trim().to_string())
    }

    fn find_by_name(&self, name: &str) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .list_pids()
            .into_iter()
            .filter(|pid| self.name(*pid).map(|n| n == name).unwrap_or(false))
            .collect();
        pids.sort_unstable();
        pids
    }
}

/// Parent pid from `/proc/<pid>/stat`
///
/// The command name is wrapped in parens and may itself contain spaces or
/// parens, so fields are counted from the last ')'.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let close = stat.rfind(')')?;
    let mut fields = stat.get(close + 1..)?.split_whitespace();
    // state, ppid
    fields.nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_proc(root: &std::path::Path, pid: u32, comm: &str, stat: &str, cmdline: &[u8]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{}\n", comm)).unwrap();
        fs::write(dir.join("stat"), stat).unwrap();
        fs::write(dir.join("cmdline"), cmdline).unwrap();
    }

    #[test]
    fn test_parse_stat_ppid() {
        assert_eq!(parse_stat_ppid("42 (bash) S 7 42 42 0 -1"), Some(7));
        assert_eq!(parse_stat_ppid("42 (my (odd) proc) R 99 1 1"), Some(99));
        assert_eq!(parse_stat_ppid("42 bash"), None);
        assert_eq!(parse_stat_ppid("42 (bash) S"), None);
    }

    #[test]
    fn test_procfs_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(
            dir.path(),
            100,
            "xmrig",
            "100 (xmrig) S 1 100 100 0",
            b"xmrig\0--url\0stratum+tcp://pool:3333\0",
        );
        let procfs = ProcFs::new(dir.path());

        assert_eq!(procfs.name(100).unwrap(), "xmrig");
        assert_eq!(procfs.parent(100).unwrap(), 1);
        assert_eq!(
            procfs.cmdline(100).unwrap(),
            "xmrig --url stratum+tcp://pool:3333"
        );
    }

    #[test]
    fn test_fields_fail_independently() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("5");
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(proc_dir.join("comm"), "sleep\n").unwrap();
        let procfs = ProcFs::new(dir.path());

        assert_eq!(procfs.name(5).unwrap(), "sleep");
        assert!(matches!(
            procfs.parent(5),
            Err(WatchError::ProcessInspection { pid: 5, .. })
        ));
        assert!(procfs.cmdline(5).is_err());
        assert!(procfs.name(6).is_err());
    }

    #[test]
    fn test_find_by_name() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), 30, "containerd", "30 (containerd) S 1", b"");
        write_proc(dir.path(), 12, "containerd", "12 (containerd) S 1", b"");
        write_proc(dir.path(), 20, "kubelet", "20 (kubelet) S 1", b"");
        fs::create_dir_all(dir.path().join("self")).unwrap();
        let procfs = ProcFs::new(dir.path());

        assert_eq!(procfs.find_by_name("containerd"), vec![12, 30]);
        assert_eq!(procfs.find_by_name("kubelet"), vec![20]);
        assert!(procfs.find_by_name("falcon-sensor").is_empty());
        assert_eq!(procfs.list_pids().len(), 3);
    }
}
