use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {command}: {reason}")]
    Command { command: &'static str, reason: String },
    #[error("could not read {what}: {reason}")]
    Unreadable { what: &'static str, reason: String },
}

pub trait ResourceProbe {
    fn accelerator_present(&self) -> Result<bool, ProbeError>;

    fn available_accelerator_memory(&self) -> Result<u64, ProbeError>;

    fn available_host_memory(&self) -> Result<u64, ProbeError>;

    fn available_disk_space(&self) -> Result<u64, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct SystemProbe {
    storage_dir: PathBuf,
    accelerator: Option<usize>,
}

impl SystemProbe {
    pub fn new(storage_dir: impl Into<PathBuf>, accelerator: Option<usize>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            accelerator,
        }
    }

    fn query_gpu(&self, index: usize) -> Result<Option<(u64, u64)>, ProbeError> {
        let ordinal = index.to_string();
        let output = match Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.total,memory.used",
                "--format=csv,noheader,nounits",
                "-i",
                ordinal.as_str(),
            ])
            .output()
        {
            Ok(output) => output,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ProbeError::Command {
                    command: "nvidia-smi",
                    reason: err.to_string(),
                });
            }
        };
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_gpu_memory(&stdout).map(Some).ok_or_else(|| ProbeError::Unreadable {
            what: "nvidia-smi memory report",
            reason: stdout.trim().to_string(),
        })
    }
}

impl ResourceProbe for SystemProbe {
    fn accelerator_present(&self) -> Result<bool, ProbeError> {
        match self.accelerator {
            Some(index) => Ok(self.query_gpu(index)?.is_some()),
            None => Ok(false),
        }
    }

    fn available_accelerator_memory(&self) -> Result<u64, ProbeError> {
        let Some(index) = self.accelerator else {
            return Ok(0);
        };
        let Some((total, used)) = self.query_gpu(index)? else {
            return Ok(0);
        };
        let available = total.saturating_sub(used);
        debug!(index, total, used, available, "accelerator memory");
        Ok(available)
    }

    fn available_host_memory(&self) -> Result<u64, ProbeError> {
        let meminfo = fs::read_to_string("/proc/meminfo").map_err(|e| ProbeError::Unreadable {
            what: "/proc/meminfo",
            reason: e.to_string(),
        })?;
        parse_meminfo_available(&meminfo).ok_or_else(|| ProbeError::Unreadable {
            what: "/proc/meminfo",
            reason: "no MemAvailable entry".to_string(),
        })
    }

    fn available_disk_space(&self) -> Result<u64, ProbeError> {
        let target = existing_ancestor(&self.storage_dir);
        let output = Command::new("df")
            .arg("-Pk")
            .arg(&target)
            .output()
            .map_err(|e| ProbeError::Command {
                command: "df",
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ProbeError::Command {
                command: "df",
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let available = parse_df_available(&stdout).ok_or_else(|| ProbeError::Unreadable {
            what: "df output",
            reason: stdout.trim().to_string(),
        })?;
        debug!(path = %target.display(), available, "disk space");
        Ok(available)
    }
}

fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|candidate| !candidate.as_os_str().is_empty() && candidate.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_meminfo_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Available column of POSIX `df -Pk` output, in bytes.
fn parse_df_available(df: &str) -> Option<u64> {
    df.lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().nth(3))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn parse_gpu_memory(csv: &str) -> Option<(u64, u64)> {
    let line = csv.lines().next()?;
    let mut parts = line.split(',').map(|part| part.trim().parse::<u64>());
    let total = parts.next()?.ok()?;
    let used = parts.next()?.ok()?;
    Some((total * 1024 * 1024, used * 1024 * 1024))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_mem_available() {
        let meminfo = "MemTotal:       32768000 kB\nMemFree:         1024000 kB\nMemAvailable:   16384000 kB\n";
        assert_eq!(parse_meminfo_available(meminfo), Some(16_384_000 * 1024));
    }

    #[test]
    fn missing_mem_available_is_none() {
        assert_eq!(parse_meminfo_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn parses_posix_df() {
        let df = "Filesystem     1024-blocks      Used Available Capacity Mounted on\n/dev/nvme0n1p2   490617784 301862136 163759640      65% /\n";
        assert_eq!(parse_df_available(df), Some(163_759_640 * 1024));
    }

    #[test]
    fn df_without_rows_is_none() {
        assert_eq!(parse_df_available("Filesystem 1024-blocks Used Available\n"), None);
    }

    #[test]
    fn parses_nvidia_smi_row() {
        assert_eq!(
            parse_gpu_memory("24576, 1024\n"),
            Some((24_576 * 1024 * 1024, 1024 * 1024 * 1024))
        );
        assert_eq!(parse_gpu_memory("[N/A], 3\n"), None);
    }

    #[test]
    fn missing_storage_dir_resolves_to_existing_parent() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("hub").join("models--x");
        assert_eq!(existing_ancestor(&nested), dir.path());
    }

    #[test]
    fn cpu_probe_reports_no_accelerator() {
        let probe = SystemProbe::new(".", None);
        assert!(!probe.accelerator_present().unwrap());
        assert_eq!(probe.available_accelerator_memory().unwrap(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_counters_are_readable() {
        let dir = TempDir::new().unwrap();
        let probe = SystemProbe::new(dir.path().join("not-yet-created"), None);
        assert!(probe.available_host_memory().unwrap() > 0);
        assert!(probe.available_disk_space().unwrap() > 0);
    }
}
