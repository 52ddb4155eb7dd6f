//! Compilation settings: isolation mode, worker heap, pool sizing and the
//! batch deadline. Deserialized from the batch manifest's `settings` block;
//! individual fields can be overridden from the command line.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::boundary::BoundaryPolicy;

/// Where compilations execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Compile on worker threads inside the calling process.
    InProcess,
    /// Compile inside long-lived forked worker processes with their own
    /// heap limit. Stronger isolation, higher startup cost, amortized by
    /// context reuse.
    Forked,
}

/// A maximum heap size parsed from strings like `512M` or `2G`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HeapSize(u64);

impl HeapSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl std::str::FromStr for HeapSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("empty heap size".to_string());
        }
        let (digits, multiplier) = match trimmed.chars().last() {
            Some('K') | Some('k') => (&trimmed[..trimmed.len() - 1], 1024u64),
            Some('M') | Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
            Some('G') | Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
            _ => (trimmed, 1),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid heap size `{s}`"))?;
        value
            .checked_mul(multiplier)
            .map(HeapSize)
            .ok_or_else(|| format!("heap size `{s}` overflows"))
    }
}

impl fmt::Display for HeapSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const GIB: u64 = 1024 * 1024 * 1024;
        const MIB: u64 = 1024 * 1024;
        const KIB: u64 = 1024;
        if self.0 % GIB == 0 {
            write!(f, "{}G", self.0 / GIB)
        } else if self.0 % MIB == 0 {
            write!(f, "{}M", self.0 / MIB)
        } else if self.0 % KIB == 0 {
            write!(f, "{}K", self.0 / KIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl TryFrom<String> for HeapSize {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HeapSize> for String {
    fn from(value: HeapSize) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileSettings {
    #[serde(default = "default_isolation")]
    pub isolation: IsolationMode,
    /// Heap cap for forked workers. Ignored in in-process mode.
    #[serde(default = "default_max_heap")]
    pub max_heap: Option<HeapSize>,
    /// Worker pool cap. Defaults to the number of logical CPUs; the pool is
    /// never larger than the batch.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Deadline for a whole batch, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "BoundaryPolicy::default")]
    pub boundary: BoundaryPolicy,
    /// Compile every script even when the caller marked it unchanged.
    #[serde(default)]
    pub force: bool,
}

fn default_isolation() -> IsolationMode {
    IsolationMode::Forked
}

fn default_max_heap() -> Option<HeapSize> {
    Some(HeapSize(512 * 1024 * 1024))
}

fn default_timeout_secs() -> u64 {
    5
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            isolation: default_isolation(),
            max_heap: default_max_heap(),
            workers: None,
            timeout_secs: default_timeout_secs(),
            boundary: BoundaryPolicy::default(),
            force: false,
        }
    }
}

impl CompileSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Pool size for a batch of `batch_len` scripts.
    pub fn worker_count(&self, batch_len: usize) -> usize {
        let cap = self.workers.unwrap_or_else(num_cpus::get).max(1);
        cap.min(batch_len).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_heap_size_suffixes() {
        assert_eq!("512M".parse::<HeapSize>().unwrap().bytes(), 512 << 20);
        assert_eq!("2G".parse::<HeapSize>().unwrap().bytes(), 2 << 30);
        assert_eq!("64k".parse::<HeapSize>().unwrap().bytes(), 64 << 10);
        assert_eq!("1000".parse::<HeapSize>().unwrap().bytes(), 1000);
    }

    #[test]
    fn rejects_malformed_heap_sizes() {
        assert!("".parse::<HeapSize>().is_err());
        assert!("12Q".parse::<HeapSize>().is_err());
        assert!("G".parse::<HeapSize>().is_err());
    }

    #[test]
    fn heap_size_display_round_trips() {
        for input in ["512M", "2G", "64K"] {
            let parsed: HeapSize = input.parse().unwrap();
            assert_eq!(parsed.to_string(), input);
        }
    }

    #[test]
    fn settings_defaults_match_manifest_omissions() {
        let settings: CompileSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.isolation, IsolationMode::Forked);
        assert_eq!(settings.max_heap.unwrap().bytes(), 512 << 20);
        assert_eq!(settings.timeout_secs, 5);
        assert!(!settings.force);
    }

    #[test]
    fn worker_count_is_capped_by_batch_and_config() {
        let settings = CompileSettings {
            workers: Some(4),
            ..CompileSettings::default()
        };
        assert_eq!(settings.worker_count(2), 2);
        assert_eq!(settings.worker_count(16), 4);
        assert_eq!(settings.worker_count(0), 1);
    }
}
