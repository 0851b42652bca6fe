//! Process resource probe backed by procfs.

use chrono::Utc;
use multidb_models::{MemoryUsage, ResourceReport};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{field} field missing in {path}")]
    MissingField { field: &'static str, path: PathBuf },

    #[error("Invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ResourceProbe {
    threshold_pct: f64,
    ceiling_mb: Option<u64>,
    status_path: PathBuf,
    meminfo_path: PathBuf,
}

impl ResourceProbe {
    pub fn new(threshold_pct: f64, ceiling_mb: Option<u64>) -> Self {
        Self {
            threshold_pct,
            ceiling_mb,
            status_path: PathBuf::from("/proc/self/status"),
            meminfo_path: PathBuf::from("/proc/meminfo"),
        }
    }

    /// Read from alternative proc files
    pub fn with_paths(mut self, status_path: impl Into<PathBuf>, meminfo_path: impl Into<PathBuf>) -> Self {
        self.status_path = status_path.into();
        self.meminfo_path = meminfo_path.into();
        self
    }

    pub fn threshold_pct(&self) -> f64 {
        self.threshold_pct
    }

    pub fn sample(&self) -> ResourceReport {
        let timestamp = Utc::now().timestamp_millis();

        match self.read() {
            Ok((memory, threads)) => {
                let healthy = memory.usage_pct < self.threshold_pct;
                if !healthy {
                    tracing::warn!(
                        "Memory usage {:.1}% ({} of {} MB) exceeds {:.0}%",
                        memory.usage_pct,
                        memory.used_mb,
                        memory.ceiling_mb,
                        self.threshold_pct
                    );
                }
                ResourceReport {
                    healthy,
                    memory: Some(memory),
                    threads: Some(threads),
                    threshold_pct: self.threshold_pct,
                    error: None,
                    timestamp,
                }
            }
            Err(e) => {
                tracing::warn!("System resource probe failed: {}", e);
                ResourceReport {
                    healthy: false,
                    memory: None,
                    threads: None,
                    threshold_pct: self.threshold_pct,
                    error: Some(e.to_string()),
                    timestamp,
                }
            }
        }
    }

    fn read(&self) -> Result<(MemoryUsage, u64), ResourceError> {
        let status = read_file(&self.status_path)?;
        let used_kb = parse_kb_field(&status, "VmRSS", &self.status_path)?;
        let threads = parse_u64(
            "Threads",
            first_value(&status, "Threads").ok_or_else(|| ResourceError::MissingField {
                field: "Threads",
                path: self.status_path.clone(),
            })?,
        )?;

        let ceiling_kb = match self.ceiling_mb {
            Some(mb) => mb * 1024,
            None => {
                let meminfo = read_file(&self.meminfo_path)?;
                parse_kb_field(&meminfo, "MemTotal", &self.meminfo_path)?
            }
        };

        let usage_pct = if ceiling_kb == 0 {
            100.0
        } else {
            used_kb as f64 / ceiling_kb as f64 * 100.0
        };

        Ok((
            MemoryUsage {
                used_mb: used_kb / 1024,
                ceiling_mb: ceiling_kb / 1024,
                usage_pct,
            },
            threads,
        ))
    }
}

fn read_file(path: &Path) -> Result<String, ResourceError> {
    fs::read_to_string(path).map_err(|source| ResourceError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn first_value<'a>(contents: &'a str, field: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != field {
            return None;
        }
        rest.split_whitespace().next()
    })
}

fn parse_kb_field(contents: &str, field: &'static str, path: &Path) -> Result<u64, ResourceError> {
    let value = first_value(contents, field).ok_or_else(|| ResourceError::MissingField {
        field,
        path: path.to_path_buf(),
    })?;
    parse_u64(field, value)
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ResourceError> {
    value.parse().map_err(|_| ResourceError::InvalidValue {
        field,
        value: value.to_string(),
    })
}
