//! Runtime configuration types.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime configuration for compiling and running stax programs.
///
/// Every field is optional in a TOML file; missing ones take the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Free words appended after the image at load time
    pub heap_words: usize,
    /// Maximum operand stack depth
    pub stack_limit: usize,
    /// Largest memory, in words, a `resize` system call may grow to
    pub max_memory_words: usize,
    /// Record an execution trace
    pub trace: bool,
    /// Maximum number of trace entries kept
    pub trace_limit: usize,
    /// Log loader, exit and fault events
    pub trace_vm: bool,
    /// Log every system call
    pub trace_syscalls: bool,
    /// Log code generation summaries
    pub trace_codegen: bool,
    /// Directory relative file names are resolved against (None = current dir)
    pub base_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_words: 1 << 16,
            stack_limit: 1 << 16,
            max_memory_words: 1 << 24,
            trace: false,
            trace_limit: 100_000,
            trace_vm: false,
            trace_syscalls: false,
            trace_codegen: false,
            base_dir: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml(&content)
    }

    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = RuntimeConfig::from_toml("heap_words = 128\ntrace_syscalls = true\n").unwrap();
        assert_eq!(config.heap_words, 128);
        assert!(config.trace_syscalls);
        assert_eq!(config.stack_limit, RuntimeConfig::default().stack_limit);
        assert_eq!(config.base_dir(), PathBuf::from("."));
    }

    #[test]
    fn test_memory_limit() {
        assert_eq!(RuntimeConfig::default().max_memory_words, 1 << 24);
        let config = RuntimeConfig::from_toml("max_memory_words = 4096\n").unwrap();
        assert_eq!(config.max_memory_words, 4096);
    }

    #[test]
    fn test_invalid_file() {
        assert!(RuntimeConfig::from_toml("heap_words = \"lots\"").is_err());
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stax.toml");
        fs::write(&path, "base_dir = \"/tmp\"\n").unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.base_dir(), PathBuf::from("/tmp"));
    }
}
