//! Configuration files and profiler tool path resolution.
//!
//! Two `key=value` files are read in order (system-wide, then local), the
//! later overriding the earlier. `#` starts a comment, blank lines are
//! ignored, anything else that is not `key = value` is a fatal syntax
//! error. A missing file is only logged.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};

use crate::errors::SessionError;

/// Fallback system-wide config location.
pub const DEFAULT_SYSTEM_CONFIG: &str = "/etc/adaptyst.conf";

/// Fallback location of the processing scripts shipped with the tool.
pub const DEFAULT_SCRIPT_DIR: &str = "/usr/share/adaptyst/scripts";

/// Parse one config file into ordered `(key, value)` pairs.
pub fn parse_entries(text: &str, origin: &str) -> Result<Vec<(String, String)>, SessionError> {
    let line_re = Regex::new(r"^(\S+)\s*=\s*(.+)$").unwrap();
    let mut entries = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line_re.captures(line) {
            Some(caps) => entries.push((caps[1].to_string(), caps[2].to_string())),
            None => {
                return Err(SessionError::User(format!(
                    "syntax error in line {} of {}",
                    idx + 1,
                    origin
                )))
            }
        }
    }

    Ok(entries)
}

/// Inverse of [`parse_entries`] modulo comments and whitespace around `=`.
pub fn render_entries(entries: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Merged view of the system and local config files.
#[derive(Debug, Default)]
pub struct Config {
    entries: HashMap<String, String>,
    local_path: PathBuf,
}

impl Config {
    /// Read the system config, then the local one, later keys overriding.
    /// Paths come from `ADAPTYST_CONFIG` / `ADAPTYST_LOCAL_CONFIG` when set.
    pub fn load() -> Result<Config, SessionError> {
        let system_path = std::env::var("ADAPTYST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SYSTEM_CONFIG));
        let local_path = std::env::var("ADAPTYST_LOCAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
                Path::new(&home).join(".adaptyst").join("adaptyst.conf")
            });

        let mut config = Config {
            entries: HashMap::new(),
            local_path,
        };
        config.read_file(&system_path)?;
        let local = config.local_path.clone();
        config.read_file(&local)?;
        Ok(config)
    }

    fn read_file(&mut self, path: &Path) -> Result<(), SessionError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => {
                warn!("cannot open or find {}, ignoring", path.display());
                return Ok(());
            }
        };
        for (key, value) in parse_entries(&text, &path.display().to_string())? {
            self.entries.insert(key, value);
        }
        debug!("read config file {}", path.display());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Where the local config lives; mentioned in error hints.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    #[cfg(test)]
    pub fn from_entries(entries: &[(&str, &str)]) -> Config {
        Config {
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            local_path: PathBuf::from("/dev/null"),
        }
    }
}

/// Resolved locations of the patched `perf` installation and the processing
/// scripts.
#[derive(Debug, Clone)]
pub struct PerfPaths {
    /// The `perf` binary itself.
    pub perf_bin: PathBuf,
    /// perf's Python trace helper library, needed by `perf script`.
    pub trace_lib: PathBuf,
    /// Directory with the tool's own processing scripts.
    pub script_dir: PathBuf,
}

impl PerfPaths {
    /// Validate `perf_path` from the config: `bin/perf` must resolve (via
    /// symlinks) to a regular file and the Perf-Trace-Util library to a
    /// directory. The script directory honors `ADAPTYST_SCRIPT_DIR`.
    pub fn resolve(config: &Config) -> Result<PerfPaths, SessionError> {
        let perf_path = config.get("perf_path").ok_or_else(|| {
            SessionError::Env(format!(
                "perf_path is not set; put the path to your patched perf installation in {} \
                 or {}",
                config.local_path().display(),
                DEFAULT_SYSTEM_CONFIG
            ))
        })?;

        let perf_path = Path::new(perf_path);
        let perf_bin = perf_path.join("bin").join("perf");
        let trace_lib = perf_path
            .join("libexec")
            .join("perf-core")
            .join("scripts")
            .join("python")
            .join("Perf-Trace-Util")
            .join("lib")
            .join("Perf")
            .join("Trace");

        let canonical_bin = fs::canonicalize(&perf_bin).map_err(|_| {
            SessionError::Env(format!(
                "{} does not exist; verify perf_path in your config file",
                perf_bin.display()
            ))
        })?;
        if !canonical_bin.is_file() {
            return Err(SessionError::Env(format!(
                "{} does not point to a regular file; verify perf_path in your config file",
                perf_bin.display()
            )));
        }

        let canonical_lib = fs::canonicalize(&trace_lib).map_err(|_| {
            SessionError::Env(format!(
                "{} does not exist; verify perf_path in your config file",
                trace_lib.display()
            ))
        })?;
        if !canonical_lib.is_dir() {
            return Err(SessionError::Env(format!(
                "{} does not point to a directory; verify perf_path in your config file",
                trace_lib.display()
            )));
        }

        let script_dir = std::env::var("ADAPTYST_SCRIPT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SCRIPT_DIR));

        Ok(PerfPaths {
            perf_bin,
            trace_lib,
            script_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_parse_basic() {
        let text = "# comment\nperf_path=/opt/perf\n\ncarm_tool_path = /opt/carm\n";
        let entries = parse_entries(text, "test").unwrap();
        assert_eq!(
            entries,
            vec![
                ("perf_path".to_string(), "/opt/perf".to_string()),
                ("carm_tool_path".to_string(), "/opt/carm".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_syntax_error() {
        let result = parse_entries("perf_path\n", "test");
        assert!(matches!(result, Err(SessionError::User(_))));
    }

    #[test]
    fn test_render_round_trip() {
        let entries = vec![
            ("perf_path".to_string(), "/opt/perf".to_string()),
            ("roofline_benchmark_path".to_string(), "/data/r.csv".to_string()),
        ];
        let reparsed = parse_entries(&render_entries(&entries), "test").unwrap();
        assert_eq!(entries, reparsed);
    }

    fn fake_perf_install(dir: &Path) {
        let bin = dir.join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("perf"), b"#!/bin/true\n").unwrap();
        fs::create_dir_all(
            dir.join("libexec/perf-core/scripts/python/Perf-Trace-Util/lib/Perf/Trace"),
        )
        .unwrap();
    }

    #[test]
    fn test_resolve_perf_paths() {
        let dir = TempDir::new().unwrap();
        fake_perf_install(dir.path());
        let config =
            Config::from_entries(&[("perf_path", dir.path().to_str().unwrap())]);
        let paths = PerfPaths::resolve(&config).unwrap();
        assert!(paths.perf_bin.ends_with("bin/perf"));
        assert!(paths.trace_lib.ends_with("Perf/Trace"));
    }

    #[test]
    fn test_resolve_missing_perf_path() {
        let config = Config::from_entries(&[]);
        assert!(matches!(
            PerfPaths::resolve(&config),
            Err(SessionError::Env(_))
        ));
    }

    #[test]
    fn test_resolve_missing_binary() {
        let dir = TempDir::new().unwrap();
        let config =
            Config::from_entries(&[("perf_path", dir.path().to_str().unwrap())]);
        assert!(matches!(
            PerfPaths::resolve(&config),
            Err(SessionError::Env(_))
        ));
    }

    #[test]
    fn test_resolve_follows_symlinks() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        fake_perf_install(&real);
        let link = dir.path().join("link");
        symlink(&real, &link).unwrap();
        let config = Config::from_entries(&[("perf_path", link.to_str().unwrap())]);
        assert!(PerfPaths::resolve(&config).is_ok());
    }
}
