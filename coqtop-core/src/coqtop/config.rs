//! Launch configuration for the verifier subprocess.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a coqtop session.
#[derive(Debug, Clone)]
pub struct CoqtopConfig {
    /// Path to `coqtop`. If None, looked up in PATH and common install
    /// locations.
    pub binary_path: Option<String>,

    /// `(physical directory, logical prefix)` pairs passed as `-R`.
    pub include_paths: Vec<(String, String)>,

    /// Working directory of the subprocess.
    pub working_dir: Option<PathBuf>,

    /// Extra arguments appended after the protocol flags.
    pub extra_args: Vec<String>,

    /// Capacity of the request queue; submissions block when it is full.
    pub queue_capacity: usize,

    /// Incomplete-reply parse attempts tolerated before giving up.
    pub max_decode_retries: usize,

    /// How long a commit answered without a state id waits for the value
    /// that carries one, when the verifier sends them as separate writes.
    pub split_reply_grace: Duration,

    /// Whether to log raw wire traffic.
    pub verbose: bool,
}

impl Default for CoqtopConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            include_paths: Vec::new(),
            working_dir: None,
            extra_args: Vec::new(),
            queue_capacity: 256,
            max_decode_retries: 1024,
            split_reply_grace: Duration::from_millis(500),
            verbose: false,
        }
    }
}

impl CoqtopConfig {
    /// Create configuration from environment variables.
    ///
    /// `COQTOP_INCLUDES` is a `;`-separated list of `physical=Logical`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let include_paths = match std::env::var("COQTOP_INCLUDES") {
            Ok(raw) => parse_includes(&raw)?,
            Err(_) => Vec::new(),
        };
        let queue_capacity = match std::env::var("COQTOP_QUEUE_CAPACITY") {
            Ok(raw) => raw
                .trim()
                .parse()
                .ok()
                .filter(|n: &usize| *n > 0)
                .ok_or_else(|| {
                    Error::Config(format!("COQTOP_QUEUE_CAPACITY must be a positive integer, got {raw:?}"))
                })?,
            Err(_) => defaults.queue_capacity,
        };
        Ok(Self {
            binary_path: std::env::var("COQTOP_BIN").ok(),
            include_paths,
            working_dir: std::env::var("COQTOP_WORKDIR").ok().map(PathBuf::from),
            queue_capacity,
            verbose: std::env::var("COQTOP_VERBOSE")
                .map(|s| s != "0" && s.to_lowercase() != "false")
                .unwrap_or(false),
            ..defaults
        })
    }

    /// Set the coqtop binary.
    pub fn with_binary(mut self, path: impl Into<String>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    /// Add a `-R physical logical` include.
    pub fn with_include(mut self, physical: impl Into<String>, logical: impl Into<String>) -> Self {
        self.include_paths.push((physical.into(), logical.into()));
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Append an extra command-line argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Set the request queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_split_reply_grace(mut self, grace: Duration) -> Self {
        self.split_reply_grace = grace;
        self
    }

    /// Set verbose mode.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Find the coqtop binary.
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.binary_path {
            let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
            if expanded.components().count() == 1 && !expanded.exists() {
                return which::which(&expanded)
                    .map_err(|e| Error::Config(format!("{path}: {e}")));
            }
            return Ok(expanded);
        }

        if let Ok(path) = which::which("coqtop") {
            return Ok(path);
        }

        let common_paths = [
            "/usr/local/bin/coqtop",
            "/opt/homebrew/bin/coqtop",
            "~/.opam/default/bin/coqtop",
        ];

        for path in common_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Ok(PathBuf::from(expanded.as_ref()));
            }
        }

        Err(Error::Config(
            "coqtop binary not found. Set COQTOP_BIN or install Coq.".to_string(),
        ))
    }
}

fn parse_includes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (physical, logical) = entry.split_once('=').ok_or_else(|| {
                Error::Config(format!("include {entry:?} is not of the form physical=Logical"))
            })?;
            Ok((
                shellexpand::tilde(physical.trim()).into_owned(),
                logical.trim().to_string(),
            ))
        })
        .collect()
}
