//! Version-dependent protocol details.
//!
//! Which binary to launch, with which flags, and the argument layout of the
//! `Add` call all depend on the verifier's release. Everything
//! version-specific is resolved once, here, into a [`ProtocolDialect`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("valid regex"));

/// A verifier release number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoqVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl CoqVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the first `major.minor[.patch]` in `text`.
    ///
    /// Accepts the raw output of `-print-version` as well as suffixed
    /// releases such as `8.10+beta1`.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(text)?;
        let num = |idx: usize| -> Option<u32> {
            caps.get(idx).map_or(Some(0), |m| m.as_str().parse().ok())
        };
        Some(Self::new(num(1)?, num(2)?, num(3)?))
    }
}

impl fmt::Display for CoqVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Argument layout of the `Add` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddLayout {
    /// `((text, edit_id), (state_id, verbose))`
    Classic,
    /// Classic layout wrapped with the sentence location:
    /// `((classic, bp), (line_nb, bol_pos))`
    Located,
}

const IDESLAVE_FLAGS: &[&str] = &[
    "-ideslave",
    "-main-channel",
    "stdfds",
    "-async-proofs",
    "on",
    "-async-proofs-tactic-error-resilience",
    "off",
];

const IDETOP_FLAGS: &[&str] = &[
    "-main-channel",
    "stdfds",
    "-async-proofs",
    "on",
    "-async-proofs-tactic-error-resilience",
    "off",
];

/// Launch and encoding details for one verifier release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDialect {
    pub version: CoqVersion,
    pub add_layout: AddLayout,
    /// Dedicated IDE binary living next to `coqtop`, when the release has one.
    pub ide_binary: Option<&'static str>,
    pub launch_flags: &'static [&'static str],
}

impl ProtocolDialect {
    pub const MIN_VERSION: CoqVersion = CoqVersion {
        major: 8,
        minor: 6,
        patch: 0,
    };

    /// Dialect for a known release; releases outside 8.6 to 8.x are refused.
    pub fn for_version(version: CoqVersion) -> Result<Self> {
        if version < Self::MIN_VERSION || version.major != 8 {
            return Err(Error::UnsupportedVersion(format!(
                "{version} (supported: >= {} and < 9.0)",
                Self::MIN_VERSION
            )));
        }
        let dialect = match version.minor {
            6..=8 => Self {
                version,
                add_layout: AddLayout::Classic,
                ide_binary: None,
                launch_flags: IDESLAVE_FLAGS,
            },
            9..=14 => Self {
                version,
                add_layout: AddLayout::Classic,
                ide_binary: Some("coqidetop"),
                launch_flags: IDETOP_FLAGS,
            },
            _ => Self {
                version,
                add_layout: AddLayout::Located,
                ide_binary: Some("coqidetop"),
                launch_flags: IDETOP_FLAGS,
            },
        };
        Ok(dialect)
    }

    /// Ask `coqtop -print-version` which release is installed.
    pub fn detect(coqtop: &Path) -> Result<Self> {
        let output = Command::new(coqtop)
            .arg("-print-version")
            .output()
            .map_err(|e| Error::subprocess(&format!("running {}", coqtop.display()), e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = CoqVersion::parse(&stdout).ok_or_else(|| {
            Error::UnsupportedVersion(format!("unparseable version output {:?}", stdout.trim()))
        })?;
        tracing::debug!(%version, binary = %coqtop.display(), "detected verifier version");
        Self::for_version(version)
    }

    /// The binary to launch given the configured `coqtop` path.
    pub fn launch_binary(&self, coqtop: &Path) -> PathBuf {
        match self.ide_binary {
            Some(name) => coqtop.with_file_name(name),
            None => coqtop.to_path_buf(),
        }
    }

    /// Full argument list: protocol flags, then `-R phys logical` per include.
    pub fn launch_args(&self, include_paths: &[(String, String)], extra: &[String]) -> Vec<String> {
        let mut args: Vec<String> = self.launch_flags.iter().map(|s| s.to_string()).collect();
        for (physical, logical) in include_paths {
            args.push("-R".to_string());
            args.push(physical.clone());
            args.push(logical.clone());
        }
        args.extend(extra.iter().cloned());
        args
    }
}
