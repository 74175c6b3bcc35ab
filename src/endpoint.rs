/*!
 * SCP-style endpoint parsing and task fingerprinting
 */

use crate::error::{FerryError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// One side of a transfer: a local path or a `[user@]host:path` remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub path: String,
    pub is_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

impl Endpoint {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_local: true,
            host: None,
            user: None,
            port: 22,
            key_file: None,
        }
    }

    pub fn remote(host: impl Into<String>, user: Option<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_local: false,
            host: Some(host.into()),
            user,
            port,
            key_file: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local
    }

    /// Canonical key used for the task fingerprint: `user@host:port:path`
    /// for remote endpoints, the absolute path for local ones. Paths are
    /// expected to be resolved before fingerprinting.
    pub fn canonical_key(&self) -> String {
        if self.is_local {
            self.path.clone()
        } else {
            format!(
                "{}@{}:{}:{}",
                self.user.as_deref().unwrap_or_default(),
                self.host.as_deref().unwrap_or_default(),
                self.port,
                self.path
            )
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local {
            write!(f, "{}", self.path)
        } else if let Some(user) = &self.user {
            write!(f, "{}@{}:{}", user, self.host.as_deref().unwrap_or(""), self.path)
        } else {
            write!(f, "{}:{}", self.host.as_deref().unwrap_or(""), self.path)
        }
    }
}

/// Parse an scp-style path argument.
///
/// Rules, evaluated in order:
/// 1. `/`, `./`, `../`, `~` prefixes or a bare `.` are local.
/// 2. `[user@]host:path` where the host contains no `/` and the colon is
///    not in Windows drive position is remote; an empty remote path means
///    the remote home directory.
/// 3. Anything else is local.
pub fn parse_endpoint(input: &str, default_port: u16) -> Result<Endpoint> {
    if input.is_empty() {
        return Err(FerryError::Parse("empty path".into()));
    }

    if input == "."
        || input.starts_with('/')
        || input.starts_with("./")
        || input.starts_with("../")
        || input.starts_with('~')
    {
        return Ok(Endpoint::local(expand_local(input)?));
    }

    if let Some(colon) = input.find(':') {
        let host_part = &input[..colon];
        let remote_path = &input[colon + 1..];

        if !host_part.is_empty() && !host_part.contains('/') && !is_windows_drive(input) {
            let (user, host) = match host_part.rsplit_once('@') {
                Some((user, host)) if !host.is_empty() => (Some(user.to_string()), host),
                Some(_) => {
                    return Err(FerryError::Parse(format!("missing host in '{}'", input)))
                }
                None => (None, host_part),
            };

            // Empty path addresses the remote home directory
            let path = if remote_path.is_empty() { "~" } else { remote_path };
            return Ok(Endpoint::remote(host, user, default_port, path));
        }
    }

    Ok(Endpoint::local(expand_local(input)?))
}

/// `C:\...` or `C:/...` — a colon in drive position is not a host separator.
fn is_windows_drive(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'/' || bytes[2] == b'\\')
}

/// Expand `~` against the local home directory and make the path absolute
/// against the current working directory, normalizing `.` and `..`
/// components lexically (the target may not exist yet).
pub fn expand_local(path: &str) -> Result<String> {
    let expanded: PathBuf = if path == "~" {
        local_home()?
    } else if let Some(rest) = path.strip_prefix("~/") {
        local_home()?.join(rest)
    } else {
        PathBuf::from(path)
    };

    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()?.join(expanded)
    };

    Ok(normalize(&absolute).to_string_lossy().into_owned())
}

fn local_home() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| FerryError::Config("could not determine home directory".into()))
}

/// Lexical path normalization: collapses `.` and resolves `..` without
/// touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Stable task fingerprint: SHA-256 over the canonicalized endpoint pair.
/// Independent of config, so resuming with a different `--parallel` still
/// finds the same manifest.
pub fn task_id(src: &Endpoint, dst: &Endpoint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(src.canonical_key().as_bytes());
    hasher.update("→".as_bytes());
    hasher.update(dst.canonical_key().as_bytes());
    format!("{:x}", hasher.finalize())
}
