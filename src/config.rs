use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PathfuseError, Result};

/// Mount-time behavior knobs, settable programmatically or from a
/// `-o`-style comma-separated option string via [`MountOptions::parse_opts`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountOptions {
    /// Unlink open files immediately instead of hiding them until the
    /// last handle closes.
    pub hard_remove: bool,
    /// Trust the filesystem's own inode numbers instead of overwriting
    /// them with node-table ids.
    pub use_ino: bool,
    /// Fill directory-entry inode numbers from the node table when the
    /// filesystem provides none.
    pub readdir_ino: bool,
    pub direct_io: bool,
    /// Tell the kernel to keep file data cached across opens.
    pub kernel_cache: bool,
    /// Decide kernel caching per open from tracked mtime/size.
    pub auto_cache: bool,
    /// Override permission bits in returned attributes with `0777 & !umask`.
    pub umask: Option<u32>,
    /// Override the owner in returned attributes.
    pub uid: Option<u32>,
    /// Override the group in returned attributes.
    pub gid: Option<u32>,
    pub entry_timeout: Duration,
    /// Cache window the kernel may keep a "no such name" answer. Zero
    /// disables negative caching and lets lookup fail normally.
    pub negative_timeout: Duration,
    pub attr_timeout: Duration,
    /// Staleness window for the auto-cache open check. Defaults to
    /// `attr_timeout` when unset.
    pub ac_attr_timeout: Option<Duration>,
    /// Allow in-flight requests to be interrupted.
    pub intr: bool,
    /// Accepted for option-string compatibility; cancellation is
    /// delivered through tokens, not signals.
    pub intr_signal: Option<i32>,
    pub debug: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            hard_remove: false,
            use_ino: false,
            readdir_ino: false,
            direct_io: false,
            kernel_cache: false,
            auto_cache: false,
            umask: None,
            uid: None,
            gid: None,
            entry_timeout: Duration::from_secs(1),
            negative_timeout: Duration::ZERO,
            attr_timeout: Duration::from_secs(1),
            ac_attr_timeout: None,
            intr: false,
            intr_signal: None,
            debug: false,
        }
    }
}

impl MountOptions {
    /// Parse a comma-separated option string, e.g.
    /// `"auto_cache,uid=501,entry_timeout=0.5"`.
    pub fn parse_opts(opts: &str) -> Result<Self> {
        let mut options = MountOptions::default();
        options.apply_opts(opts)?;
        Ok(options)
    }

    /// Apply options from a comma-separated string on top of the current
    /// values. Unknown options are rejected.
    pub fn apply_opts(&mut self, opts: &str) -> Result<()> {
        for raw in opts.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = match raw.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (raw, None),
            };
            match (key, value) {
                ("hard_remove", None) => self.hard_remove = true,
                ("use_ino", None) => self.use_ino = true,
                ("readdir_ino", None) => self.readdir_ino = true,
                ("direct_io", None) => self.direct_io = true,
                ("kernel_cache", None) => self.kernel_cache = true,
                ("auto_cache", None) => self.auto_cache = true,
                ("noauto_cache", None) => self.auto_cache = false,
                ("intr", None) => self.intr = true,
                ("debug", None) => self.debug = true,
                ("umask", Some(v)) => {
                    self.umask = Some(u32::from_str_radix(v, 8).map_err(|e| {
                        PathfuseError::Config(format!("invalid umask '{}': {}", v, e))
                    })?)
                }
                ("uid", Some(v)) => self.uid = Some(parse_u32(key, v)?),
                ("gid", Some(v)) => self.gid = Some(parse_u32(key, v)?),
                ("intr_signal", Some(v)) => {
                    self.intr_signal = Some(v.parse().map_err(|e| {
                        PathfuseError::Config(format!("invalid intr_signal '{}': {}", v, e))
                    })?)
                }
                ("entry_timeout", Some(v)) => self.entry_timeout = parse_secs(key, v)?,
                ("negative_timeout", Some(v)) => self.negative_timeout = parse_secs(key, v)?,
                ("attr_timeout", Some(v)) => self.attr_timeout = parse_secs(key, v)?,
                ("ac_attr_timeout", Some(v)) => self.ac_attr_timeout = Some(parse_secs(key, v)?),
                _ => {
                    return Err(PathfuseError::Config(format!(
                        "unrecognized mount option '{}'",
                        raw
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn effective_ac_attr_timeout(&self) -> Duration {
        self.ac_attr_timeout.unwrap_or(self.attr_timeout)
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|e| PathfuseError::Config(format!("invalid {} '{}': {}", key, value, e)))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: f64 = value
        .parse()
        .map_err(|e| PathfuseError::Config(format!("invalid {} '{}': {}", key, value, e)))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(PathfuseError::Config(format!(
            "invalid {} '{}': must be a non-negative number of seconds",
            key, value
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}
