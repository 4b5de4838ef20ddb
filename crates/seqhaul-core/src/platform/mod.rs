//! Host probing: staging root selection, identity, tool capabilities.
//!
//! All platform branching is resolved once at startup into capability flags
//! on [`HostProbe`]; the rest of the crate never inspects the host directly.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{HaulError, Result};

pub mod fs;

/// Marker directory that identifies a sequencer appliance host.
const APPLIANCE_MARKER: &str = "/usr/local/illumina";

/// Staging subdirectory name under the chosen root.
const STAGING_DIR_NAME: &str = "seq-run-uploads";

/// Resolved host capabilities and identity, computed once at startup.
#[derive(Debug, Clone)]
pub struct HostProbe {
    /// True when the appliance marker directory exists.
    pub appliance: bool,
    /// Root under which per-run staging directories are created.
    pub staging_root: PathBuf,
    /// Whether the `ip` tool is available for primary-address discovery.
    pub has_ip_tool: bool,
    pub hostname: String,
    pub user: String,
    /// Best-effort primary IPv4; `"unknown"` when undiscoverable.
    pub ip: String,
    pub os: String,
    pub arch: String,
}

impl HostProbe {
    /// Probe the host. `staging_override` wins over the appliance heuristic.
    ///
    /// Fails with `MissingDependency` when the staging root cannot be
    /// created or written; nothing downstream can work without it.
    pub fn detect(staging_override: Option<&Path>) -> Result<Self> {
        let appliance = Path::new(APPLIANCE_MARKER).is_dir();
        let staging_root = match staging_override {
            Some(p) => p.to_path_buf(),
            None if appliance => Path::new(APPLIANCE_MARKER).join(STAGING_DIR_NAME),
            None => std::env::temp_dir().join(STAGING_DIR_NAME),
        };
        verify_writable_root(&staging_root)?;

        let has_ip_tool = tool_on_path("ip");
        let ip = if has_ip_tool {
            primary_ip().unwrap_or_else(|| "unknown".into())
        } else {
            "unknown".into()
        };

        Ok(Self {
            appliance,
            staging_root,
            has_ip_tool,
            hostname: hostname(),
            user: username(),
            ip,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        })
    }
}

/// Create the staging root and prove it is writable.
fn verify_writable_root(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root)
        .map_err(|e| HaulError::MissingDependency(format!("staging root {}: {e}", root.display())))?;
    let probe = root.join(format!(".probe.{}", std::process::id()));
    std::fs::write(&probe, b"")
        .map_err(|e| HaulError::MissingDependency(format!("staging root {} not writable: {e}", root.display())))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Return the system hostname, or `"unknown"` if it cannot be determined.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".into())
    }
}

/// Effective username, from the passwd database with an env fallback.
pub fn username() -> String {
    #[cfg(unix)]
    {
        use nix::unistd::{Uid, User};
        if let Ok(Some(u)) = User::from_uid(Uid::effective()) {
            return u.name;
        }
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".into())
}

/// Ask the kernel to flush dirty pages before measuring or snapshotting.
pub fn sync_filesystems() {
    #[cfg(unix)]
    unsafe {
        libc::sync();
    }
}

fn tool_on_path(name: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(name).is_file())
}

/// Primary IPv4 as seen on the default route, e.g. `192.168.1.10`.
fn primary_ip() -> Option<String> {
    let out = Command::new("ip")
        .args(["-4", "route", "get", "1.1.1.1"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout);
    let mut words = text.split_whitespace();
    while let Some(w) = words.next() {
        if w == "src" {
            return words.next().map(|s| s.to_string());
        }
    }
    None
}
