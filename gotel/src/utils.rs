// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use std::{
    fs::{OpenOptions, create_dir_all, set_permissions},
    io::{BufRead, BufReader, Read},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
    str::FromStr,
};

use anyhow::{Context, bail};
use log::{debug, warn};
use nix::{
    libc::RLIM_INFINITY,
    mount::{MsFlags, mount},
    sys::resource::{Resource, setrlimit},
};

use crate::{config::Config, directories::*, errors::GotelError};

// Like std::fs::read, but with O_NOCTTY set.
pub(crate) fn read<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, GotelError> {
    let mut data = vec![];
    OpenOptions::new()
        .custom_flags(nix::libc::O_NOCTTY)
        .read(true)
        .open(&path)
        .map_err(|e| {
            GotelError::Error(format!("can't open {}: {e}", path.as_ref().display()))
        })?
        .read_to_end(&mut data)
        .map_err(|e| {
            GotelError::Error(format!("can't read {}: {e}", path.as_ref().display()))
        })?;
    Ok(data)
}

pub fn set_file_permissions(path: &Path, mode: u32) {
    if set_permissions(path, std::fs::Permissions::from_mode(mode)).is_err() {
        debug!(
            "Unable to set permissions on file {}. Continuing",
            path.display()
        );
    }
}

pub fn create_bpffs(directory: &str) -> anyhow::Result<()> {
    debug!("Creating bpffs at {directory}");
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME;
    mount::<str, str, str, str>(None, directory, Some("bpf"), flags, None)
        .with_context(|| format!("unable to create bpffs at {directory}"))
}

fn is_bpffs_mounted() -> anyhow::Result<bool> {
    let file = std::fs::File::open("/proc/mounts").context("failed to open /proc/mounts")?;
    for line in BufReader::new(file).lines() {
        match line {
            Ok(line) => {
                let mut parts = line.split_whitespace();
                let (_, mount_point, fs_type) = (parts.next(), parts.next(), parts.next());
                if fs_type == Some("bpf") && mount_point == Some(RTDIR_FS) {
                    return Ok(true);
                }
            }
            Err(e) => bail!("problem reading lines {}", e),
        }
    }
    Ok(false)
}

fn has_cap(cset: caps::CapSet, cap: caps::Capability) {
    if !caps::has_cap(None, cset, cap).unwrap_or(false) {
        warn!("{cap} is not set");
    }
}

/// Privilege checks plus runtime directory and bpffs setup, run once at
/// CLI startup.
pub fn initialize_gotel() -> anyhow::Result<()> {
    has_cap(caps::CapSet::Effective, caps::Capability::CAP_BPF);
    has_cap(caps::CapSet::Effective, caps::Capability::CAP_SYS_ADMIN);

    if setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY).is_err() {
        bail!("must be privileged to run gotel");
    }

    create_dir_all(RTDIR).context("unable to create runtime directory")?;
    create_dir_all(RTDIR_FS).context("unable to create mountpoint")?;
    if !is_bpffs_mounted()? {
        create_bpffs(RTDIR_FS)?;
    }
    set_file_permissions(Path::new(RTDIR), RTDIR_MODE);

    Ok(())
}

/// Reads the on-disk config file, falling back to defaults when it is
/// absent or malformed.
pub fn open_config_file() -> Config {
    if let Ok(contents) = std::fs::read_to_string(CFGPATH_GOTEL_CONFIG) {
        match Config::from_str(&contents) {
            Ok(config) => return config,
            Err(e) => warn!("ignoring malformed {CFGPATH_GOTEL_CONFIG}: {e}"),
        }
    }
    Config::default()
}

/// Boolean environment knob: absent means false.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_env_flag_parsing() {
        // SAFETY: test process is single-threaded at this point.
        unsafe {
            std::env::set_var("GOTEL_TEST_FLAG_A", "true");
            std::env::set_var("GOTEL_TEST_FLAG_B", "0");
        }
        assert!(env_flag("GOTEL_TEST_FLAG_A"));
        assert!(!env_flag("GOTEL_TEST_FLAG_B"));
        assert!(!env_flag("GOTEL_TEST_FLAG_MISSING"));
    }
}
