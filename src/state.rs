use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::Layout;

pub const SSH_USER: &str = "ubuntu";

/// How to reach a host over SSH. Serialized to `deploy/ssh/<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshProfile {
    pub host_string: String,
    pub port: u16,
    pub user: String,
    pub key_filename: PathBuf,
}

impl SshProfile {
    /// `user@host`, the form knife and ssh take.
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host_string)
    }
}

/// Per-instance local state: a plaintext address file in `deploy/fab_hosts/`
/// and a connection profile in `deploy/ssh/`. Both are keyed by instance name
/// and always name the same host.
#[derive(Debug, Clone)]
pub struct StateStore {
    deploy_dir: PathBuf,
    ssh_dir: PathBuf,
    hosts_dir: PathBuf,
}

impl StateStore {
    pub fn new(layout: &Layout) -> StateStore {
        StateStore {
            deploy_dir: layout.deploy_dir(),
            ssh_dir: layout.ssh_dir(),
            hosts_dir: layout.hosts_dir(),
        }
    }

    pub fn ssh_dir(&self) -> &Path {
        &self.ssh_dir
    }

    /// Creates the state directories and restricts `deploy/` and `deploy/ssh/`
    /// to the owner.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.ssh_dir, &self.hosts_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        for dir in [&self.deploy_dir, &self.ssh_dir] {
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("failed to chmod {}", dir.display()))?;
        }
        Ok(())
    }

    fn address_path(&self, name: &str) -> PathBuf {
        self.hosts_dir.join(format!("{name}.txt"))
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.ssh_dir.join(format!("{name}.json"))
    }

    pub fn save(&self, name: &str, profile: &SshProfile) -> Result<()> {
        let path = self.profile_path(name);
        let contents = serde_json::to_string(profile).context("failed to encode ssh profile")?;
        fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;

        let path = self.address_path(name);
        fs::write(&path, &profile.host_string)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn address(&self, name: &str) -> Result<String> {
        let path = self.address_path(name);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("no address recorded for {name} at {}", path.display()))?;
        let address = contents.lines().next().unwrap_or_default().trim();
        if address.is_empty() {
            return Err(anyhow!("address file {} is empty", path.display()));
        }
        Ok(address.to_owned())
    }

    pub fn profile(&self, name: &str) -> Result<SshProfile> {
        let path = self.profile_path(name);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("no ssh profile recorded for {name} at {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Profile for `name` with the host taken from the address file, which
    /// is the record remote commands target.
    pub fn connection(&self, name: &str) -> Result<SshProfile> {
        let address = self.address(name)?;
        let mut profile = self.profile(name)?;
        profile.host_string = address;
        Ok(profile)
    }

    /// Points both records for `name` at a new address.
    pub fn update_address(&self, name: &str, address: &str) -> Result<SshProfile> {
        let mut profile = self.profile(name)?;
        profile.host_string = address.to_owned();
        self.save(name, &profile)?;
        Ok(profile)
    }

    /// Removes both records. Missing files are not an error.
    pub fn remove(&self, name: &str) -> Result<()> {
        for path in [self.profile_path(name), self.address_path(name)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", path.display()))
                }
            }
        }
        Ok(())
    }
}
