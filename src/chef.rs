use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};

use crate::state::SshProfile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnifeAction {
    /// Install chef on the host.
    Prepare,
    /// Converge the host against a node file, relative to the kitchen.
    Cook { node: PathBuf },
}

/// One `knife solo` invocation, run from inside the chef kitchen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnifeCommand {
    pub action: KnifeAction,
    pub key_file: PathBuf,
    pub port: u16,
    pub target: String,
    pub kitchen: PathBuf,
}

impl KnifeCommand {
    pub fn prepare(profile: &SshProfile, kitchen: &Path) -> KnifeCommand {
        KnifeCommand {
            action: KnifeAction::Prepare,
            key_file: profile.key_filename.clone(),
            port: profile.port,
            target: profile.target(),
            kitchen: kitchen.to_owned(),
        }
    }

    pub fn cook(profile: &SshProfile, kitchen: &Path, node: impl Into<PathBuf>) -> KnifeCommand {
        KnifeCommand {
            action: KnifeAction::Cook { node: node.into() },
            key_file: profile.key_filename.clone(),
            port: profile.port,
            target: profile.target(),
            kitchen: kitchen.to_owned(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        let verb = match self.action {
            KnifeAction::Prepare => "prepare",
            KnifeAction::Cook { .. } => "cook",
        };
        let mut args = vec![
            "solo".to_owned(),
            verb.to_owned(),
            "-i".to_owned(),
            self.key_file.display().to_string(),
            "-p".to_owned(),
            self.port.to_string(),
            self.target.clone(),
        ];
        if let KnifeAction::Cook { node } = &self.action {
            args.push(node.display().to_string());
        }
        args
    }
}

/// Node file bootstrap converges `name` against.
pub fn node_file(name: &str) -> PathBuf {
    Path::new("nodes").join(format!("{name}_node.json"))
}

/// Node file every deploy converges against.
pub fn deploy_node_file() -> PathBuf {
    Path::new("nodes").join("deploy_node.json")
}

pub trait KnifeRunner {
    fn run(&self, command: &KnifeCommand) -> Result<()>;
}

impl<T: KnifeRunner + ?Sized> KnifeRunner for &T {
    fn run(&self, command: &KnifeCommand) -> Result<()> {
        (**self).run(command)
    }
}

/// Runs the real `knife` binary with inherited stdio.
pub struct Knife;

impl KnifeRunner for Knife {
    fn run(&self, command: &KnifeCommand) -> Result<()> {
        let args = command.args();
        info!(cmd = %format!("knife {}", args.join(" ")), "running");

        let status = Command::new("knife")
            .args(&args)
            .current_dir(&command.kitchen)
            .status()
            .context("failed to start knife")?;

        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("knife solo {} exited with {status}", args[1]))
        }
    }
}

/// Keeps the kitchen's Berksfile renamed to `hold_Berksfile` so knife skips
/// cookbook resolution. The Berksfile is put back when the guard drops.
pub struct BerksfileHold {
    berksfile: PathBuf,
    held: PathBuf,
    holding: bool,
}

impl BerksfileHold {
    pub fn new(kitchen: &Path) -> BerksfileHold {
        let berksfile = kitchen.join("Berksfile");
        let held = kitchen.join("hold_Berksfile");

        let holding = match fs::rename(&berksfile, &held) {
            Ok(()) => {
                debug!(path = %held.display(), "berksfile held");
                true
            }
            // left behind by an interrupted run; restore it on drop
            Err(e) if e.kind() == ErrorKind::NotFound => held.exists(),
            Err(e) => {
                warn!(?e, "could not hold berksfile, cookbooks will be resolved");
                false
            }
        };

        BerksfileHold {
            berksfile,
            held,
            holding,
        }
    }
}

impl Drop for BerksfileHold {
    fn drop(&mut self) {
        if !self.holding {
            return;
        }
        if let Err(e) = fs::rename(&self.held, &self.berksfile) {
            error!(?e, path = %self.held.display(), "failed to restore berksfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SshProfile {
        SshProfile {
            host_string: "ec2-1.example.com".into(),
            port: 22,
            user: "ubuntu".into(),
            key_filename: PathBuf::from("/srv/app/deploy/ssh/deployer.pem"),
        }
    }

    #[test]
    fn cook_args() {
        let command = KnifeCommand::cook(
            &profile(),
            Path::new("/srv/app/chef_files"),
            node_file("web1"),
        );
        assert_eq!(
            command.args(),
            vec![
                "solo",
                "cook",
                "-i",
                "/srv/app/deploy/ssh/deployer.pem",
                "-p",
                "22",
                "ubuntu@ec2-1.example.com",
                "nodes/web1_node.json",
            ]
        );
    }

    #[test]
    fn prepare_args_have_no_node() {
        let command = KnifeCommand::prepare(&profile(), Path::new("/srv/app/chef_files"));
        assert_eq!(command.args()[1], "prepare");
        assert_eq!(command.args().last().unwrap(), "ubuntu@ec2-1.example.com");
    }

    #[test]
    fn hold_restores_berksfile() {
        let dir = tempfile::tempdir().unwrap();
        let berksfile = dir.path().join("Berksfile");
        fs::write(&berksfile, "source 'https://supermarket.chef.io'").unwrap();

        {
            let _hold = BerksfileHold::new(dir.path());
            assert!(!berksfile.exists());
            assert!(dir.path().join("hold_Berksfile").exists());
        }

        assert_eq!(
            fs::read_to_string(&berksfile).unwrap(),
            "source 'https://supermarket.chef.io'"
        );
        assert!(!dir.path().join("hold_Berksfile").exists());
    }

    #[test]
    fn hold_without_berksfile_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        drop(BerksfileHold::new(dir.path()));
        assert!(!dir.path().join("Berksfile").exists());
        assert!(!dir.path().join("hold_Berksfile").exists());
    }

    #[test]
    fn hold_recovers_stale_held_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hold_Berksfile"), "stale").unwrap();

        drop(BerksfileHold::new(dir.path()));

        assert_eq!(
            fs::read_to_string(dir.path().join("Berksfile")).unwrap(),
            "stale"
        );
    }
}
