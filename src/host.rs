use anyhow::Result;
use tracing::{error, info, warn};

use crate::chef::{deploy_node_file, node_file, BerksfileHold, KnifeCommand, KnifeRunner};
use crate::config::{AppSettings, Layout};
use crate::remote::RemoteShell;
use crate::state::{SshProfile, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed,
    Failed,
}

/// Tasks that run against an already provisioned host: chef runs, service
/// restarts and interactive shells. Hosts are looked up by name in local state.
pub struct HostTasks<K, R> {
    knife: K,
    remote: R,
    layout: Layout,
    store: StateStore,
}

impl<K: KnifeRunner, R: RemoteShell> HostTasks<K, R> {
    pub fn new(knife: K, remote: R, layout: Layout) -> HostTasks<K, R> {
        let store = StateStore::new(&layout);
        HostTasks {
            knife,
            remote,
            layout,
            store,
        }
    }

    /// Installs chef on the host unless `no_install`, then converges it
    /// against its own node file.
    pub fn bootstrap(&self, name: &str, no_install: bool) -> Result<()> {
        info!(name, "bootstrapping");
        let profile = self.store.connection(name)?;
        let kitchen = self.layout.chef_dir();

        if !no_install {
            info!(name, "installing chef");
            self.knife.run(&KnifeCommand::prepare(&profile, &kitchen))?;
        }
        info!(name, "running chef");
        self.knife
            .run(&KnifeCommand::cook(&profile, &kitchen, node_file(name)))
    }

    /// Converges the host against the deploy node file and restarts the app.
    ///
    /// Failures past the local state lookup are logged, not returned, and the
    /// Berksfile is back in place whatever happened.
    pub fn deploy(&self, name: &str) -> Result<DeployOutcome> {
        info!(name, "deploying");
        let profile = self.store.connection(name)?;
        let kitchen = self.layout.chef_dir();

        let cooked = {
            let _hold = BerksfileHold::new(&kitchen);
            self.knife
                .run(&KnifeCommand::cook(&profile, &kitchen, deploy_node_file()))
        };

        match cooked.and_then(|()| self.restart_services(&profile)) {
            Ok(()) => {
                info!(name, "deployed");
                Ok(DeployOutcome::Deployed)
            }
            Err(e) => {
                error!(?e, name, "deploy failed");
                Ok(DeployOutcome::Failed)
            }
        }
    }

    /// Restarts the app under supervisor and reloads nginx. A command that
    /// exits non-zero is a warning, not an error.
    pub fn restart(&self, name: &str) -> Result<()> {
        let profile = self.store.connection(name)?;
        self.restart_services(&profile)
    }

    fn restart_services(&self, profile: &SshProfile) -> Result<()> {
        let app = AppSettings::load(&self.layout.app_settings_file())?;
        let commands = [
            format!("sudo supervisorctl restart {}", app.app_name()?),
            "sudo /etc/init.d/nginx reload".to_owned(),
        ];

        for command in &commands {
            let output = self.remote.exec(profile, command)?;
            if output.success() {
                info!(host = %profile.host_string, command = command.as_str(), "ok");
            } else {
                warn!(
                    host = %profile.host_string,
                    command = command.as_str(),
                    status = output.exit_status,
                    output = output.output.trim(),
                    "remote command failed"
                );
            }
        }
        Ok(())
    }

    pub fn ssh(&self, name: &str) -> Result<()> {
        let profile = self.store.connection(name)?;
        self.remote.interactive(&profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chef::KnifeAction;
    use crate::state::SSH_USER;
    use crate::test::{RecordingKnife, RecordingRemote};
    use std::fs;
    use std::path::PathBuf;

    struct Fixture {
        dir: tempfile::TempDir,
        knife: RecordingKnife,
        remote: RecordingRemote,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let store = StateStore::new(&Layout::new(dir.path()));
            store.prepare().unwrap();
            store
                .save(
                    "web1",
                    &SshProfile {
                        host_string: "ec2-1.example.com".into(),
                        port: 22,
                        user: SSH_USER.into(),
                        key_filename: dir.path().join("deploy/ssh/deployer.pem"),
                    },
                )
                .unwrap();
            fs::create_dir_all(dir.path().join("chef_files")).unwrap();
            fs::write(dir.path().join("chef_files/Berksfile"), "cookbook 'nginx'").unwrap();
            fs::write(
                dir.path().join("deploy/settings.json"),
                r#"{"APP_NAME": "shop"}"#,
            )
            .unwrap();

            Fixture {
                dir,
                knife: RecordingKnife::default(),
                remote: RecordingRemote::default(),
            }
        }

        fn tasks(&self) -> HostTasks<&RecordingKnife, &RecordingRemote> {
            HostTasks::new(&self.knife, &self.remote, Layout::new(self.dir.path()))
        }

        fn berksfile(&self) -> PathBuf {
            self.dir.path().join("chef_files/Berksfile")
        }
    }

    #[test]
    fn bootstrap_prepares_then_cooks_node_file() {
        let fixture = Fixture::new();

        fixture.tasks().bootstrap("web1", false).unwrap();

        let commands = fixture.knife.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].action, KnifeAction::Prepare);
        assert_eq!(
            commands[1].action,
            KnifeAction::Cook {
                node: PathBuf::from("nodes/web1_node.json")
            }
        );
        assert_eq!(commands[1].target, "ubuntu@ec2-1.example.com");
        assert_eq!(commands[1].kitchen, fixture.dir.path().join("chef_files"));
    }

    #[test]
    fn bootstrap_no_install_skips_prepare() {
        let fixture = Fixture::new();

        fixture.tasks().bootstrap("web1", true).unwrap();

        let commands = fixture.knife.commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0].action, KnifeAction::Cook { .. }));
    }

    #[test]
    fn bootstrap_unknown_host_fails() {
        let fixture = Fixture::new();
        assert!(fixture.tasks().bootstrap("web2", false).is_err());
        assert!(fixture.knife.commands().is_empty());
    }

    #[test]
    fn deploy_holds_berksfile_and_restarts() {
        let fixture = Fixture::new();

        let outcome = fixture.tasks().deploy("web1").unwrap();

        assert_eq!(outcome, DeployOutcome::Deployed);
        assert_eq!(fixture.knife.berksfile_present(), vec![false]);
        assert!(fixture.berksfile().exists());
        assert_eq!(
            fixture.remote.commands(),
            vec![
                "sudo supervisorctl restart shop".to_owned(),
                "sudo /etc/init.d/nginx reload".to_owned(),
            ]
        );
    }

    #[test]
    fn deploy_failure_restores_berksfile_and_skips_restart() {
        let mut fixture = Fixture::new();
        fixture.knife.fail = true;

        let outcome = fixture.tasks().deploy("web1").unwrap();

        assert_eq!(outcome, DeployOutcome::Failed);
        assert_eq!(
            fs::read_to_string(fixture.berksfile()).unwrap(),
            "cookbook 'nginx'"
        );
        assert!(!fixture.dir.path().join("chef_files/hold_Berksfile").exists());
        assert!(fixture.remote.commands().is_empty());
    }

    #[test]
    fn restart_tolerates_failing_commands() {
        let mut fixture = Fixture::new();
        fixture.remote.exit_status = 1;

        fixture.tasks().restart("web1").unwrap();

        assert_eq!(fixture.remote.commands().len(), 2);
    }

    #[test]
    fn restart_follows_address_file() {
        let fixture = Fixture::new();
        fs::write(
            fixture.dir.path().join("deploy/fab_hosts/web1.txt"),
            "203.0.113.9",
        )
        .unwrap();

        fixture.tasks().restart("web1").unwrap();

        assert!(fixture
            .remote
            .hosts()
            .iter()
            .all(|host| host == "203.0.113.9"));
    }

    #[test]
    fn ssh_opens_shell_on_recorded_host() {
        let fixture = Fixture::new();

        fixture.tasks().ssh("web1").unwrap();

        assert_eq!(
            fixture.remote.shells(),
            vec!["ubuntu@ec2-1.example.com".to_owned()]
        );
    }
}
