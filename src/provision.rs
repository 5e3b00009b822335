use anyhow::{anyhow, Context, Result};
use std::io::{self, BufRead, Write};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::config::{AppSettings, Layout, Settings};
use crate::keys;
use crate::provider::{Authorization, Ec2Provider, IngressRule, InstanceState, LaunchRequest};
use crate::state::{SshProfile, StateStore, SSH_USER};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const SECURITY_GROUP_DESCRIPTION: &str = "A group that allows SSH access";
pub const HTTP_PORT: u16 = 80;
pub const POSTGRES_PORT: u16 = 5432;

/// Asks the operator a yes/no question.
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        let mut stdout = io::stdout();
        write!(stdout, "{prompt}")?;
        stdout.flush()?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("failed to read answer")?;
        Ok(answer.trim().eq_ignore_ascii_case("y"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSetup {
    pub key_created: bool,
    pub group_created: bool,
    pub group_id: String,
    pub rules_added: usize,
}

/// Cloud-side tasks: account setup, instance lifecycle and elastic IPs.
pub struct Provisioner<P> {
    ec2: P,
    settings: Settings,
    layout: Layout,
    store: StateStore,
}

impl<P: Ec2Provider> Provisioner<P> {
    pub fn new(ec2: P, settings: Settings, layout: Layout) -> Provisioner<P> {
        let store = StateStore::new(&layout);
        Provisioner {
            ec2,
            settings,
            layout,
            store,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Makes sure the keypair and security group exist, creating whatever is
    /// missing. Safe to run any number of times.
    pub async fn setup_aws_account(&self) -> Result<AccountSetup> {
        self.store.prepare()?;

        let key_name = &self.settings.aws_ssh_key_name;
        let key_created = match self.ec2.find_key_pair(key_name).await? {
            Some(_) => {
                info!(key = key_name.as_str(), "key pair already exists");
                let key_path = self.layout.key_path(key_name);
                if !key_path.exists() {
                    warn!(
                        path = %key_path.display(),
                        "private key for existing key pair not found locally"
                    );
                }
                false
            }
            None => {
                let key_path = self.layout.key_path(key_name);
                if key_path.exists() {
                    return Err(anyhow!(
                        "{} exists but key pair {key_name} does not; remove the stale key first",
                        key_path.display()
                    ));
                }
                info!(key = key_name.as_str(), "creating key pair");
                let material = self.ec2.create_key_pair(key_name).await?;
                keys::save_key_pair(self.store.ssh_dir(), key_name, &material)?;
                true
            }
        };

        let group_name = &self.settings.aws_security_group_name;
        let (group_id, group_created) = match self.ec2.find_security_group(group_name).await? {
            Some(id) => (id, false),
            None => {
                info!(group = group_name.as_str(), "creating security group");
                let id = self
                    .ec2
                    .create_security_group(group_name, SECURITY_GROUP_DESCRIPTION)
                    .await?;
                (id, true)
            }
        };

        let rules = [
            IngressRule::open(HTTP_PORT),
            IngressRule::open(self.settings.aws_ssh_port),
            IngressRule::from_group(POSTGRES_PORT, &group_id),
        ];
        let mut rules_added = 0;
        for rule in &rules {
            match self.ec2.authorize_ingress(&group_id, rule).await? {
                Authorization::Added => {
                    info!(group = group_name.as_str(), port = rule.port, "ingress authorized");
                    rules_added += 1;
                }
                Authorization::AlreadyAuthorized => {
                    info!(group = group_name.as_str(), port = rule.port, "already authorized");
                }
            }
        }

        Ok(AccountSetup {
            key_created,
            group_created,
            group_id,
            rules_added,
        })
    }

    /// Launches an instance tagged `Name=<name>`, waits for it to run and
    /// records how to reach it.
    ///
    /// The state poll has no upper bound; an instance stuck in `pending`
    /// keeps this waiting until the operator interrupts it. An instance that
    /// starts shutting down before it runs is an error.
    pub async fn create_instance(&self, name: &str, tag: Option<&str>) -> Result<SshProfile> {
        self.store.prepare()?;
        info!(name, "creating instance");

        let key = self.ec2.find_key_pair(&self.settings.aws_ssh_key_name).await?;
        let group = self
            .ec2
            .find_security_group(&self.settings.aws_security_group_name)
            .await?;
        if key.is_none() || group.is_none() {
            self.setup_aws_account().await?;
        }

        let request = LaunchRequest {
            name: name.to_owned(),
            tag: tag.map(str::to_owned),
            image_id: self.settings.aws_ami_id.clone(),
            instance_type: self.settings.aws_instance_type.clone(),
            key_name: self.settings.aws_ssh_key_name.clone(),
            security_group: self.settings.aws_security_group_name.clone(),
        };
        let instance_id = self.ec2.run_instance(&request).await?;
        info!(instance = instance_id.as_str(), state = "pending", "instance launched");

        let instance = loop {
            sleep(POLL_INTERVAL).await;
            let instance = self.ec2.describe_instance(&instance_id).await?;
            match instance.state {
                InstanceState::Running => break instance,
                InstanceState::ShuttingDown | InstanceState::Terminated => {
                    return Err(anyhow!(
                        "instance {instance_id} is {} and never reached running",
                        instance.state
                    ));
                }
                _ => {}
            }
            info!(instance = instance_id.as_str(), state = %instance.state, "instance state");
        };

        let address = instance
            .public_address()
            .ok_or(anyhow!("instance {instance_id} is running without a public address"))?;
        info!(instance = instance_id.as_str(), address, "instance running");

        let profile = SshProfile {
            host_string: address.to_owned(),
            port: self.settings.aws_ssh_port,
            user: SSH_USER.to_owned(),
            key_filename: self.layout.key_path(&self.settings.aws_ssh_key_name),
        };
        self.store.save(name, &profile)?;
        Ok(profile)
    }

    /// Terminates every live instance named `name` the operator confirms.
    /// Returns the ids that were terminated.
    pub async fn terminate_instance(
        &self,
        name: &str,
        confirm: &mut impl Confirm,
    ) -> Result<Vec<String>> {
        info!(name, "terminating");

        let instances = self.ec2.instances_named(name).await?;
        if instances.is_empty() {
            info!(name, "no instances found");
        }

        let mut terminated = Vec::new();
        for instance in instances {
            if instance.state == InstanceState::Terminated {
                info!(instance = instance.id.as_str(), "instance is already terminated");
                continue;
            }
            info!(instance = instance.id.as_str(), state = %instance.state, name, "found instance");

            if !confirm.confirm(&format!("terminate {} ({name})? (y/n) ", instance.id))? {
                continue;
            }

            self.ec2.terminate_instance(&instance.id).await?;
            self.store.remove(name)?;
            info!(instance = instance.id.as_str(), "terminated");
            terminated.push(instance.id);
        }

        Ok(terminated)
    }

    /// Allocates a new elastic IP, attaches it to the running instance named
    /// `name` and repoints local state at it. Every call allocates a fresh
    /// address.
    pub async fn associate_ip(&self, name: &str) -> Result<String> {
        info!(name, "assigning an elastic IP");
        // fail before allocating if there is nothing to update
        self.store.profile(name)?;

        let running: Vec<_> = self
            .ec2
            .instances_named(name)
            .await?
            .into_iter()
            .filter(|instance| instance.state == InstanceState::Running)
            .collect();
        let instance = match running.as_slice() {
            [instance] => instance,
            [] => return Err(anyhow!("no running instance named {name}")),
            many => {
                let ids: Vec<&str> = many.iter().map(|i| i.id.as_str()).collect();
                return Err(anyhow!(
                    "{} running instances named {name}: {}",
                    ids.len(),
                    ids.join(", ")
                ));
            }
        };

        let address = self.ec2.allocate_address().await?;
        self.ec2.associate_address(&address, &instance.id).await?;
        self.store.update_address(name, &address.public_ip)?;

        let app_settings_file = self.layout.app_settings_file();
        if app_settings_file.exists() {
            let mut app = AppSettings::load(&app_settings_file)?;
            app.set_ec2_dns(&address.public_ip);
            app.save(&app_settings_file)?;
        } else {
            warn!(path = %app_settings_file.display(), "no app settings to update");
        }

        info!(name, address = address.public_ip.as_str(), "elastic IP assigned");
        Ok(address.public_ip)
    }
}
