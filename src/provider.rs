use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

// EC2 error codes the account setup treats as expected outcomes
pub const KEY_PAIR_NOT_FOUND: &str = "InvalidKeyPair.NotFound";
pub const GROUP_NOT_FOUND: &str = "InvalidGroup.NotFound";
pub const PERMISSION_DUPLICATE: &str = "InvalidPermission.Duplicate";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Other(String),
}

impl From<&str> for InstanceState {
    fn from(name: &str) -> Self {
        match name {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            other => InstanceState::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Other(name) => name,
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub name: Option<String>,
    pub state: InstanceState,
    pub public_dns: Option<String>,
    pub public_ip: Option<String>,
}

impl Instance {
    /// Address used to reach the host: the public DNS name when EC2 assigned
    /// one, the public IPv4 otherwise.
    pub fn public_address(&self) -> Option<&str> {
        self.public_dns
            .as_deref()
            .filter(|dns| !dns.is_empty())
            .or(self.public_ip.as_deref().filter(|ip| !ip.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressSource {
    Cidr(String),
    Group(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub port: u16,
    pub source: IngressSource,
}

impl IngressRule {
    pub fn open(port: u16) -> IngressRule {
        IngressRule {
            port,
            source: IngressSource::Cidr("0.0.0.0/0".to_owned()),
        }
    }

    pub fn from_group(port: u16, group_id: &str) -> IngressRule {
        IngressRule {
            port,
            source: IngressSource::Group(group_id.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Added,
    AlreadyAuthorized,
}

/// One instance launch. `name` becomes the `Name` tag and `tag`, if any, an
/// extra tag with an empty value; both are applied at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: String,
    pub tag: Option<String>,
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticIp {
    pub allocation_id: String,
    pub public_ip: String,
}

/// The slice of the EC2 API the deploy tasks need. Lookups that EC2 answers
/// with a "not found" code come back as `Ok(None)`; every other failure is an
/// error.
#[async_trait]
pub trait Ec2Provider {
    async fn find_key_pair(&self, name: &str) -> Result<Option<String>>;

    /// Creates the keypair and returns the private key material.
    async fn create_key_pair(&self, name: &str) -> Result<String>;

    /// Returns the group id.
    async fn find_security_group(&self, name: &str) -> Result<Option<String>>;

    async fn create_security_group(&self, name: &str, description: &str) -> Result<String>;

    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule)
        -> Result<Authorization>;

    /// Returns the new instance id.
    async fn run_instance(&self, request: &LaunchRequest) -> Result<String>;

    async fn describe_instance(&self, instance_id: &str) -> Result<Instance>;

    /// Every instance tagged `Name=<name>`, in any state.
    async fn instances_named(&self, name: &str) -> Result<Vec<Instance>>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    async fn allocate_address(&self) -> Result<ElasticIp>;

    async fn associate_address(&self, address: &ElasticIp, instance_id: &str) -> Result<()>;
}

#[async_trait]
impl<'a, T> Ec2Provider for &'a T
where
    T: Ec2Provider + Sync + ?Sized,
{
    async fn find_key_pair(&self, name: &str) -> Result<Option<String>> {
        (**self).find_key_pair(name).await
    }

    async fn create_key_pair(&self, name: &str) -> Result<String> {
        (**self).create_key_pair(name).await
    }

    async fn find_security_group(&self, name: &str) -> Result<Option<String>> {
        (**self).find_security_group(name).await
    }

    async fn create_security_group(&self, name: &str, description: &str) -> Result<String> {
        (**self).create_security_group(name, description).await
    }

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rule: &IngressRule,
    ) -> Result<Authorization> {
        (**self).authorize_ingress(group_id, rule).await
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<String> {
        (**self).run_instance(request).await
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Instance> {
        (**self).describe_instance(instance_id).await
    }

    async fn instances_named(&self, name: &str) -> Result<Vec<Instance>> {
        (**self).instances_named(name).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        (**self).terminate_instance(instance_id).await
    }

    async fn allocate_address(&self) -> Result<ElasticIp> {
        (**self).allocate_address().await
    }

    async fn associate_address(&self, address: &ElasticIp, instance_id: &str) -> Result<()> {
        (**self).associate_address(address, instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for name in ["pending", "running", "shutting-down", "terminated", "stopped"] {
            assert_eq!(InstanceState::from(name).to_string(), name);
        }
        assert_eq!(
            InstanceState::from("rebooting"),
            InstanceState::Other("rebooting".into())
        );
    }

    #[test]
    fn public_address_prefers_dns() {
        let mut instance = Instance {
            id: "i-1".into(),
            name: None,
            state: InstanceState::Running,
            public_dns: Some("ec2-1-2-3-4.compute.amazonaws.com".into()),
            public_ip: Some("1.2.3.4".into()),
        };
        assert_eq!(
            instance.public_address(),
            Some("ec2-1-2-3-4.compute.amazonaws.com")
        );

        instance.public_dns = Some(String::new());
        assert_eq!(instance.public_address(), Some("1.2.3.4"));

        instance.public_ip = None;
        assert_eq!(instance.public_address(), None);
    }
}
