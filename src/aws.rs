use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::config::Credentials;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    DomainType, Filter, InstanceType, IpPermission, IpRange, KeyType, ResourceType, Tag,
    TagSpecification, UserIdGroupPair,
};
use aws_types::region::Region;
use tracing::debug;

use crate::config::Settings;
use crate::provider::{
    Authorization, Ec2Provider, ElasticIp, IngressRule, IngressSource, Instance, InstanceState,
    LaunchRequest, GROUP_NOT_FOUND, KEY_PAIR_NOT_FOUND, PERMISSION_DUPLICATE,
};

#[derive(Clone)]
pub struct Aws {
    client: aws_sdk_ec2::Client,
}

impl Aws {
    pub async fn new(settings: &Settings) -> Aws {
        let credentials = Credentials::new(
            &settings.aws_access_key_id,
            &settings.aws_secret_access_key,
            None,
            None,
            "deploy-settings",
        );
        let config = aws_config::from_env()
            .region(Region::new(settings.aws_default_region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        Aws {
            client: aws_sdk_ec2::Client::new(&config),
        }
    }
}

/// Lookups treat `not_found` as an absent resource rather than a failure.
fn is_missing(code: Option<&str>, not_found: &str) -> bool {
    code == Some(not_found)
}

/// Outcome of an ingress call that EC2 rejected with `code`, if it still counts
/// as authorized.
fn rejected_authorization(code: Option<&str>) -> Option<Authorization> {
    (code == Some(PERMISSION_DUPLICATE)).then_some(Authorization::AlreadyAuthorized)
}

fn launch_tags(request: &LaunchRequest) -> TagSpecification {
    let name_tag = Tag::builder().key("Name").value(&request.name).build();
    let tags = TagSpecification::builder()
        .resource_type(ResourceType::Instance)
        .tags(name_tag);
    match &request.tag {
        Some(tag) => tags.tags(Tag::builder().key(tag).value("").build()),
        None => tags,
    }
    .build()
}

fn parse_instance(instance: &aws_sdk_ec2::types::Instance) -> Result<Instance> {
    let id = instance
        .instance_id()
        .ok_or(anyhow!("could not parse instance id"))?
        .to_string();
    let state = instance
        .state()
        .and_then(|state| state.name())
        .ok_or(anyhow!("could not parse instance state name"))?;
    let name = instance
        .tags()
        .iter()
        .find(|tag| tag.key() == Some("Name"))
        .and_then(|tag| tag.value())
        .map(str::to_owned);

    Ok(Instance {
        id,
        name,
        state: InstanceState::from(state.as_str()),
        public_dns: instance.public_dns_name().map(str::to_owned),
        public_ip: instance.public_ip_address().map(str::to_owned),
    })
}

#[async_trait]
impl Ec2Provider for Aws {
    async fn find_key_pair(&self, name: &str) -> Result<Option<String>> {
        match self.client.describe_key_pairs().key_names(name).send().await {
            Ok(resp) => Ok(resp
                .key_pairs()
                .first()
                .and_then(|key| key.key_name())
                .map(str::to_owned)),
            Err(err) => {
                let err = err.into_service_error();
                if is_missing(err.code(), KEY_PAIR_NOT_FOUND) {
                    Ok(None)
                } else {
                    Err(err).context("failed to query key pairs")
                }
            }
        }
    }

    async fn create_key_pair(&self, name: &str) -> Result<String> {
        Ok(self
            .client
            .create_key_pair()
            .key_name(name)
            .key_type(KeyType::Ed25519)
            .send()
            .await
            .map_err(|err| err.into_service_error())
            .context("failed to create key pair")?
            // response parsing from here
            .key_material()
            .ok_or(anyhow!("could not parse key material"))?
            .to_string())
    }

    async fn find_security_group(&self, name: &str) -> Result<Option<String>> {
        match self
            .client
            .describe_security_groups()
            .group_names(name)
            .send()
            .await
        {
            Ok(resp) => Ok(resp
                .security_groups()
                .first()
                .and_then(|group| group.group_id())
                .map(str::to_owned)),
            Err(err) => {
                let err = err.into_service_error();
                if is_missing(err.code(), GROUP_NOT_FOUND) {
                    Ok(None)
                } else {
                    Err(err).context("failed to query security groups")
                }
            }
        }
    }

    async fn create_security_group(&self, name: &str, description: &str) -> Result<String> {
        Ok(self
            .client
            .create_security_group()
            .group_name(name)
            .description(description)
            .send()
            .await
            .map_err(|err| err.into_service_error())
            .context("failed to create security group")?
            // response parsing from here
            .group_id()
            .ok_or(anyhow!("could not parse group id"))?
            .to_string())
    }

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rule: &IngressRule,
    ) -> Result<Authorization> {
        let permission = IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(rule.port as i32)
            .to_port(rule.port as i32);
        let permission = match &rule.source {
            IngressSource::Cidr(cidr) => {
                permission.ip_ranges(IpRange::builder().cidr_ip(cidr).build())
            }
            IngressSource::Group(source) => permission
                .user_id_group_pairs(UserIdGroupPair::builder().group_id(source).build()),
        }
        .build();

        match self
            .client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(permission)
            .send()
            .await
        {
            Ok(_) => Ok(Authorization::Added),
            Err(err) => {
                let err = err.into_service_error();
                match rejected_authorization(err.code()) {
                    Some(authorization) => Ok(authorization),
                    None => Err(err).with_context(|| {
                        format!("failed to authorize port {} on {group_id}", rule.port)
                    }),
                }
            }
        }
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<String> {
        Ok(self
            .client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .key_name(&request.key_name)
            .security_groups(&request.security_group)
            .tag_specifications(launch_tags(request))
            .min_count(1)
            .max_count(1)
            .send()
            .await
            .map_err(|err| err.into_service_error())
            .context("failed to launch instance")?
            // response parsing from here
            .instances()
            .first()
            .ok_or(anyhow!("no instance found"))?
            .instance_id()
            .ok_or(anyhow!("could not parse instance id"))?
            .to_string())
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Instance> {
        let resp = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|err| err.into_service_error())
            .context("failed to describe instance")?;

        // response parsing from here
        let instance = resp
            .reservations()
            .first()
            .ok_or(anyhow!("no reservation found"))?
            .instances()
            .first()
            .ok_or(anyhow!("no instances with the given id"))?;
        parse_instance(instance)
    }

    async fn instances_named(&self, name: &str) -> Result<Vec<Instance>> {
        let resp = self
            .client
            .describe_instances()
            .filters(Filter::builder().name("tag:Name").values(name).build())
            .send()
            .await
            .map_err(|err| err.into_service_error())
            .context("failed to describe instances")?;

        let instances = resp
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .map(parse_instance)
            .collect::<Result<Vec<_>>>()?;
        debug!(name, count = instances.len(), "instances found");
        Ok(instances)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|err| err.into_service_error())
            .with_context(|| format!("failed to terminate {instance_id}"))?;
        Ok(())
    }

    async fn allocate_address(&self) -> Result<ElasticIp> {
        let resp = self
            .client
            .allocate_address()
            .domain(DomainType::Vpc)
            .send()
            .await
            .map_err(|err| err.into_service_error())
            .context("failed to allocate address")?;

        Ok(ElasticIp {
            allocation_id: resp
                .allocation_id()
                .ok_or(anyhow!("could not parse allocation id"))?
                .to_string(),
            public_ip: resp
                .public_ip()
                .ok_or(anyhow!("could not parse public ip"))?
                .to_string(),
        })
    }

    async fn associate_address(&self, address: &ElasticIp, instance_id: &str) -> Result<()> {
        self.client
            .associate_address()
            .allocation_id(&address.allocation_id)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(|err| err.into_service_error())
            .with_context(|| {
                format!("failed to associate {} with {instance_id}", address.public_ip)
            })?;
        Ok(())
    }
}
