use anyhow::Result;
use deployer::aws::Aws;
use deployer::config::{Layout, RawSettings};
use deployer::provision::Provisioner;

fn settings_from_env() -> RawSettings {
    let var = |name: &str| std::env::var(name).ok();
    RawSettings {
        aws_access_key_id: var("AWS_ACCESS_KEY_ID"),
        aws_secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
        aws_default_region: var("AWS_DEFAULT_REGION"),
        aws_security_group_name: var("AWS_SECURITY_GROUP_NAME"),
        aws_instance_type: var("AWS_INSTANCE_TYPE"),
        aws_ami_id: var("AWS_AMI_ID"),
        aws_ssh_key_name: var("AWS_SSH_KEY_NAME"),
        aws_ssh_port: var("AWS_SSH_PORT"),
    }
}

// Needs real credentials and creates a keypair and security group.
#[tokio::test]
#[ignore]
async fn test_setup_aws_account_twice() -> Result<()> {
    let settings = settings_from_env().resolve()?;
    let dir = tempfile::tempdir()?;
    let aws = Aws::new(&settings).await;
    let provisioner = Provisioner::new(aws, settings, Layout::new(dir.path()));

    provisioner.setup_aws_account().await?;
    let second = provisioner.setup_aws_account().await?;

    assert!(!second.key_created);
    assert!(!second.group_created);
    assert_eq!(second.rules_added, 0);

    Ok(())
}
