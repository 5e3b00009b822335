use anyhow::{Context, Result};
use deployer::remote::{RemoteShell, Ssh};
use deployer::state::{SshProfile, SSH_USER};

fn profile_from_env() -> Result<SshProfile> {
    let var = |name: &str| std::env::var(name).with_context(|| format!("{name} not set"));
    Ok(SshProfile {
        host_string: var("DEPLOY_TEST_HOST")?,
        port: var("DEPLOY_TEST_PORT")
            .unwrap_or_else(|_| "22".to_owned())
            .parse()?,
        user: var("DEPLOY_TEST_USER").unwrap_or_else(|_| SSH_USER.to_owned()),
        key_filename: var("DEPLOY_TEST_KEY")?.into(),
    })
}

// Needs a reachable host. A megabyte on stderr is well past the channel window.
#[test]
#[ignore]
fn test_exec_collects_large_stderr() -> Result<()> {
    let profile = profile_from_env()?;

    let output = Ssh.exec(
        &profile,
        "head -c 1048576 /dev/zero | tr '\\0' x >&2; echo done",
    )?;

    assert!(output.success());
    assert!(output.output.len() > 1_048_576);
    assert_eq!(output.output.trim_end().rsplit('x').next(), Some("done"));

    Ok(())
}
