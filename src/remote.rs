use anyhow::{anyhow, Context, Result};
use ssh2::{ExtendedData, Session};
use std::io::Read;
use std::net::TcpStream;
use std::process::Command;
use tracing::info;

use crate::state::SshProfile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub exit_status: i32,
    pub output: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

pub trait RemoteShell {
    /// Runs one command on the host and waits for it to exit.
    fn exec(&self, profile: &SshProfile, command: &str) -> Result<RemoteOutput>;

    /// Hands the terminal to an interactive login shell on the host.
    fn interactive(&self, profile: &SshProfile) -> Result<()>;
}

impl<T: RemoteShell + ?Sized> RemoteShell for &T {
    fn exec(&self, profile: &SshProfile, command: &str) -> Result<RemoteOutput> {
        (**self).exec(profile, command)
    }

    fn interactive(&self, profile: &SshProfile) -> Result<()> {
        (**self).interactive(profile)
    }
}

pub struct Ssh;

impl Ssh {
    pub fn connect(&self, profile: &SshProfile) -> Result<Session> {
        let tcp = TcpStream::connect((profile.host_string.as_str(), profile.port))
            .with_context(|| format!("failed to connect to {}", profile.host_string))?;

        let mut sess = Session::new()?;
        sess.set_tcp_stream(tcp);
        sess.handshake().context("ssh handshake failed")?;
        sess.userauth_pubkey_file(&profile.user, None, &profile.key_filename, None)
            .with_context(|| format!("ssh auth failed for {}", profile.target()))?;
        info!(host = %profile.host_string, "SSH connection established");
        Ok(sess)
    }
}

impl RemoteShell for Ssh {
    fn exec(&self, profile: &SshProfile, command: &str) -> Result<RemoteOutput> {
        let sess = self.connect(profile)?;
        let mut channel = sess.channel_session()?;
        // stderr shares the stdout stream so neither can stall the other
        channel.handle_extended_data(ExtendedData::Merge)?;
        channel.exec(command)?;

        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        channel.wait_close()?;

        Ok(RemoteOutput {
            exit_status: channel.exit_status()?,
            output,
        })
    }

    fn interactive(&self, profile: &SshProfile) -> Result<()> {
        let status = Command::new("ssh")
            .arg("-i")
            .arg(&profile.key_filename)
            .arg("-p")
            .arg(profile.port.to_string())
            .arg(profile.target())
            .status()
            .context("failed to start ssh")?;

        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("ssh session exited with {status}"))
        }
    }
}
