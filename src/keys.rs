use anyhow::{anyhow, Context, Result};
use ssh_key::{HashAlg, PrivateKey};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes the private key EC2 handed back at keypair creation to `<dir>/<name>.pem`
/// (mode 0400) and its public half to `<dir>/<name>.pub`.
///
/// EC2 only returns the private key once, so an existing `.pem` is never
/// overwritten; that case is an error for the operator to resolve.
pub fn save_key_pair(dir: &Path, key_name: &str, material: &str) -> Result<PathBuf> {
    let key = PrivateKey::from_openssh(material).context("failed to parse key material")?;
    let public = key
        .public_key()
        .to_openssh()
        .context("failed to encode public key")?;

    let key_path = dir.join(format!("{key_name}.pem"));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(&key_path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                anyhow!(
                    "{} already exists, refusing to overwrite a private key",
                    key_path.display()
                )
            } else {
                anyhow!(e).context(format!("failed to create {}", key_path.display()))
            }
        })?;
    file.write_all(material.as_bytes())
        .with_context(|| format!("failed to write {}", key_path.display()))?;
    // mode() is filtered by the umask on create
    fs::set_permissions(&key_path, fs::Permissions::from_mode(0o400))?;

    let pub_path = dir.join(format!("{key_name}.pub"));
    fs::write(&pub_path, public + "\n")
        .with_context(|| format!("failed to write {}", pub_path.display()))?;

    info!(
        key = key_name,
        fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
        path = %key_path.display(),
        "private key saved"
    );
    Ok(key_path)
}
