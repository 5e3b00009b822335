use anyhow::{anyhow, Context, Result};
use clap::Args;
use serde::{de, Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Deploy settings as they arrive from flags, the environment or a settings file.
/// Every field is optional here; [`RawSettings::resolve`] enforces presence.
#[derive(Args, Deserialize, Default, Clone)]
pub struct RawSettings {
    /// AWS access key id
    #[clap(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    #[serde(default)]
    pub aws_access_key_id: Option<String>,

    /// AWS secret access key
    #[clap(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,

    /// AWS region
    #[clap(long, env = "AWS_DEFAULT_REGION")]
    #[serde(default)]
    pub aws_default_region: Option<String>,

    /// Security group name
    #[clap(long, env = "AWS_SECURITY_GROUP_NAME")]
    #[serde(default)]
    pub aws_security_group_name: Option<String>,

    /// EC2 instance type
    #[clap(long, env = "AWS_INSTANCE_TYPE")]
    #[serde(default)]
    pub aws_instance_type: Option<String>,

    /// AMI id to launch from
    #[clap(long, env = "AWS_AMI_ID")]
    #[serde(default)]
    pub aws_ami_id: Option<String>,

    /// AWS keypair name
    #[clap(long, env = "AWS_SSH_KEY_NAME")]
    #[serde(default)]
    pub aws_ssh_key_name: Option<String>,

    /// SSH port opened in the security group
    #[clap(long, env = "AWS_SSH_PORT")]
    #[serde(default, deserialize_with = "string_or_number")]
    pub aws_ssh_port: Option<String>,
}

/// Settings files may write a port either as `"22"` or as `22`.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a string or a number, found {other}"
        ))),
    }
}

impl RawSettings {
    pub fn from_file(path: &Path) -> Result<RawSettings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings file {}", path.display()))
    }

    /// Fills every field still unset in `self` from `fallback`.
    pub fn or(self, fallback: RawSettings) -> RawSettings {
        RawSettings {
            aws_access_key_id: self.aws_access_key_id.or(fallback.aws_access_key_id),
            aws_secret_access_key: self
                .aws_secret_access_key
                .or(fallback.aws_secret_access_key),
            aws_default_region: self.aws_default_region.or(fallback.aws_default_region),
            aws_security_group_name: self
                .aws_security_group_name
                .or(fallback.aws_security_group_name),
            aws_instance_type: self.aws_instance_type.or(fallback.aws_instance_type),
            aws_ami_id: self.aws_ami_id.or(fallback.aws_ami_id),
            aws_ssh_key_name: self.aws_ssh_key_name.or(fallback.aws_ssh_key_name),
            aws_ssh_port: self.aws_ssh_port.or(fallback.aws_ssh_port),
        }
    }

    pub fn resolve(self) -> Result<Settings> {
        let mut missing = Vec::new();
        let mut take = |value: Option<String>, name: &'static str| match value {
            Some(v) if !v.trim().is_empty() => v,
            _ => {
                missing.push(name.to_uppercase());
                String::new()
            }
        };

        let aws_access_key_id = take(self.aws_access_key_id, "aws_access_key_id");
        let aws_secret_access_key = take(self.aws_secret_access_key, "aws_secret_access_key");
        let aws_default_region = take(self.aws_default_region, "aws_default_region");
        let aws_security_group_name =
            take(self.aws_security_group_name, "aws_security_group_name");
        let aws_instance_type = take(self.aws_instance_type, "aws_instance_type");
        let aws_ami_id = take(self.aws_ami_id, "aws_ami_id");
        let aws_ssh_key_name = take(self.aws_ssh_key_name, "aws_ssh_key_name");
        let aws_ssh_port = take(self.aws_ssh_port, "aws_ssh_port");

        if !missing.is_empty() {
            return Err(anyhow!(
                "missing deploy settings: {}; set them in the environment or the settings file",
                missing.join(", ")
            ));
        }

        let aws_ssh_port = aws_ssh_port
            .trim()
            .parse::<u16>()
            .with_context(|| format!("AWS_SSH_PORT is not a valid port: {aws_ssh_port}"))?;

        Ok(Settings {
            aws_access_key_id,
            aws_secret_access_key,
            aws_default_region,
            aws_security_group_name,
            aws_instance_type,
            aws_ami_id,
            aws_ssh_key_name,
            aws_ssh_port,
        })
    }
}

#[derive(Clone)]
pub struct Settings {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_default_region: String,
    pub aws_security_group_name: String,
    pub aws_instance_type: String,
    pub aws_ami_id: String,
    pub aws_ssh_key_name: String,
    pub aws_ssh_port: u16,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"<redacted>")
            .field("aws_default_region", &self.aws_default_region)
            .field("aws_security_group_name", &self.aws_security_group_name)
            .field("aws_instance_type", &self.aws_instance_type)
            .field("aws_ami_id", &self.aws_ami_id)
            .field("aws_ssh_key_name", &self.aws_ssh_key_name)
            .field("aws_ssh_port", &self.aws_ssh_port)
            .finish()
    }
}

/// On-disk layout rooted at the project directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Layout {
        Layout { root: root.into() }
    }

    pub fn deploy_dir(&self) -> PathBuf {
        self.root.join("deploy")
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.deploy_dir().join("ssh")
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.deploy_dir().join("fab_hosts")
    }

    pub fn app_settings_file(&self) -> PathBuf {
        self.deploy_dir().join("settings.json")
    }

    pub fn chef_dir(&self) -> PathBuf {
        self.root.join("chef_files")
    }

    pub fn key_path(&self, key_name: &str) -> PathBuf {
        self.ssh_dir().join(format!("{key_name}.pem"))
    }
}

/// `deploy/settings.json`. Kept as a raw object so keys this tool does not
/// know about survive a rewrite.
#[derive(Debug, Clone, Default)]
pub struct AppSettings {
    values: Map<String, Value>,
}

impl AppSettings {
    pub fn load(path: &Path) -> Result<AppSettings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read app settings {}", path.display()))?;
        let values: Map<String, Value> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse app settings {}", path.display()))?;
        Ok(AppSettings { values })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(&self.values).context("failed to encode app settings")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write app settings {}", path.display()))
    }

    pub fn app_name(&self) -> Result<&str> {
        self.values
            .get("APP_NAME")
            .and_then(Value::as_str)
            .ok_or(anyhow!("APP_NAME missing from app settings"))
    }

    pub fn ec2_dns(&self) -> Option<&str> {
        self.values.get("EC2_DNS").and_then(Value::as_str)
    }

    pub fn set_ec2_dns(&mut self, address: &str) {
        self.values
            .insert("EC2_DNS".to_owned(), Value::String(address.to_owned()));
    }
}
