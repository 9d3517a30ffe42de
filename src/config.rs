use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_PORT: u16 = 4064;

/// Environment variable overriding the credential file location
pub const CREDENTIALS_ENV: &str = "OMERO_TRANSFER_CREDENTIALS";

/// Login details for the image server
///
/// Stored as YAML with the keys `user`, `password`, `address` and
/// optionally `port` and `web_url`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL of the web gateway, when it is not served from `address:port`
    #[serde(default)]
    pub web_url: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("web_url", &self.web_url)
            .finish()
    }
}

impl Credentials {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Credentials {
            user: user.into(),
            password: password.into(),
            address: address.into(),
            port: DEFAULT_PORT,
            web_url: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user.trim().is_empty() {
            return Err(ConfigError::MissingField("user"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::MissingField("password"));
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingField("address"));
        }
        Ok(())
    }

    /// Parse and validate credentials from YAML text
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let credentials: Credentials = serde_yaml::from_str(text)?;
        credentials.validate()?;
        Ok(credentials)
    }

    /// Command-line style login arguments for a server session
    pub fn login_args(&self) -> Vec<String> {
        vec![
            format!("-u{}", self.user),
            format!("-w{}", self.password),
            format!("-s{}", self.address),
            format!("-p{}", self.port),
        ]
    }

    /// [`Credentials::login_args`] with the password masked, for logging
    pub fn redacted_login_args(&self) -> Vec<String> {
        self.login_args()
            .into_iter()
            .map(|arg| {
                if arg.starts_with("-w") {
                    "-w****".to_string()
                } else {
                    arg
                }
            })
            .collect()
    }

    /// Base URL for the web gateway
    ///
    /// Without `web_url` this falls back to `http://{address}:{port}`. The
    /// default port 4064 is the server's session port, not the web port, so a
    /// real gateway normally needs `web_url` set.
    pub fn base_url(&self) -> String {
        match &self.web_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.address, self.port),
        }
    }
}

/// Application configuration
///
/// Built once by the caller and handed to [`crate::client::OmeroClient`].
#[derive(Clone, Debug)]
pub struct Config {
    pub credentials_path: PathBuf,
    pub credentials: Credentials,
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A `.env` file is honoured in debug builds so `OMERO_TRANSFER_CREDENTIALS`
    /// can point at a development server.
    pub fn load() -> Result<Self, ConfigError> {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                tracing::debug!("Config: loaded .env file");
            }
        }

        let path = Self::default_credentials_path()?;
        Self::from_path(path)
    }

    /// Load configuration from an explicit credential file
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let credentials_path = path.into();
        let text = std::fs::read_to_string(&credentials_path).map_err(|source| ConfigError::Io {
            path: credentials_path.clone(),
            source,
        })?;
        let credentials = Credentials::from_yaml(&text)?;

        info!(
            "Config: loaded credentials for {}@{}:{} from {}",
            credentials.user,
            credentials.address,
            credentials.port,
            credentials_path.display()
        );

        Ok(Config {
            credentials_path,
            credentials,
        })
    }

    /// Build a configuration from credentials already in memory
    pub fn from_credentials(credentials: Credentials) -> Result<Self, ConfigError> {
        credentials.validate()?;
        Ok(Config {
            credentials_path: PathBuf::new(),
            credentials,
        })
    }

    /// `$OMERO_TRANSFER_CREDENTIALS`, else `<config dir>/omero-transfer/credentials.yaml`
    pub fn default_credentials_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CREDENTIALS_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(credentials_path_in(&config_dir))
    }
}

fn credentials_path_in(config_dir: &Path) -> PathBuf {
    config_dir.join("omero-transfer").join("credentials.yaml")
}
