use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Account the dashboard signs in as.
    pub operator: Option<OperatorConfig>,
    /// Accounts accepted by the local authenticator. Ignored by the `rest`
    /// backend, which authenticates against the hosted service.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
    /// IANA zone that decides what "today" means. Defaults to the system zone.
    pub time_zone: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            time_zone: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory {
        #[serde(default)]
        seed_demo: bool,
    },
    Sqlite {
        path: PathBuf,
    },
    Rest {
        url: String,
        anon_key: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Memory { seed_demo: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub email: String,
    pub password: String,
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

const DEMO_EMAIL: &str = "operator@fogwatch.local";
const DEMO_PASSWORD: &str = "fogwatch";

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backend: BackendConfig::default(),
            operator: Some(OperatorConfig {
                email: DEMO_EMAIL.to_owned(),
                password: DEMO_PASSWORD.to_owned(),
            }),
            users: vec![UserConfig {
                email: DEMO_EMAIL.to_owned(),
                password: DEMO_PASSWORD.to_owned(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rest_backend() {
        let config: Config = toml::from_str(
            r#"
            [server]
            http_addr = "127.0.0.1:3000"
            time_zone = "Asia/Manila"

            [backend]
            type = "rest"
            url = "https://project.supabase.co"
            anon_key = "public"

            [operator]
            email = "ops@up.edu.ph"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.http_addr.port(), 3000);
        assert_eq!(config.server.time_zone.as_deref(), Some("Asia/Manila"));
        assert!(matches!(config.backend, BackendConfig::Rest { ref url, .. } if url == "https://project.supabase.co"));
        assert_eq!(config.operator.unwrap().email, "ops@up.edu.ph");
        assert!(config.users.is_empty());
    }

    #[test]
    fn parses_sqlite_backend_with_local_users() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            type = "sqlite"
            path = "fogwatch.db"

            [[users]]
            email = "a@up.edu.ph"
            password = "x"

            [[users]]
            email = "b@up.edu.ph"
            password = "y"
            "#,
        )
        .unwrap();

        assert!(matches!(config.backend, BackendConfig::Sqlite { ref path } if path == Path::new("fogwatch.db")));
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.server.http_addr.port(), 8080);
        assert!(config.operator.is_none());
    }

    #[test]
    fn memory_backend_defaults_to_unseeded() {
        let config: Config = toml::from_str("[backend]\ntype = \"memory\"\n").unwrap();
        assert!(matches!(config.backend, BackendConfig::Memory { seed_demo: false }));
    }

    #[test]
    fn default_config_can_sign_in_locally() {
        let config = Config::default();
        let operator = config.operator.unwrap();

        assert!(config.users.iter().any(|user| user.email == operator.email));
    }
}
