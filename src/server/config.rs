use std::path::PathBuf;

/// Server configuration, read from the environment.
///
/// - `MEALSYNC_PORT`: port to listen on (default: 8080)
/// - `MEALSYNC_DATA_DIR`: where per-user collections live
///   (default: <data dir>/mealsync-server)
/// - `MEALSYNC_CONFIG`: API key file
///   (default: <config dir>/mealsync-server/config.yaml)
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("MEALSYNC_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = lookup("MEALSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mealsync-server")
            });

        let config_path = lookup("MEALSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mealsync-server")
                    .join("config.yaml")
            });

        Self {
            port,
            data_dir,
            config_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MEALSYNC_PORT", "9090"),
            ("MEALSYNC_DATA_DIR", "/srv/mealsync"),
            ("MEALSYNC_CONFIG", "/etc/mealsync.yaml"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 9090);
        assert_eq!(config.data_dir, PathBuf::from("/srv/mealsync"));
        assert_eq!(config.config_path, PathBuf::from("/etc/mealsync.yaml"));
    }

    #[test]
    fn test_bad_port_falls_back() {
        let config = ServerConfig::from_lookup(|k| (k == "MEALSYNC_PORT").then(|| "x".to_string()));
        assert_eq!(config.port, 8080);
    }
}
