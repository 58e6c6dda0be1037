use super::Config;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// File names searched for, in order, in each directory.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["vmports.yaml", "vmports.yml"];

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Find config file starting from current directory
    pub fn find_config_file(&self) -> Result<PathBuf> {
        let current_dir = std::env::current_dir()?;
        Self::find_config_in_dir(&current_dir)
    }

    pub fn find_config_in_dir(dir: &Path) -> Result<PathBuf> {
        for name in CONFIG_FILE_NAMES {
            let path = dir.join(name);
            if path.exists() {
                return Ok(path);
            }
        }

        // Try parent directory
        if let Some(parent) = dir.parent() {
            return Self::find_config_in_dir(parent);
        }

        Err(Error::Config(
            "Could not find vmports.yaml in current directory or any parent".to_string(),
        ))
    }

    /// Load config from file path
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<Config> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        self.parse_config(&content)
    }

    /// Parse config from YAML string
    pub fn parse_config(&self, content: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| Error::Parse(format!("Failed to parse YAML config: {}", e)))?;

        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{HostIp, Protocol};

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
repair: false
machines:
  - name: web
    forwarded_ports:
      - id: ssh
        guest: 22
        host: 2222
        auto_correct: true
      - guest: 53
        host: 5353
        host_ip: 127.0.0.1
        protocol: udp
  - name: db
"#;

        let parser = Parser::new();
        let config = parser.parse_config(yaml).unwrap();

        assert!(!config.repair);
        assert_eq!(config.machines.len(), 2);
        assert_eq!(config.machines[1].name, "db");

        let rules = &config.machines[0].forwarded_ports;
        assert_eq!(rules[0].effective_id(), "ssh");
        assert!(rules[0].auto_correct);
        assert_eq!(rules[0].host_ip, HostIp::Wildcard);
        assert_eq!(rules[1].protocol, Protocol::Udp);
        assert_eq!(rules[1].host_ip, "127.0.0.1".parse().unwrap());
    }

    #[test]
    fn test_empty_host_ip_is_wildcard() {
        let yaml = r#"
machines:
  - name: web
    forwarded_ports:
      - { guest: 80, host: 8080, host_ip: "" }
      - { guest: 81, host: 8081, host_ip: ~ }
"#;
        let config = Parser::new().parse_config(yaml).unwrap();
        let rules = &config.machines[0].forwarded_ports;
        assert!(rules.iter().all(|r| r.host_ip == HostIp::Wildcard));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = Parser::new().parse_config("machines: [").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_find_config_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vmports.yml"), "machines: []\n").unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();

        let found = Parser::find_config_in_dir(&nested).unwrap();
        assert_eq!(found, dir.path().join("vmports.yml"));
    }
}
