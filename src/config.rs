use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::fs::File;
use std::io::prelude::*;

use crate::exception::Exception;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    port: u16,
    local: bool,
    worker_threads: usize,
    #[serde(default = "default_max_header_size")]
    max_header_size: usize,
    #[serde(default = "default_max_body_size")]
    max_body_size: usize,
    #[serde(default = "default_header_timeout_secs")]
    header_timeout_secs: u64,
    #[serde(default)]
    case_sensitive_routing: bool,
}

fn default_max_header_size() -> usize {
    8192 // 8KB
}

fn default_max_body_size() -> usize {
    10485760 // 10MB
}

fn default_header_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            port: 7878,
            local: true,
            worker_threads: 0,
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            header_timeout_secs: default_header_timeout_secs(),
            case_sensitive_routing: false,
        }
    }

    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let mut file = File::open(filename)
            .map_err(|e| Exception::Config(format!("no such file {}: {}", filename, e)))?;
        let mut str_val = String::new();
        file.read_to_string(&mut str_val)
            .map_err(|e| Exception::Config(format!("error reading file {}: {}", filename, e)))?;
        Ok(Self::from_toml_str(&str_val))
    }

    pub fn from_toml_str(content: &str) -> Self {
        let mut raw_config: Config = match toml::from_str(content) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                Config::new()
            }
        };
        if raw_config.worker_threads == 0 {
            raw_config.worker_threads = num_cpus::get();
        }
        if raw_config.max_header_size == 0 {
            warn!("max_header_size被设置为0，这会拒绝所有请求，因此该值将被改为默认值。");
            raw_config.max_header_size = default_max_header_size();
        }
        raw_config
    }
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub fn header_timeout_secs(&self) -> u64 {
        self.header_timeout_secs
    }

    pub fn case_sensitive_routing(&self) -> bool {
        self.case_sensitive_routing
    }

    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn set_max_header_size(&mut self, size: usize) -> &mut Self {
        self.max_header_size = size;
        self
    }

    pub fn set_max_body_size(&mut self, size: usize) -> &mut Self {
        self.max_body_size = size;
        self
    }

    pub fn set_header_timeout_secs(&mut self, secs: u64) -> &mut Self {
        self.header_timeout_secs = secs;
        self
    }

    pub fn set_case_sensitive_routing(&mut self, case_sensitive: bool) -> &mut Self {
        self.case_sensitive_routing = case_sensitive;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 9000\nlocal = false\nworker_threads = 3\nmax_body_size = 1024\ncase_sensitive_routing = true"
        )
        .unwrap();

        let config = Config::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port(), 9000);
        assert!(!config.local());
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.max_body_size(), 1024);
        assert_eq!(config.max_header_size(), 8192);
        assert_eq!(config.header_timeout_secs(), 30);
        assert!(config.case_sensitive_routing());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_toml("/definitely/not/here.toml"),
            Err(Exception::Config(_))
        ));
    }

    #[test]
    fn test_malformed_toml_falls_back_to_defaults() {
        let config = Config::from_toml_str("port = \"not a number\"");
        assert_eq!(config.port(), 7878);
        assert!(config.worker_threads() > 0);
    }

    #[test]
    fn test_zero_header_size_is_replaced() {
        let config = Config::from_toml_str(
            "port = 1\nlocal = true\nworker_threads = 1\nmax_header_size = 0",
        );
        assert_eq!(config.max_header_size(), 8192);
    }
}
