//! CLI 配置管理
//!
//! **数据存储方式**: TOML 文件 (~/.config/vcm/config.toml)，`--config` 可指定其他路径。
//! 用户名和密码可由环境变量 `VCM_USERNAME` / `VCM_PASSWORD` 覆盖。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use vcm_orchestrator::OrchestratorConfig;
use vcm_vimclient::ServerConfig;

/// 用户名环境变量
pub const ENV_USERNAME: &str = "VCM_USERNAME";

/// 密码环境变量
pub const ENV_PASSWORD: &str = "VCM_PASSWORD";

/// CLI 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// 管理服务器连接
    #[serde(default)]
    pub server: ServerSection,

    /// 编排引擎参数
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// 管理服务器连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// 服务器地址
    #[serde(default = "default_url")]
    pub url: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// 超时与 SSL 设置
    #[serde(flatten)]
    pub client: ServerConfig,
}

fn default_url() -> String {
    "https://localhost/sdk".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            client: ServerConfig::default(),
        }
    }
}

impl ServerSection {
    /// 获取登录凭据
    pub fn credentials(&self) -> Result<(&str, &str)> {
        let username = self
            .username
            .as_deref()
            .with_context(|| format!("未配置用户名 (设置 server.username 或 {})", ENV_USERNAME))?;
        let password = self
            .password
            .as_deref()
            .with_context(|| format!("未配置密码 (设置 server.password 或 {})", ENV_PASSWORD))?;
        Ok((username, password))
    }
}

impl CliConfig {
    /// 获取默认配置文件路径
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("无法获取用户主目录")?;
        Ok(home.join(".config").join("vcm").join("config.toml"))
    }

    /// 加载配置并应用环境变量覆盖
    ///
    /// 未指定路径且默认文件不存在时使用默认配置；显式指定的文件必须存在。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let path = Self::config_path()?;
                if path.exists() {
                    Self::load_from(&path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(
            std::env::var(ENV_USERNAME).ok(),
            std::env::var(ENV_PASSWORD).ok(),
        );
        Ok(config)
    }

    /// 从指定文件加载
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("解析配置文件失败: {:?}", path))
    }

    /// 解析 TOML 配置
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 用环境变量的值覆盖凭据，空值忽略
    pub fn apply_env(&mut self, username: Option<String>, password: Option<String>) {
        if let Some(username) = username.filter(|v| !v.is_empty()) {
            self.server.username = Some(username);
        }
        if let Some(password) = password.filter(|v| !v.is_empty()) {
            self.server.password = Some(password);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.server.url, "https://localhost/sdk");
        assert!(config.server.username.is_none());
        assert_eq!(config.server.client.connect_timeout, 10);
        assert_eq!(config.orchestrator.max_poll_read_failures, 3);
        assert!(config.orchestrator.name_retry.max_attempts.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = CliConfig::parse(
            r#"
            [server]
            url = "https://vcenter.lab/sdk"
            username = "administrator"
            password = "secret"
            request_timeout = 120
            verify_ssl = false

            [orchestrator]
            poll_interval_ms = 500
            min_free_space_gb = 50
            default_resource_pool = "pool-a"

            [orchestrator.name_retry]
            max_attempts = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.server.url, "https://vcenter.lab/sdk");
        assert_eq!(
            config.server.credentials().unwrap(),
            ("administrator", "secret")
        );
        assert_eq!(config.server.client.request_timeout, 120);
        assert_eq!(config.server.client.connect_timeout, 10);
        assert!(!config.server.client.verify_ssl);

        assert_eq!(config.orchestrator.poll_interval_ms, 500);
        assert_eq!(config.orchestrator.question_settle_ms, 2000);
        assert_eq!(config.orchestrator.min_free_space_gb, Some(50));
        assert_eq!(
            config.orchestrator.default_resource_pool.as_deref(),
            Some("pool-a")
        );
        assert_eq!(config.orchestrator.name_retry.max_attempts, Some(8));
    }

    #[test]
    fn test_env_overrides_credentials() {
        let mut config = CliConfig::parse(
            r#"
            [server]
            username = "file-user"
            password = "file-pass"
            "#,
        )
        .unwrap();

        config.apply_env(Some("env-user".to_string()), Some(String::new()));
        assert_eq!(config.server.credentials().unwrap(), ("env-user", "file-pass"));
    }

    #[test]
    fn test_missing_credentials() {
        let config = CliConfig::default();
        assert!(config.server.credentials().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nurl = \"https://esx.lab/sdk\"\n\n[orchestrator]\ndefault_host = \"esx-01\"\n",
        )
        .unwrap();

        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded.server.url, "https://esx.lab/sdk");
        assert_eq!(loaded.orchestrator.default_host.as_deref(), Some("esx-01"));
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[server\nurl = 1").unwrap();

        let err = CliConfig::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.toml"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(CliConfig::load(Some(&path)).is_err());
    }
}
