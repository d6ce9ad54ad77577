//! 复用层的声明式配置。
//!
//! 配置文件为 TOML，时长统一以毫秒表示；缺省字段取 [`Default`] 中的值，未知字段直接报错，
//! 以免拼写错误的键被静默忽略。
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8300"
//! enforce_secure = true
//! handshake_timeout_ms = 5000
//!
//! [pool]
//! idle_timeout_ms = 60000
//!
//! [tls]
//! ca_file = "/etc/spark/ca.pem"
//! cert_file = "/etc/spark/node.pem"
//! key_file = "/etc/spark/node-key.pem"
//! ```

use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    error::{ErrorCategory, ErrorClass},
    version::MuxVersion,
};

/// 服务端默认监听端口。
pub const DEFAULT_PORT: u16 = 8300;
/// 握手读截止的默认值。
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// 配置加载或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl ErrorClass for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "spark.mux.config.unreadable",
            ConfigError::Parse(_) => "spark.mux.config.malformed",
            ConfigError::Invalid { .. } => "spark.mux.config.invalid_value",
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

/// 顶层配置。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MuxConfig {
    pub server: ServerSettings,
    pub pool: PoolSettings,
    /// 缺省时不启用 TLS 升级。
    pub tls: Option<TlsFiles>,
}

impl MuxConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: MuxConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 读取并解析配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 校验字段取值。
    ///
    /// `enforce_secure` 在未配置 TLS 时没有意义，只记录告警而不拒绝启动：此时所有明文连接照常放行。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.dial_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "pool.dial_timeout_ms",
                reason: "must be greater than zero",
            });
        }
        if self.pool.reap_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "pool.reap_interval_ms",
                reason: "must be greater than zero",
            });
        }
        if self.pool.version.wire_format().is_none() {
            return Err(ConfigError::Invalid {
                field: "pool.version",
                reason: "unknown mux version",
            });
        }
        if let Some(tls) = &self.tls
            && tls.server_name.trim().is_empty()
        {
            return Err(ConfigError::Invalid {
                field: "tls.server_name",
                reason: "must not be empty",
            });
        }
        if self.server.enforce_secure && self.tls.is_none() {
            warn!(
                target: "spark::mux::config",
                "server.enforce_secure is set but no [tls] section is configured; plaintext connections stay allowed"
            );
        }
        Ok(())
    }
}

/// 分发器配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    /// 配置了入站 TLS 时，拒绝未经升级的明文协议标识。
    pub enforce_secure: bool,
    /// 握手每一步的读截止，零表示不设截止。
    pub handshake_timeout_ms: u64,
}

impl ServerSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            enforce_secure: false,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// 连接池配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// 空闲超过该时长的连接会被回收；零表示永不回收。
    pub idle_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub reap_interval_ms: u64,
    /// 拨号时使用的复用版本。
    pub version: MuxVersion,
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 0,
            dial_timeout_ms: 10_000,
            reap_interval_ms: 1_000,
            version: MuxVersion::CURRENT,
        }
    }
}

/// PEM 形式的证书材料位置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// 拨号方校验对端证书时期望的名称。
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_server_name() -> String {
    "localhost".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = MuxConfig::from_toml_str("").expect("defaults");
        assert_eq!(config, MuxConfig::default());
        assert_eq!(config.server.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.server.handshake_timeout(), DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(config.pool.reap_interval(), Duration::from_secs(1));
        assert!(config.pool.idle_timeout().is_zero());
        assert_eq!(config.pool.version, MuxVersion::V2);
    }

    #[test]
    fn parses_full_document() {
        let config = MuxConfig::from_toml_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:9000"
            enforce_secure = true
            handshake_timeout_ms = 250

            [pool]
            idle_timeout_ms = 30000
            version = 1

            [tls]
            ca_file = "ca.pem"
            cert_file = "node.pem"
            key_file = "node-key.pem"
            "#,
        )
        .expect("valid config");
        assert!(config.server.enforce_secure);
        assert_eq!(config.server.handshake_timeout(), Duration::from_millis(250));
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.pool.version, MuxVersion::V1);
        let tls = config.tls.expect("tls section");
        assert_eq!(tls.server_name, "localhost");
        assert_eq!(tls.key_file, PathBuf::from("node-key.pem"));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        let err = MuxConfig::from_toml_str("[server]\nlisten = \"x\"").expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = MuxConfig::from_toml_str("[pool]\nreap_interval_ms = 0").expect_err("zero tick");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "pool.reap_interval_ms",
                ..
            }
        ));

        let err = MuxConfig::from_toml_str("[pool]\nversion = 9").expect_err("unknown version");
        assert_eq!(err.code(), "spark.mux.config.invalid_value");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = MuxConfig::load("/nonexistent/spark-mux.toml").expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
