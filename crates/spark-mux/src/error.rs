//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为复用层的注册表与握手阶段提供集中定义的错误语义；
//! - 每个错误都携带稳定错误码与 [`ErrorCategory`]，运维脚本与测试无需解析文案即可区分
//!   “版本不匹配”“协议名不匹配”“安全策略拒绝”等情形。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`；
//! - 错误码遵循 `spark.mux.<域>.<原因>` 命名；
//! - 分类只描述处置方式（重试、告警、修正配置），不承载具体原因。

use std::{io, time::Duration};

use thiserror::Error;

use crate::{protocol::ProtocolId, version::MuxVersion};

/// 错误分类，决定调用方的处置策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 注册/配置输入不合法，需要修正调用方代码或配置，绝不重试。
    Configuration,
    /// 网络 IO 失败，对当前套接字致命；是否重试由调用方在下一次调用时决定。
    Transport,
    /// 握手读截止或拨号超时。
    Timeout,
    /// 版本或协议标识未被对端支持。
    ProtocolMismatch,
    /// 证书、TLS 握手或“强制加密”策略拒绝。
    Security,
    /// 远端调用失败，承载该调用的物理连接视为已污染。
    CallFailed,
    /// 调用方违反 API 约定（例如缺少回复目标），在任何网络活动之前返回。
    CallerContract,
}

/// 为错误提供稳定错误码与分类的统一视图。
pub trait ErrorClass {
    /// 稳定错误码，例如 `spark.mux.registry.reserved_name`。
    fn code(&self) -> &'static str;

    /// 错误分类。
    fn category(&self) -> ErrorCategory;
}

/// 协议标识的格式错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolIdError {
    /// 去除首尾空白后为空。
    #[error("protocol identifier is empty")]
    Empty,
    /// 超过单个标识允许的最大长度。
    #[error("protocol identifier is {len} bytes long, limit is {limit}")]
    TooLong { len: usize, limit: usize },
    /// 含有非 ASCII 可见字符（包括内部空白）。
    #[error("protocol identifier `{0}` contains characters outside printable ASCII")]
    InvalidCharacter(String),
}

/// Stream Registry 的注册与查询错误。
///
/// # 教案式说明
/// - **意图 (Why)**：`UnsupportedVersion` 与 `UnsupportedProtocol` 必须可区分，测试与日志据此判断
///   是“对端版本过旧/过新”还是“协议名拼写或未注册”；
/// - **契约 (What)**：注册类错误（`Missing*`、`ReservedName`、`InvalidName`、`Unencodable`）同步返回，
///   调用方不应重试；查询类错误只出现在 `lookup`。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// 构造协议条目时未提供处理函数。
    #[error("stream protocol is missing its handler")]
    MissingHandler,
    /// 构造协议条目时名称为空。
    #[error("stream protocol needs a name")]
    MissingName,
    /// 名称不是合法的协议标识。
    #[error("stream protocol name is invalid: {0}")]
    InvalidName(ProtocolIdError),
    /// 试图覆盖 `RPCTLS` 或 `REG` 这两个内建保留标识。
    #[error("protocol `{0}` is reserved and cannot be registered")]
    ReservedName(ProtocolId),
    /// 所选版本的线格式无法承载该标识（例如 V1 的封闭枚举）。
    #[error("protocol `{protocol}` cannot be encoded by {version}")]
    Unencodable {
        version: MuxVersion,
        protocol: ProtocolId,
    },
    /// 注册表中不存在该复用版本的分发表。
    #[error("mux version {0} is not supported")]
    UnsupportedVersion(MuxVersion),
    /// 版本分发表存在，但没有绑定该协议的处理函数。
    #[error("protocol `{protocol}` is not supported by {version}")]
    UnsupportedProtocol {
        version: MuxVersion,
        protocol: String,
    },
}

impl ErrorClass for RegistryError {
    fn code(&self) -> &'static str {
        match self {
            RegistryError::MissingHandler => "spark.mux.registry.missing_handler",
            RegistryError::MissingName => "spark.mux.registry.missing_name",
            RegistryError::InvalidName(_) => "spark.mux.registry.invalid_name",
            RegistryError::ReservedName(_) => "spark.mux.registry.reserved_name",
            RegistryError::Unencodable { .. } => "spark.mux.registry.unencodable",
            RegistryError::UnsupportedVersion(_) => "spark.mux.registry.unsupported_version",
            RegistryError::UnsupportedProtocol { .. } => "spark.mux.registry.unsupported_protocol",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            RegistryError::UnsupportedVersion(_) | RegistryError::UnsupportedProtocol { .. } => {
                ErrorCategory::ProtocolMismatch
            }
            _ => ErrorCategory::Configuration,
        }
    }
}

/// 握手所处的阶段，用于错误与日志上下文。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStage {
    /// 读取/写入版本字节。
    Version,
    /// 读取/写入协议标识。
    Identifier,
    /// TLS 升级握手。
    Escalation,
}

impl std::fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HandshakeStage::Version => "version",
            HandshakeStage::Identifier => "identifier",
            HandshakeStage::Escalation => "escalation",
        })
    }
}

/// 握手阶段的错误，对当前套接字始终是致命的。
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// 首字节不是任何已知复用版本。
    #[error("unsupported mux version byte {0}")]
    UnsupportedVersion(u8),
    /// 握手 IO 失败。
    #[error("handshake {stage} failed: {source}")]
    Io {
        stage: HandshakeStage,
        #[source]
        source: io::Error,
    },
    /// 对端在握手完成前关闭了连接。
    #[error("peer closed the connection during handshake {stage}")]
    PeerClosed { stage: HandshakeStage },
    /// 超过握手读截止时间。
    #[error("handshake {stage} timed out after {limit:?}")]
    Timeout {
        stage: HandshakeStage,
        limit: Duration,
    },
    /// 分隔符形式的协议标识超过长度上限仍未读到换行。
    #[error("protocol identifier exceeds {limit} bytes")]
    IdentifierTooLong { limit: usize },
    /// 协议标识无法解析。
    #[error("malformed protocol identifier: {0}")]
    MalformedIdentifier(ProtocolIdError),
    /// 固定字节编码中出现未知取值。
    #[error("unknown fixed protocol identifier byte {0}")]
    UnknownIdentifierByte(u8),
    /// 该版本的线格式无法编码该协议标识。
    #[error("protocol `{protocol}` cannot be encoded by {version}")]
    Unencodable {
        version: MuxVersion,
        protocol: ProtocolId,
    },
    /// 对端请求 TLS 升级，但本端未配置入站 TLS。
    #[error("tls escalation requested but tls is not configured")]
    TlsNotConfigured,
    /// 在已加密的流上再次请求升级，或拨号方把升级标识当作目标协议。
    #[error("tls escalation may happen at most once per connection")]
    RepeatedEscalation,
    /// 强制加密模式下收到明文协议标识。
    #[error("plaintext protocol `{protocol}` rejected: secure transport is enforced")]
    InsecureRejected { protocol: ProtocolId },
    /// TLS 握手失败（证书校验、协商或底层 IO）。
    #[error("tls handshake failed: {source}")]
    Tls {
        #[source]
        source: io::Error,
    },
}

impl HandshakeError {
    /// 将 IO 错误映射为握手错误；`UnexpectedEof` 视为对端主动关闭。
    pub(crate) fn from_io(stage: HandshakeStage, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::UnexpectedEof => HandshakeError::PeerClosed { stage },
            _ => HandshakeError::Io { stage, source },
        }
    }
}

impl ErrorClass for HandshakeError {
    fn code(&self) -> &'static str {
        match self {
            HandshakeError::UnsupportedVersion(_) => "spark.mux.handshake.unsupported_version",
            HandshakeError::Io { .. } => "spark.mux.handshake.io_failed",
            HandshakeError::PeerClosed { .. } => "spark.mux.handshake.peer_closed",
            HandshakeError::Timeout { .. } => "spark.mux.handshake.timeout",
            HandshakeError::IdentifierTooLong { .. } => "spark.mux.handshake.identifier_too_long",
            HandshakeError::MalformedIdentifier(_) => "spark.mux.handshake.malformed_identifier",
            HandshakeError::UnknownIdentifierByte(_) => "spark.mux.handshake.unknown_identifier",
            HandshakeError::Unencodable { .. } => "spark.mux.handshake.unencodable",
            HandshakeError::TlsNotConfigured => "spark.mux.handshake.tls_not_configured",
            HandshakeError::RepeatedEscalation => "spark.mux.handshake.repeated_escalation",
            HandshakeError::InsecureRejected { .. } => "spark.mux.handshake.insecure_rejected",
            HandshakeError::Tls { .. } => "spark.mux.handshake.tls_failed",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            HandshakeError::Io { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                ErrorCategory::Timeout
            }
            HandshakeError::Io { .. } | HandshakeError::PeerClosed { .. } => {
                ErrorCategory::Transport
            }
            HandshakeError::Timeout { .. } => ErrorCategory::Timeout,
            HandshakeError::UnsupportedVersion(_)
            | HandshakeError::IdentifierTooLong { .. }
            | HandshakeError::MalformedIdentifier(_)
            | HandshakeError::UnknownIdentifierByte(_)
            | HandshakeError::Unencodable { .. }
            | HandshakeError::RepeatedEscalation => ErrorCategory::ProtocolMismatch,
            HandshakeError::TlsNotConfigured
            | HandshakeError::InsecureRejected { .. }
            | HandshakeError::Tls { .. } => ErrorCategory::Security,
        }
    }
}
