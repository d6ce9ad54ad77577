use std::{io, time::Duration};

use spark_mux::{ErrorCategory, ErrorClass, HandshakeError, ProtocolIdError};
use spark_mux_rpc::RpcError;
use thiserror::Error;

/// 连接池调用错误。
#[derive(Debug, Error)]
pub enum PoolError {
    /// 同步调用没有提供回复目标，在任何网络活动之前返回。
    #[error("call needs a reply target")]
    MissingReplyTarget,
    /// 协议名不是合法的协议标识。
    #[error("invalid protocol name: {0}")]
    InvalidProtocol(#[source] ProtocolIdError),
    /// 连接池已关闭。
    #[error("connection pool is closed")]
    Closed,
    /// TCP 建连失败。
    #[error("failed to dial {key}: {source}")]
    Dial {
        key: String,
        #[source]
        source: io::Error,
    },
    /// 建连与握手超过拨号超时。
    #[error("dialing {key} timed out after {limit:?}")]
    DialTimeout { key: String, limit: Duration },
    /// 客户端握手失败。
    #[error("handshake with {key} failed: {source}")]
    Handshake {
        key: String,
        #[source]
        source: HandshakeError,
    },
    /// 新建连接在给出任何应答之前被对端关闭，通常是对端不支持该协议或要求 TLS。
    #[error("{key} closed the connection before replying; protocol rejected")]
    ProtocolRejected { key: String },
    /// 调用失败，承载它的连接已被驱逐。
    #[error("call on {key} failed: {source}")]
    Call {
        key: String,
        #[source]
        source: RpcError,
    },
}

impl PoolError {
    /// 是否属于“无法获得连接”一类。
    pub fn is_no_client(&self) -> bool {
        matches!(
            self,
            PoolError::Dial { .. } | PoolError::DialTimeout { .. } | PoolError::Handshake { .. }
        )
    }
}

impl ErrorClass for PoolError {
    fn code(&self) -> &'static str {
        match self {
            PoolError::MissingReplyTarget => "spark.mux.pool.missing_reply_target",
            PoolError::InvalidProtocol(_) => "spark.mux.pool.invalid_protocol",
            PoolError::Closed => "spark.mux.pool.closed",
            PoolError::Dial { .. } => "spark.mux.pool.dial_failed",
            PoolError::DialTimeout { .. } => "spark.mux.pool.dial_timeout",
            PoolError::Handshake { .. } => "spark.mux.pool.handshake_failed",
            PoolError::ProtocolRejected { .. } => "spark.mux.pool.protocol_rejected",
            PoolError::Call { .. } => "spark.mux.pool.call_failed",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            PoolError::MissingReplyTarget | PoolError::InvalidProtocol(_) | PoolError::Closed => {
                ErrorCategory::CallerContract
            }
            PoolError::Dial { .. } => ErrorCategory::Transport,
            PoolError::DialTimeout { .. } => ErrorCategory::Timeout,
            PoolError::Handshake { source, .. } => source.category(),
            PoolError::ProtocolRejected { .. } => ErrorCategory::ProtocolMismatch,
            PoolError::Call { .. } => ErrorCategory::CallFailed,
        }
    }
}
