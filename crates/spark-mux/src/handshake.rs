//! 连接握手：版本字节、协议标识与可选的一次 TLS 升级。
//!
//! # 教案式说明
//!
//! ## 线格式
//! ```text
//! +---------+---------------------+   +---------------- TLS ----------------+
//! | version | identifier(version) | → | identifier(version)  (仅当上一步为 RPCTLS) |
//! +---------+---------------------+   +-------------------------------------+
//! ```
//! - 版本字节之后的标识编码由 [`MuxVersion::wire_format`] 决定；
//! - 标识为 `RPCTLS` 时，双方把原始连接包装为 TLS，然后在加密流上重新读取一次标识。
//!
//! ## 状态机（受理方）
//! `AwaitVersion → AwaitIdentifier → {TlsEscalate → AwaitIdentifier(加密) | Dispatch}`。
//! 升级以循环加 `secured` 标志表达，最多一次；已加密的流上再次出现 `RPCTLS` 直接拒绝。
//!
//! ## 风险 (Trade-offs)
//! - 每个读取步骤各自受读截止约束，因此慢速对端最长占用 `3 × read_timeout`（版本、标识、TLS），
//!   升级后再加一次标识读取；
//! - 任何失败都使握手函数返回错误并丢弃流，套接字随之关闭，不向对端回写错误信息。

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::{
    config::DEFAULT_HANDSHAKE_TIMEOUT,
    error::{HandshakeError, HandshakeStage},
    protocol::ProtocolId,
    stream::{BoxedStream, MuxStream},
    tls::{ClientTls, InboundTls},
    util::{io_at, within},
    version::MuxVersion,
};

/// 受理方的握手策略。
#[derive(Clone, Debug)]
pub struct AcceptPolicy {
    /// 每一步读取的截止时间，零表示不设截止。
    pub read_timeout: Duration,
    /// 配置了 `tls` 时，拒绝未经升级的明文标识。
    pub enforce_secure: bool,
    /// 入站 TLS；缺省时对端请求升级会被拒绝。
    pub tls: Option<InboundTls>,
}

impl Default for AcceptPolicy {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            enforce_secure: false,
            tls: None,
        }
    }
}

/// 握手完成后的分类结果。
pub struct Classified {
    /// 位于握手末尾的流；若发生升级则为 TLS 流。
    pub stream: BoxedStream,
    pub version: MuxVersion,
    pub protocol: ProtocolId,
    pub secured: bool,
}

impl std::fmt::Debug for Classified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classified")
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .field("secured", &self.secured)
            .finish_non_exhaustive()
    }
}

/// 拨号方握手。
///
/// # 契约 (What)
/// - 写出版本字节；若提供 `tls`，先写出 `RPCTLS` 并完成客户端 TLS 握手；最后写出 `protocol` 并 flush；
/// - `protocol` 不能是 `RPCTLS` 本身，升级只能通过 `tls` 参数请求；
/// - 所有字节写出之前先确认版本的线格式能承载标识，失败时不产生任何网络写入。
pub async fn dial<S>(
    stream: S,
    version: MuxVersion,
    protocol: &ProtocolId,
    tls: Option<&ClientTls>,
) -> Result<BoxedStream, HandshakeError>
where
    S: MuxStream,
{
    if protocol.is_escalation() {
        return Err(HandshakeError::RepeatedEscalation);
    }
    let format = version
        .wire_format()
        .ok_or(HandshakeError::UnsupportedVersion(version.as_byte()))?;

    let mut preamble = BytesMut::with_capacity(ProtocolId::MAX_LEN + 2);
    preamble.put_u8(version.as_byte());
    if tls.is_some() && !format.encode(&ProtocolId::rpc_tls(), &mut preamble) {
        return Err(HandshakeError::Unencodable {
            version,
            protocol: ProtocolId::rpc_tls(),
        });
    }
    let mut identifier = BytesMut::with_capacity(ProtocolId::MAX_LEN + 1);
    if !format.encode(protocol, &mut identifier) {
        return Err(HandshakeError::Unencodable {
            version,
            protocol: protocol.clone(),
        });
    }

    let mut stream: BoxedStream = Box::new(stream);
    let stage = if tls.is_some() {
        HandshakeStage::Escalation
    } else {
        HandshakeStage::Version
    };
    io_at(stage, stream.write_all(&preamble).await)?;
    io_at(stage, stream.flush().await)?;

    if let Some(tls) = tls {
        let encrypted = tls
            .connect(stream)
            .await
            .map_err(|source| HandshakeError::Tls { source })?;
        stream = Box::new(encrypted);
    }

    io_at(
        HandshakeStage::Identifier,
        stream.write_all(&identifier).await,
    )?;
    io_at(HandshakeStage::Identifier, stream.flush().await)?;
    trace!(
        target: "spark::mux::handshake",
        version = %version,
        protocol = %protocol,
        secured = tls.is_some(),
        "dial handshake written"
    );
    Ok(stream)
}

/// 受理方握手。
///
/// # 契约 (What)
/// - 版本字节、每一次标识读取以及 TLS 服务端握手都受 `policy.read_timeout` 约束；
/// - 未知版本返回 [`HandshakeError::UnsupportedVersion`]；
/// - `RPCTLS` 出现在明文流上且配置了 TLS 时执行升级，否则返回 [`HandshakeError::TlsNotConfigured`]；
///   加密流上再次出现返回 [`HandshakeError::RepeatedEscalation`]；
/// - `enforce_secure` 且配置了 TLS 时，明文流上的其它标识返回 [`HandshakeError::InsecureRejected`]；
/// - 成功时只读取到标识末尾，后续字节原样留在返回的流中。
pub async fn accept<S>(stream: S, policy: &AcceptPolicy) -> Result<Classified, HandshakeError>
where
    S: MuxStream,
{
    let limit = policy.read_timeout;
    let mut stream: BoxedStream = Box::new(stream);

    let byte = within(limit, HandshakeStage::Version, async {
        io_at(HandshakeStage::Version, stream.read_u8().await)
    })
    .await?;
    let version = MuxVersion::from_byte(byte);
    let format = version
        .wire_format()
        .ok_or(HandshakeError::UnsupportedVersion(byte))?;

    let mut secured = false;
    loop {
        let protocol = within(limit, HandshakeStage::Identifier, format.decode(&mut stream)).await?;

        if !protocol.is_escalation() {
            if policy.enforce_secure && policy.tls.is_some() && !secured {
                return Err(HandshakeError::InsecureRejected { protocol });
            }
            return Ok(Classified {
                stream,
                version,
                protocol,
                secured,
            });
        }

        if secured {
            return Err(HandshakeError::RepeatedEscalation);
        }
        let tls = policy.tls.as_ref().ok_or(HandshakeError::TlsNotConfigured)?;
        let encrypted = within(limit, HandshakeStage::Escalation, async move {
            tls.accept(stream)
                .await
                .map_err(|source| HandshakeError::Tls { source })
        })
        .await?;
        trace!(target: "spark::mux::handshake", version = %version, "connection escalated to tls");
        stream = Box::new(encrypted);
        secured = true;
    }
}
