//! 复用版本与线格式策略表。
//!
//! 每个连接的首字节是 [`MuxVersion`]，它决定剩余握手使用哪一种协议标识编码。
//! 新增版本只需要在 [`MuxVersion::wire_format`] 中登记一项 [`WireFormat`]，分发器与连接池的逻辑
//! 不需要任何改动。

use std::fmt;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::{
    error::{HandshakeError, HandshakeStage},
    protocol::{MESH, ProtocolId, RAFT, REGISTERED, RPC_TLS},
    stream::BoxedStream,
};

/// 连接首字节携带的复用版本。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MuxVersion(u8);

impl MuxVersion {
    /// 未知版本，永远不会出现在分发表中。
    pub const UNKNOWN: Self = Self(0);
    /// 旧版：协议标识为封闭枚举中的单个字节。
    pub const V1: Self = Self(1);
    /// 当前版：协议标识为以换行结尾、大小写不敏感的 ASCII 令牌。
    pub const V2: Self = Self(2);
    /// 拨号方默认使用的版本。
    pub const CURRENT: Self = Self::V2;

    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// 版本的可读名称。
    pub fn name(self) -> &'static str {
        match self {
            Self::V1 => "mux-v1",
            Self::V2 => "mux-v2",
            _ => "unknown",
        }
    }

    /// 查询该版本的线格式；未知版本返回 `None`。
    pub fn wire_format(self) -> Option<&'static dyn WireFormat> {
        match self {
            Self::V1 => Some(&FIXED_BYTE),
            Self::V2 => Some(&DELIMITED_TOKEN),
            _ => None,
        }
    }
}

impl Default for MuxVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for MuxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            "unknown" => write!(f, "unknown({})", self.0),
            name => f.write_str(name),
        }
    }
}

impl fmt::Debug for MuxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MuxVersion({})", self)
    }
}

/// 协议标识的编码策略。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 历史上同时存在“固定单字节”与“换行分隔字符串”两种编码，两者按版本切换；
///   把编码/解码收敛为策略对象后，握手代码只面对一个接口。
///
/// ## 契约 (What)
/// - `encode`：把标识追加到 `dst`，无法承载时返回 `false` 且不写入任何字节；
/// - `decode`：从流中恰好读取一个标识，不得越过标识末尾多读字节，否则后续的 TLS 握手或
///   处理函数会丢失数据；
/// - 解码出的标识已经规范化。
#[async_trait]
pub trait WireFormat: Send + Sync + 'static {
    /// 策略名称，用于日志。
    fn name(&self) -> &'static str;

    /// 编码协议标识。
    fn encode(&self, protocol: &ProtocolId, dst: &mut BytesMut) -> bool;

    /// 是否能够承载该标识。
    fn can_encode(&self, protocol: &ProtocolId) -> bool {
        self.encode(protocol, &mut BytesMut::new())
    }

    /// 从流中读取一个协议标识。
    async fn decode(&self, stream: &mut BoxedStream) -> Result<ProtocolId, HandshakeError>;
}

/// V2 线格式：`TOKEN\n`。
#[derive(Debug)]
pub struct DelimitedToken;

static DELIMITED_TOKEN: DelimitedToken = DelimitedToken;

#[async_trait]
impl WireFormat for DelimitedToken {
    fn name(&self) -> &'static str {
        "delimited-token"
    }

    fn encode(&self, protocol: &ProtocolId, dst: &mut BytesMut) -> bool {
        dst.reserve(protocol.as_str().len() + 1);
        dst.put_slice(protocol.as_str().as_bytes());
        dst.put_u8(b'\n');
        true
    }

    async fn decode(&self, stream: &mut BoxedStream) -> Result<ProtocolId, HandshakeError> {
        // 逐字节读取：换行之后的字节属于 TLS 握手或协议处理函数。
        let mut token = Vec::with_capacity(16);
        loop {
            let byte = stream
                .read_u8()
                .await
                .map_err(|err| HandshakeError::from_io(HandshakeStage::Identifier, err))?;
            if byte == b'\n' {
                break;
            }
            // 允许 `\r\n` 等尾随空白占用额外的一个字节。
            if token.len() > ProtocolId::MAX_LEN {
                return Err(HandshakeError::IdentifierTooLong {
                    limit: ProtocolId::MAX_LEN,
                });
            }
            token.push(byte);
        }
        let text = String::from_utf8_lossy(&token);
        ProtocolId::new(&text).map_err(HandshakeError::MalformedIdentifier)
    }
}

/// V1 线格式：封闭枚举中的单个字节。
#[derive(Debug)]
pub struct FixedByte;

static FIXED_BYTE: FixedByte = FixedByte;

const FIXED_TABLE: [(u8, &str); 4] = [(1, RPC_TLS), (2, RAFT), (3, MESH), (4, REGISTERED)];

#[async_trait]
impl WireFormat for FixedByte {
    fn name(&self) -> &'static str {
        "fixed-byte"
    }

    fn encode(&self, protocol: &ProtocolId, dst: &mut BytesMut) -> bool {
        match FIXED_TABLE
            .iter()
            .find(|(_, name)| *name == protocol.as_str())
        {
            Some((byte, _)) => {
                dst.put_u8(*byte);
                true
            }
            None => false,
        }
    }

    async fn decode(&self, stream: &mut BoxedStream) -> Result<ProtocolId, HandshakeError> {
        let byte = stream
            .read_u8()
            .await
            .map_err(|err| HandshakeError::from_io(HandshakeStage::Identifier, err))?;
        FIXED_TABLE
            .iter()
            .find(|(code, _)| *code == byte)
            .map(|(_, name)| ProtocolId::new(name).map_err(HandshakeError::MalformedIdentifier))
            .unwrap_or(Err(HandshakeError::UnknownIdentifierByte(byte)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;

    async fn decode_from(version: MuxVersion, wire: &[u8]) -> Result<ProtocolId, HandshakeError> {
        let (client, server) = tokio::io::duplex(256);
        let mut client = client;
        client.write_all(wire).await.expect("write to duplex");
        drop(client);
        let mut stream: BoxedStream = Box::new(server);
        let format = version.wire_format().expect("known version");
        format.decode(&mut stream).await
    }

    #[test]
    fn unknown_versions_have_no_format() {
        assert!(MuxVersion::UNKNOWN.wire_format().is_none());
        assert!(MuxVersion::from_byte(7).wire_format().is_none());
        assert_eq!(MuxVersion::default(), MuxVersion::V2);
        assert_eq!(MuxVersion::from_byte(7).to_string(), "unknown(7)");
    }

    #[tokio::test]
    async fn delimited_token_stops_at_newline() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = client;
        client.write_all(b"mesh\r\nPAYLOAD").await.expect("write");
        let mut stream: BoxedStream = Box::new(server);
        let id = DelimitedToken.decode(&mut stream).await.expect("decode");
        assert_eq!(id.as_str(), MESH);

        let mut rest = [0u8; 7];
        stream.read_exact(&mut rest).await.expect("rest");
        assert_eq!(&rest, b"PAYLOAD");
    }

    #[tokio::test]
    async fn delimited_token_rejects_unterminated_garbage() {
        let long = vec![b'A'; ProtocolId::MAX_LEN + 8];
        let err = decode_from(MuxVersion::V2, &long).await.expect_err("too long");
        assert!(matches!(err, HandshakeError::IdentifierTooLong { .. }));

        let err = decode_from(MuxVersion::V2, b"REG").await.expect_err("eof");
        assert!(matches!(err, HandshakeError::PeerClosed { .. }));
    }

    #[tokio::test]
    async fn fixed_byte_covers_closed_enum_only() {
        let id = decode_from(MuxVersion::V1, &[4]).await.expect("decode");
        assert_eq!(id.as_str(), REGISTERED);
        let err = decode_from(MuxVersion::V1, &[42]).await.expect_err("unknown byte");
        assert!(matches!(err, HandshakeError::UnknownIdentifierByte(42)));

        let custom = ProtocolId::new("custom").expect("valid");
        assert!(!FixedByte.can_encode(&custom));
        assert!(DelimitedToken.can_encode(&custom));
    }

    proptest! {
        #[test]
        fn delimited_decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..160)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            let outcome = runtime.block_on(decode_from(MuxVersion::V2, &bytes));
            if let Ok(id) = outcome {
                prop_assert!(id.as_str().len() <= ProtocolId::MAX_LEN);
                prop_assert_eq!(id.as_str().to_ascii_uppercase(), id.as_str());
            }
        }
    }
}
