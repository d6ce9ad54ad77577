//! 调用引擎的线上编码。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 请求/应答的语义与它们在字节流上的样子是两件事；分发器与连接池在构造时选定编码，
//!   同一条连接的两端必须使用同一种编码；
//!
//! ## 契约 (What)
//! - [`RpcCodec::encode`] 产出可直接写出的完整帧，超过 [`MAX_FRAME_LEN`] 时返回
//!   [`RpcError::FrameTooLarge`]；
//! - [`RpcCodec::decode`] 每次读取恰好一帧，在帧边界遇到 EOF 时返回 `Ok(None)`，
//!   帧中途 EOF 视为传输错误；
//! - 默认编码为 [`LengthPrefixedJson`]，另提供按行分隔的 [`LineDelimitedJson`]。
//!
//! ## 风险 (Trade-offs)
//! - 编码以 `serde_json::Value` 为中间表示，换一种编码只改变帧的外形与字节表示，
//!   不改变参数与应答的数据模型。

use std::{io, sync::Arc};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::RpcError;

/// 单帧负载的最大字节数。
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// 调用消息的帧编码。
#[async_trait]
pub trait RpcCodec: Send + Sync + 'static {
    /// 编码名称，仅用于日志。
    fn name(&self) -> &'static str;

    /// 把一条消息编码为完整的帧。
    fn encode(&self, message: &Value) -> Result<Bytes, RpcError>;

    /// 从带缓冲的读端读取下一帧。
    async fn decode(
        &self,
        reader: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<Option<Value>, RpcError>;
}

/// 共享的编码句柄。
pub type SharedCodec = Arc<dyn RpcCodec>;

/// 未显式指定时使用的编码。
pub fn default_codec() -> SharedCodec {
    Arc::new(LengthPrefixedJson)
}

fn check_len(len: usize) -> Result<(), RpcError> {
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge {
            len,
            limit: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// 4 字节大端长度 + JSON 负载。
#[derive(Clone, Copy, Debug, Default)]
pub struct LengthPrefixedJson;

const HEADER_LEN: usize = 4;

#[async_trait]
impl RpcCodec for LengthPrefixedJson {
    fn name(&self) -> &'static str {
        "length-prefixed-json"
    }

    fn encode(&self, message: &Value) -> Result<Bytes, RpcError> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32(0);
        let mut writer = buf.writer();
        serde_json::to_writer(&mut writer, message).map_err(RpcError::Encode)?;
        let mut buf = writer.into_inner();
        let len = buf.len() - HEADER_LEN;
        check_len(len)?;
        buf[..HEADER_LEN].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(buf.freeze())
    }

    async fn decode(
        &self,
        reader: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<Option<Value>, RpcError> {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        check_len(len)?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(RpcError::Decode)
    }
}

/// 每帧一行紧凑 JSON，以 `\n` 结尾。
///
/// 紧凑 JSON 中字符串内的换行总是被转义，因此行尾可以无歧义地作为帧边界。
#[derive(Clone, Copy, Debug, Default)]
pub struct LineDelimitedJson;

#[async_trait]
impl RpcCodec for LineDelimitedJson {
    fn name(&self) -> &'static str {
        "line-delimited-json"
    }

    fn encode(&self, message: &Value) -> Result<Bytes, RpcError> {
        let mut line = serde_json::to_vec(message).map_err(RpcError::Encode)?;
        check_len(line.len())?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    async fn decode(
        &self,
        reader: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<Option<Value>, RpcError> {
        let mut line = Vec::new();
        let read = (&mut *reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if line.pop() != Some(b'\n') {
            check_len(read)?;
            return Err(RpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "line frame ended without a newline",
            )));
        }
        serde_json::from_slice(&line)
            .map(Some)
            .map_err(RpcError::Decode)
    }
}
