//! 请求/应答消息及其按编码读写的帮助函数。

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

pub use crate::codec::MAX_FRAME_LEN;
use crate::{codec::RpcCodec, error::RpcError};

/// 调用请求。`method` 形如 `service.Method`。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// 调用应答，`result` 与 `error` 二选一。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// 转换为调用方视角的结果；两者皆缺省时视为 `null` 结果。
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(reason) => Err(RpcError::Remote(reason)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// 用给定编码把消息编码为完整的帧。
pub fn encode_frame<T: Serialize>(codec: &dyn RpcCodec, message: &T) -> Result<Bytes, RpcError> {
    let value = serde_json::to_value(message).map_err(RpcError::Encode)?;
    codec.encode(&value)
}

/// 写出一帧。
pub async fn write_frame<W, T>(
    codec: &dyn RpcCodec,
    writer: &mut W,
    message: &T,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(codec, message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一帧；在帧边界处遇到 EOF 时返回 `Ok(None)`。
pub async fn read_frame<T: DeserializeOwned>(
    codec: &dyn RpcCodec,
    reader: &mut (dyn AsyncBufRead + Send + Unpin),
) -> Result<Option<T>, RpcError> {
    match codec.decode(reader).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(RpcError::Decode),
        None => Ok(None),
    }
}
