use std::{future::Future, io, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::error::{HandshakeError, HandshakeStage};

/// 在读截止时间内执行握手步骤。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手期间对端可能只发一半字节就停住，若不设截止，分类任务会永久占用；
/// - 所有阶段（版本字节、协议标识、TLS 升级）共用同一个超时语义，日志中只需记录阶段名。
///
/// ## 契约（What）
/// - `limit` 为零表示不设截止；
/// - 超时返回 [`HandshakeError::Timeout`]，其余结果原样透传。
pub(crate) async fn within<F, T>(
    limit: Duration,
    stage: HandshakeStage,
    future: F,
) -> Result<T, HandshakeError>
where
    F: Future<Output = Result<T, HandshakeError>>,
{
    if limit.is_zero() {
        return future.await;
    }
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout { stage, limit }),
    }
}

/// 把 `io::Result` 映射到指定阶段的握手错误。
pub(crate) fn io_at<T>(stage: HandshakeStage, result: io::Result<T>) -> Result<T, HandshakeError> {
    result.map_err(|err| HandshakeError::from_io(stage, err))
}

const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// 为长连接设置 `TCP_NODELAY` 与 `SO_KEEPALIVE`。
///
/// 池化连接可能空闲很久，keepalive 让内核及时发现已失联的对端；RPC 帧较小，关闭 Nagle
/// 以免请求被攒批延迟。
pub fn tune_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
