use std::{fmt, future::Future, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{protocol::ProtocolId, version::MuxVersion};

/// 握手完成后交给处理函数的双工字节流。
///
/// 明文 `TcpStream` 与 TLS 包装后的流都满足该约束，因此处理函数不需要关心升级是否发生。
pub trait MuxStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> MuxStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// 类型擦除后的连接。丢弃即关闭底层套接字。
pub type BoxedStream = Box<dyn MuxStream>;

/// 处理函数返回的错误，只在分发器内记录日志，不再向外传播。
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// 已分类连接的元数据。
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// 对端地址。
    pub remote_addr: SocketAddr,
    /// 本端地址。
    pub local_addr: SocketAddr,
    /// 握手使用的复用版本。
    pub version: MuxVersion,
    /// 最终协商出的协议标识（升级之后的那一个）。
    pub protocol: ProtocolId,
    /// 连接是否经过 TLS 升级。
    pub secured: bool,
}

/// 协议处理函数。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 分发器只负责“这条连接属于谁”，连接的后续生命周期完全交给处理函数；
/// - 共识、Mesh 等上层协议以及内建的 `REG` 桥接都实现同一个接口，注册表对它们一视同仁。
///
/// ## 契约 (What)
/// - `serve` 获得流的所有权，返回时流被丢弃、套接字随之关闭；
/// - 返回的错误只被记录，不影响监听循环。
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn serve(&self, stream: BoxedStream, peer: PeerInfo) -> Result<(), HandlerError>;
}

/// 将闭包适配为 [`StreamHandler`]。
pub struct HandlerFn<F> {
    f: F,
}

/// 以闭包构造处理函数。
///
/// ```ignore
/// let echo = handler_fn(|stream, _peer| async move {
///     let (mut rd, mut wr) = tokio::io::split(stream);
///     tokio::io::copy(&mut rd, &mut wr).await?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(BoxedStream, PeerInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> StreamHandler for HandlerFn<F>
where
    F: Fn(BoxedStream, PeerInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn serve(&self, stream: BoxedStream, peer: PeerInfo) -> Result<(), HandlerError> {
        (self.f)(stream, peer).await
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

/// 共享的处理函数句柄。
pub type SharedHandler = Arc<dyn StreamHandler>;
