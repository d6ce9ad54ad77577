//! 调用引擎客户端。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 一条物理连接上允许多个调用同时在途，同步调用与先发出、后取回的异步调用共用一套机制；
//!
//! ## 实现 (How)
//! - 连接拆为读写两半，分别由后台任务驱动：写任务从无界队列取出已编码的帧依次写出，
//!   读任务按 `id` 把应答投递给等待方；
//! - 在途调用登记在 `pending` 表中，任一后台任务退出时把表中剩余调用全部以错误结束，
//!   等待方不会永久挂起。
//!
//! ## 风险 (Trade-offs)
//! - 写队列无界，调用方需自行控制在途数量；
//! - `close` 直接中止后台任务，尚未写出的请求被丢弃并以 [`RpcError::Shutdown`] 结束。

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    codec::{SharedCodec, default_codec},
    error::RpcError,
    frame::{Request, Response, encode_frame, read_frame},
};

type Waiter = oneshot::Sender<Result<Value, RpcError>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Closed {
    /// 对端关闭或传输失败。
    ByPeer,
    /// 本端调用了 `close`。
    Locally,
}

impl Closed {
    fn error(self) -> RpcError {
        match self {
            Closed::ByPeer => RpcError::ConnectionClosed,
            Closed::Locally => RpcError::Shutdown,
        }
    }
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, Waiter>,
    closed: Option<Closed>,
}

struct Shared {
    pending: Mutex<Pending>,
    replied: AtomicBool,
}

impl Shared {
    /// 结束全部在途调用，之后的 `invoke` 直接失败。首个关闭原因生效。
    fn fail_all(&self, reason: Closed) {
        let (waiters, reason) = {
            let mut pending = self.pending.lock();
            let reason = *pending.closed.get_or_insert(reason);
            (std::mem::take(&mut pending.waiters), reason)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(reason.error()));
        }
    }
}

/// 调用引擎客户端。
pub struct RpcClient {
    shared: Arc<Shared>,
    codec: SharedCodec,
    outbound: mpsc::UnboundedSender<Bytes>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcClient {
    /// 在握手完成的流上以默认编码启动客户端。必须在 Tokio 运行时内调用。
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_codec(stream, default_codec())
    }

    /// 以指定编码启动客户端，服务端必须使用同一编码。
    pub fn with_codec<S>(stream: S, codec: SharedCodec) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            replied: AtomicBool::new(false),
        });
        let (outbound, queue) = mpsc::unbounded_channel();
        let write_task = tokio::spawn(write_loop(writer, queue, Arc::clone(&shared)));
        let read_task = tokio::spawn(read_loop(
            BufReader::new(reader),
            Arc::clone(&codec),
            Arc::clone(&shared),
        ));
        Self {
            shared,
            codec,
            outbound,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(vec![write_task, read_task]),
        }
    }

    /// 发出调用并立即返回等待句柄。
    ///
    /// 本端已关闭时返回 [`RpcError::Shutdown`]，连接已被对端关闭时返回 [`RpcError::ConnectionClosed`]；
    /// 参数无法序列化时返回 [`RpcError::Encode`]。
    pub fn invoke<A: Serialize + ?Sized>(
        &self,
        method: &str,
        args: &A,
    ) -> Result<PendingReply, RpcError> {
        let params = serde_json::to_value(args).map_err(RpcError::Encode)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_frame(
            self.codec.as_ref(),
            &Request {
                id,
                method: method.to_owned(),
                params,
            },
        )?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if let Some(reason) = pending.closed {
                return Err(reason.error());
            }
            pending.waiters.insert(id, tx);
        }
        if self.outbound.send(frame).is_err() {
            self.shared.pending.lock().waiters.remove(&id);
            return Err(RpcError::Shutdown);
        }
        Ok(PendingReply { rx })
    }

    /// 同步调用：等待应答并解码为 `R`。
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.invoke(method, args)?.decode().await
    }

    /// 是否收到过任何应答帧。
    pub fn has_received_reply(&self) -> bool {
        self.shared.replied.load(Ordering::Acquire)
    }

    /// 后台任务是否已经退出（对端关闭、传输错误或本端关闭）。
    pub fn is_closed(&self) -> bool {
        self.shared.pending.lock().closed.is_some()
    }

    /// 关闭客户端：中止读写任务、释放底层流，在途调用以 [`RpcError::Shutdown`] 结束。可重复调用。
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.fail_all(Closed::Locally);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("codec", &self.codec.name())
            .field("closed", &self.is_closed())
            .field("replied", &self.has_received_reply())
            .finish_non_exhaustive()
    }
}

/// 在途调用的等待句柄。`await` 得到原始 JSON 结果。
#[must_use = "dropping a PendingReply discards the reply"]
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl PendingReply {
    /// 等待应答并解码。
    pub async fn decode<R: DeserializeOwned>(self) -> Result<R, RpcError> {
        let value = self.await?;
        serde_json::from_value(value).map_err(RpcError::Decode)
    }
}

impl Future for PendingReply {
    type Output = Result<Value, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(RpcError::ConnectionClosed)))
    }
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite,
{
    while let Some(frame) = queue.recv().await {
        let outcome = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = outcome {
            debug!(target: "spark::mux::rpc", error = %err, "rpc writer stopped");
            shared.fail_all(Closed::ByPeer);
            return;
        }
    }
}

async fn read_loop<S>(
    mut reader: BufReader<ReadHalf<S>>,
    codec: SharedCodec,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Send,
{
    loop {
        match read_frame::<Response>(codec.as_ref(), &mut reader).await {
            Ok(Some(response)) => {
                shared.replied.store(true, Ordering::Release);
                let waiter = shared.pending.lock().waiters.remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response.into_result());
                    }
                    None => {
                        debug!(target: "spark::mux::rpc", id = response.id, "reply for unknown call dropped");
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(target: "spark::mux::rpc", error = %err, "rpc reader stopped");
                break;
            }
        }
    }
    shared.fail_all(Closed::ByPeer);
}
