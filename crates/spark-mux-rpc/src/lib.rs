#![doc = r#"
# spark-mux-rpc

## 设计动机（Why）
- 复用层的 `REG` 协议需要一个请求/应答式的调用引擎：服务端按 `service.Method` 路由，
  客户端既支持同步调用，也支持先发出、稍后再等待应答的异步调用；
- 引擎只关心已完成握手的双工字节流，不感知 TCP、TLS 或连接池。

## 核心契约（What）
- [`RpcCodec`]：可替换的帧编码，默认 [`LengthPrefixedJson`]（4 字节大端长度 + JSON），
  另有按行分隔的 [`LineDelimitedJson`]，单帧上限 [`codec::MAX_FRAME_LEN`]；
- [`RpcServer`]：`register_name` 发布服务，`serve` 处理一条连接上的全部请求；
- [`RpcClient`]：`call` / `invoke`，`has_received_reply` 供连接池区分“对端拒绝了握手”与“调用失败”；
- [`ServiceRegistry`]：分发器启动前的服务登记表。

## 风险与考量（Trade-offs）
- 服务端在单条连接上顺序处理请求，长耗时方法会阻塞同连接上的后续调用；
- 不支持流式调用与逻辑子流，每条物理连接只承载请求/应答。
"#]
#![deny(unsafe_code)]

mod client;
pub mod codec;
mod error;
pub mod frame;
mod server;
mod service;

pub use client::{PendingReply, RpcClient};
pub use codec::{LengthPrefixedJson, LineDelimitedJson, RpcCodec, SharedCodec, default_codec};
pub use error::{RpcError, ServiceError, ServiceRegistryError};
pub use server::RpcServer;
pub use service::{MethodTable, Service, ServiceRegistry, SharedService};
