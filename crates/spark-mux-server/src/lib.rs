#![doc = r#"
# spark-mux-server

## 设计动机（Why）
- 在一个监听端口上同时承载 RPC、共识、Mesh 与用户自定义协议；
- 每条入站连接先完成复用握手（含可选的 TLS 升级），再整体交给对应协议的处理函数。

## 核心契约（What）
- [`Dispatcher`]：持有自己的协议注册表与调用引擎，`start` 发布服务后开始受理，`shutdown` 幂等；
- [`RegisteredBridge`]：`REG` 协议的处理函数，把连接交给 [`spark_mux_rpc::RpcServer`]。

## 风险与考量（Trade-offs）
- 拒绝连接时不向对端回写原因，只记录日志并关闭套接字。
"#]
#![deny(unsafe_code)]

mod bridge;
mod dispatcher;
mod error;

pub use bridge::RegisteredBridge;
pub use dispatcher::Dispatcher;
pub use error::DispatchError;
