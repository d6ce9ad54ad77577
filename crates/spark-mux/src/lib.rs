#![doc = r#"
# spark-mux

## 设计动机（Why）
- **单端口多协议**：RPC、共识、Mesh 以及用户自定义协议共用同一个 TCP 监听端口，每条连接在
  握手阶段声明自己属于哪个协议，之后整条连接归该协议所有；
- **按连接加密**：任意连接都可以在握手中通过 `RPCTLS` 升级为双向 TLS，受理方可以配置为
  拒绝所有未升级的明文连接；
- **架构角色**：本 crate 只定义握手线格式、协议分发表与 TLS 材料；监听循环位于
  `spark-mux-server`，出站连接复用位于 `spark-mux-pool`。

## 核心契约（What）
- [`StreamRegistry`]：`(MuxVersion, ProtocolId) → StreamHandler` 的分发表，保留标识 `RPCTLS`、`REG`
  不可覆盖，查询区分“版本不支持”与“协议不支持”；
- [`handshake::dial`] / [`handshake::accept`]：握手的两端，受理方每一步读取都受截止时间约束，
  TLS 升级最多一次；
- [`MuxVersion::wire_format`]：版本到协议标识编码的策略表；
- [`TlsSettings`]：生成互相独立的出站/入站 rustls 配置，[`InboundTls`] 支持证书热更新；
- [`MuxConfig`]：TOML 声明式配置。

## 实现策略（How）
- 注册表读路径通过 `ArcSwap` 读取不可变快照，写路径由单一互斥锁串行化，读者不会观察到
  半更新的分发表；
- 握手读取逐字节进行，绝不越过标识末尾，保证后续 TLS 握手或协议处理函数拿到完整字节流。

## 风险与考量（Trade-offs）
- 受理方不会把拒绝原因回写给对端，拨号方只能观察到连接被关闭；
- V1 线格式为封闭枚举，无法承载用户自定义协议，注册时即被拒绝。
"#]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod registry;
pub mod stream;
pub mod tls;
mod util;
pub mod version;

pub use config::{MuxConfig, PoolSettings, ServerSettings, TlsFiles};
pub use error::{
    ErrorCategory, ErrorClass, HandshakeError, HandshakeStage, ProtocolIdError, RegistryError,
};
pub use handshake::{AcceptPolicy, Classified};
pub use protocol::ProtocolId;
pub use registry::{StreamProtocol, StreamRegistry};
pub use stream::{
    BoxedStream, HandlerError, HandlerFn, MuxStream, PeerInfo, SharedHandler, StreamHandler,
    handler_fn,
};
pub use tls::{ClientAuth, ClientTls, InboundTls, TlsError, TlsSettings};
pub use util::tune_stream;
pub use version::{MuxVersion, WireFormat};
