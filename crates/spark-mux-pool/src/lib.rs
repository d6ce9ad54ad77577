#![doc = r#"
# spark-mux-pool

## 设计动机（Why）
- 出站调用按 `(地址, 协议)` 复用一条经过握手的连接，避免每次调用重复建连、握手与 TLS 协商；
- 同一连接可能同时被池、同步调用方与尚未取回应答的异步调用持有，关闭时机必须由引用计数决定。

## 核心契约（What）
- [`ConnPool::call`]：同步调用，缺少回复目标时在任何网络活动之前失败；
- [`ConnPool::go`]：异步调用，成功发出时把 [`ConnHold`] 交给调用方；
- [`ConnPool::shutdown`]：驱逐指定连接，连接在最后一个持有者归还后才物理关闭；
- 空闲回收：`idle_timeout` 非零时后台任务按 `reap_interval` 周期驱逐空闲连接。

## 实现策略（How）
- 引用计数与关闭标志打包在一个原子字中，见 [`conn`] 模块；
- 同一键的首次拨号经由按键的异步闸门串行化，池表本身只在内存操作期间加锁。

## 风险与考量（Trade-offs）
- 对端拒绝协议时不会回写原因，池只能依据“新连接在任何应答之前被关闭”推断为
  [`PoolError::ProtocolRejected`]。
"#]
#![deny(unsafe_code)]

pub mod conn;
mod error;
mod pool;

pub use conn::{Conn, ConnHold};
pub use error::PoolError;
pub use pool::{ConnPool, PendingCall, PoolStats};
