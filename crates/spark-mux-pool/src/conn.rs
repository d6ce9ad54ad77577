//! 池化连接与持有凭证。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 一条物理连接可能同时被池本身、多个同步调用方以及尚未完成的异步调用持有；
//!   连接只能在“已被要求关闭”且“没有任何持有者”时真正关闭，而这两个事件可能以任意顺序发生；
//!
//! ## 契约 (What)
//! - 引用计数与关闭标志打包在同一个原子字中，`release` 与 `mark_shutdown` 都基于同一个原子
//!   操作的返回值判断“计数为零且已关闭”，两者中观察到该状态的一方负责关闭；
//! - 物理关闭由独立的 `closed` 闩保证只发生一次；
//! - 新建连接的计数为 1，代表池自身的隐式持有，由驱逐路径释放。
//!
//! ## 风险 (Trade-offs)
//! - 计数使用 31 位，实际持有者数量远低于上限，溢出不做检查。

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use spark_mux::ProtocolId;
use spark_mux_rpc::RpcClient;
use tracing::debug;

const SHUTDOWN_BIT: u32 = 1 << 31;
const COUNT_MASK: u32 = SHUTDOWN_BIT - 1;

/// 连接池键：`地址/协议`。
pub(crate) fn pool_key(addr: SocketAddr, protocol: &ProtocolId) -> String {
    format!("{addr}/{protocol}")
}

/// 绑定到一个 (地址, 协议) 的物理连接及其上的调用客户端。
pub struct Conn {
    key: String,
    addr: SocketAddr,
    protocol: ProtocolId,
    client: RpcClient,
    state: AtomicU32,
    closed: AtomicBool,
    last_used: Mutex<Instant>,
}

impl Conn {
    pub(crate) fn new(addr: SocketAddr, protocol: ProtocolId, client: RpcClient) -> Self {
        Self {
            key: pool_key(addr, &protocol),
            addr,
            protocol,
            client,
            state: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// 当前持有者数量（含池的隐式持有）。
    pub fn ref_count(&self) -> u32 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.load(Ordering::Acquire) & SHUTDOWN_BIT != 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 距上次被取用的时长。
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// 增加一个持有者并刷新最近使用时间。
    pub(crate) fn hold(self: &Arc<Self>) -> ConnHold {
        self.state.fetch_add(1, Ordering::AcqRel);
        *self.last_used.lock() = Instant::now();
        ConnHold {
            conn: Arc::clone(self),
            armed: true,
        }
    }

    /// 减少一个持有者；若因此满足关闭条件则关闭并返回 `true`。
    pub(crate) fn release(&self) -> bool {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        let now = prev.wrapping_sub(1);
        if now & COUNT_MASK == 0 && now & SHUTDOWN_BIT != 0 {
            return self.close();
        }
        false
    }

    /// 标记关闭；若此时已无持有者则立即关闭并返回 `true`。
    pub(crate) fn mark_shutdown(&self) -> bool {
        let prev = self.state.fetch_or(SHUTDOWN_BIT, Ordering::AcqRel);
        if prev & SHUTDOWN_BIT == 0 && prev & COUNT_MASK == 0 {
            return self.close();
        }
        false
    }

    /// 物理关闭，只生效一次。
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.client.close();
        debug!(target: "spark::mux::pool", key = %self.key, "pooled connection closed");
        true
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("key", &self.key)
            .field("refs", &self.ref_count())
            .field("shutdown", &self.is_shutdown())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 对池化连接的一次持有。
///
/// 丢弃或调用 [`ConnHold::release`] 即归还；异步调用路径把它交给调用方，
/// 在应答取回之前连接不会被物理关闭。
#[must_use = "dropping a ConnHold releases the connection immediately"]
pub struct ConnHold {
    conn: Arc<Conn>,
    armed: bool,
}

impl ConnHold {
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// 显式归还，返回连接是否因此被关闭。
    pub fn release(mut self) -> bool {
        self.armed = false;
        self.conn.release()
    }
}

impl std::ops::Deref for ConnHold {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        &self.conn
    }
}

impl Drop for ConnHold {
    fn drop(&mut self) {
        if self.armed {
            self.conn.release();
        }
    }
}

impl fmt::Debug for ConnHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnHold").field(&self.conn).finish()
    }
}
