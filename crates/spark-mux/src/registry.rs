//! # Stream Registry：按复用版本划分的协议分发表
//!
//! ## 核心意图（Why）
//! - 决定“一条已完成握手的连接交给哪个处理函数”，让 RPC、共识、Mesh 与用户协议共享同一个监听端口；
//! - 作为显式构造的对象由分发器持有，而非进程级全局表，同一进程内可以并存多个互不干扰的分发器。
//!
//! ## 并发模型（How）
//! - 全部写操作经由同一把互斥锁串行化，写者复制当前快照、修改后整体发布；
//! - 读路径通过 `ArcSwap` 无锁读取快照，查询永远不会观察到“替换到一半”的条目。
//!
//! ## 行为契约（What）
//! - `RPCTLS` 与 `REG` 在构造时固定，之后不可注册覆盖；
//! - 其余名称重复注册即替换（后写者生效）；
//! - `lookup` 区分“版本不存在”与“版本存在但协议未绑定”。

use std::{collections::HashMap, fmt, sync::Arc};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    error::{ProtocolIdError, RegistryError},
    protocol::{MESH, ProtocolId, RAFT},
    stream::{SharedHandler, StreamHandler},
    version::MuxVersion,
};

#[derive(Clone)]
enum Slot {
    /// `RPCTLS`：由握手层消费，永远不会分发给处理函数。
    Escalation,
    /// 内建占位（如 `RAFT`/`MESH`），在嵌入方注册处理函数之前不可用。
    Vacant,
    Bound(SharedHandler),
}

type Table = HashMap<ProtocolId, Slot>;
type Tables = HashMap<MuxVersion, Table>;

/// 一个待注册的协议条目：规范化名称 + 处理函数。
#[derive(Clone)]
pub struct StreamProtocol {
    id: ProtocolId,
    handler: SharedHandler,
}

impl StreamProtocol {
    /// 以名称开始构造条目。
    pub fn builder(name: impl Into<String>) -> StreamProtocolBuilder {
        StreamProtocolBuilder {
            name: name.into(),
            handler: None,
        }
    }

    pub fn id(&self) -> &ProtocolId {
        &self.id
    }

    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }
}

impl fmt::Debug for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProtocol")
            .field("id", &self.id)
            .field("handler", &Arc::as_ptr(&self.handler))
            .finish()
    }
}

/// [`StreamProtocol`] 的建造器，`build` 时校验名称与处理函数。
pub struct StreamProtocolBuilder {
    name: String,
    handler: Option<SharedHandler>,
}

impl StreamProtocolBuilder {
    /// 设置处理函数。
    pub fn handler<H: StreamHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// 设置已共享的处理函数，便于同一实例挂到多个版本或名称下。
    pub fn shared_handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// 校验并生成条目。
    ///
    /// - 未设置处理函数：[`RegistryError::MissingHandler`]；
    /// - 名称为空：[`RegistryError::MissingName`]；
    /// - 名称含非法字符或过长：[`RegistryError::InvalidName`]。
    pub fn build(self) -> Result<StreamProtocol, RegistryError> {
        let handler = self.handler.ok_or(RegistryError::MissingHandler)?;
        let id = ProtocolId::new(&self.name).map_err(|err| match err {
            ProtocolIdError::Empty => RegistryError::MissingName,
            other => RegistryError::InvalidName(other),
        })?;
        Ok(StreamProtocol { id, handler })
    }
}

/// 协议分发表。
pub struct StreamRegistry {
    tables: ArcSwap<Tables>,
    write_lock: Mutex<()>,
}

impl StreamRegistry {
    /// 创建不含任何版本的空注册表。
    pub fn new() -> Self {
        Self {
            tables: ArcSwap::from_pointee(Tables::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// 创建带内建条目的注册表。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：进程启动时一次性装配所有已支持版本的内建协议，`REG` 绑定到调用方给出的
    ///   RPC 桥接处理函数，此后即不可变；
    /// - **契约 (What)**：V1 与 V2 均包含 `RPCTLS`（升级标记）、`REG`（绑定 `registered`）、
    ///   `RAFT`/`MESH`（占位，需嵌入方注册后才可查询成功）。
    pub fn with_builtins(registered: SharedHandler) -> Self {
        let mut tables = Tables::new();
        for version in [MuxVersion::V1, MuxVersion::V2] {
            let mut table = Table::new();
            table.insert(ProtocolId::rpc_tls(), Slot::Escalation);
            table.insert(ProtocolId::registered(), Slot::Bound(registered.clone()));
            for name in [RAFT, MESH] {
                if let Ok(id) = ProtocolId::new(name) {
                    table.insert(id, Slot::Vacant);
                }
            }
            tables.insert(version, table);
        }
        Self {
            tables: ArcSwap::from_pointee(tables),
            write_lock: Mutex::new(()),
        }
    }

    /// 为某个复用版本开启一张空分发表；版本没有线格式时返回 `UnsupportedVersion`。
    pub fn enable_version(&self, version: MuxVersion) -> Result<(), RegistryError> {
        if version.wire_format().is_none() {
            return Err(RegistryError::UnsupportedVersion(version));
        }
        self.update(|tables| {
            tables.entry(version).or_default();
            Ok(())
        })
    }

    /// 注册或替换协议处理函数。
    ///
    /// # 契约 (What)
    /// - 保留标识返回 [`RegistryError::ReservedName`]；
    /// - 版本不存在返回 [`RegistryError::UnsupportedVersion`]；
    /// - 线格式无法承载返回 [`RegistryError::Unencodable`]；
    /// - 成功后立即对后续 `lookup` 可见，旧处理函数被替换。
    pub fn register(
        &self,
        version: MuxVersion,
        protocol: StreamProtocol,
    ) -> Result<(), RegistryError> {
        let StreamProtocol { id, handler } = protocol;
        if id.is_reserved() {
            return Err(RegistryError::ReservedName(id));
        }
        let format = version
            .wire_format()
            .ok_or(RegistryError::UnsupportedVersion(version))?;
        if !format.can_encode(&id) {
            return Err(RegistryError::Unencodable {
                version,
                protocol: id,
            });
        }
        self.update(|tables| {
            let table = tables
                .get_mut(&version)
                .ok_or(RegistryError::UnsupportedVersion(version))?;
            let replaced = table.insert(id.clone(), Slot::Bound(handler)).is_some();
            debug!(%version, protocol = %id, replaced, "stream protocol registered");
            Ok(())
        })
    }

    /// 查询处理函数。名称会先规范化，因此大小写不敏感。
    pub fn lookup(&self, version: MuxVersion, name: &str) -> Result<SharedHandler, RegistryError> {
        let tables = self.tables.load();
        let table = tables
            .get(&version)
            .ok_or(RegistryError::UnsupportedVersion(version))?;
        let unsupported = || RegistryError::UnsupportedProtocol {
            version,
            protocol: name.trim().to_ascii_uppercase(),
        };
        let id = ProtocolId::new(name).map_err(|_| unsupported())?;
        match table.get(&id) {
            Some(Slot::Bound(handler)) => Ok(handler.clone()),
            Some(Slot::Escalation) | Some(Slot::Vacant) | None => Err(unsupported()),
        }
    }

    /// 列出某版本分发表中的全部标识（含占位），按字典序排列。
    pub fn protocols(&self, version: MuxVersion) -> Vec<ProtocolId> {
        let tables = self.tables.load();
        let mut ids: Vec<ProtocolId> = tables
            .get(&version)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// 列出已开启的复用版本。
    pub fn versions(&self) -> Vec<MuxVersion> {
        let mut versions: Vec<MuxVersion> = self.tables.load().keys().copied().collect();
        versions.sort();
        versions
    }

    fn update<F>(&self, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Tables) -> Result<(), RegistryError>,
    {
        let _guard = self.write_lock.lock();
        let mut next = Tables::clone(&self.tables.load());
        mutate(&mut next)?;
        self.tables.store(Arc::new(next));
        Ok(())
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("versions", &self.versions())
            .finish_non_exhaustive()
    }
}
