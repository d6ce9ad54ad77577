//! 服务对象与服务注册表。
//!
//! # 教案式说明
//! - **意图 (Why)**：应用在分发器启动之前登记自己的 RPC 服务，分发器启动时一次性把它们发布到
//!   调用引擎；注册表是显式构造的对象，而不是进程级全局变量，测试之间互不污染；
//! - **契约 (What)**：名称不可为空、不可重复；服务至少暴露一个方法，否则视为“没有服务对象”；
//!   `reset` 清空全部登记，供测试复位；
//! - **风险 (Trade-offs)**：分发器启动之后的登记不会自动发布，需要调用方自行决定是否重启。

use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{ServiceError, ServiceRegistryError};

/// 可被远程调用的服务对象。
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// 对外暴露的方法名（不含服务名前缀）。
    fn method_names(&self) -> Vec<String>;

    /// 执行一次调用。
    async fn call(&self, method: &str, params: Value) -> Result<Value, ServiceError>;
}

/// 共享的服务对象。
pub type SharedService = Arc<dyn Service>;

type Method = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ServiceError>> + Send + Sync>;

/// 以闭包组装的服务，方法参数与返回值经 `serde_json` 自动转换。
///
/// ```ignore
/// let mock = MethodTable::new().method("ServMock", |n: i64| async move { Ok::<_, ServiceError>(n) });
/// ```
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个方法；同名方法被替换。
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ServiceError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let method: Method = Arc::new(move |params: Value| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let args: A = serde_json::from_value(params).map_err(ServiceError::InvalidParams)?;
                let reply = f(args).await?;
                serde_json::to_value(reply).map_err(|err| ServiceError::failed(err.to_string()))
            })
        });
        self.methods.insert(name.into(), method);
        self
    }
}

#[async_trait]
impl Service for MethodTable {
    fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        let handler = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownMethod(method.to_owned()))?;
        handler(params).await
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// 启动前登记的服务集合。
#[derive(Default)]
pub struct ServiceRegistry {
    entries: Mutex<BTreeMap<String, SharedService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记服务。
    ///
    /// 检查顺序：服务对象（至少一个方法）→ 名称非空 → 名称未被占用。
    pub fn register(
        &self,
        name: impl Into<String>,
        service: SharedService,
    ) -> Result<(), ServiceRegistryError> {
        if service.method_names().is_empty() {
            return Err(ServiceRegistryError::MissingObject);
        }
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ServiceRegistryError::MissingName);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&name) {
            return Err(ServiceRegistryError::AlreadyRegistered(name));
        }
        entries.insert(name, service);
        Ok(())
    }

    /// 清空全部登记。
    pub fn reset(&self) {
        self.entries.lock().clear();
    }

    /// 按名称排序的登记快照。
    pub fn entries(&self) -> Vec<(String, SharedService)> {
        self.entries
            .lock()
            .iter()
            .map(|(name, service)| (name.clone(), Arc::clone(service)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.entries.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}
