//! 调用引擎服务端：按 `service.Method` 路由请求。

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, trace};

use crate::{
    codec::{SharedCodec, default_codec},
    error::{RpcError, ServiceRegistryError},
    frame::{Request, Response, read_frame, write_frame},
    service::SharedService,
};

/// 调用引擎的服务端。克隆后共享同一张服务表。
///
/// # 契约 (What)
/// - `register_name` 在名称已存在时返回 [`ServiceRegistryError::AlreadyRegistered`]；
/// - `serve` 在同一连接上按到达顺序逐个处理请求，对端在帧边界关闭时正常返回；
/// - 服务缺失、方法缺失或业务失败都以应答中的 `error` 字段告知调用方，连接保持可用；
/// - 客户端必须使用与服务端相同的编码。
#[derive(Clone)]
pub struct RpcServer {
    services: Arc<DashMap<String, SharedService>>,
    codec: SharedCodec,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::with_codec(default_codec())
    }
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: SharedCodec) -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            codec,
        }
    }

    /// 以名称发布服务。
    pub fn register_name(
        &self,
        name: impl Into<String>,
        service: SharedService,
    ) -> Result<(), ServiceRegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ServiceRegistryError::MissingName);
        }
        match self.services.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(ServiceRegistryError::AlreadyRegistered(entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(service);
                Ok(())
            }
        }
    }

    /// 已发布的服务名。
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// 在一条连接上持续处理请求，直到对端关闭或出现传输错误。
    pub async fn serve<S>(&self, stream: S) -> Result<(), RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let codec = self.codec.as_ref();
        let mut stream = BufReader::new(stream);
        while let Some(request) = read_frame::<Request>(codec, &mut stream).await? {
            let Request { id, method, params } = request;
            trace!(target: "spark::mux::rpc", id, method = %method, "rpc request");
            let response = match self.dispatch(&method, params).await {
                Ok(result) => Response::ok(id, result),
                Err(reason) => {
                    debug!(target: "spark::mux::rpc", id, method = %method, error = %reason, "rpc call failed");
                    Response::err(id, reason)
                }
            };
            write_frame(codec, &mut stream, &response).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, String> {
        let (service_name, method_name) = method
            .rsplit_once('.')
            .ok_or_else(|| format!("rpc: service/method request ill-formed: {method}"))?;
        // 克隆出 Arc 后立刻释放分片锁，业务调用期间不持有 DashMap 的读锁。
        let service = self
            .services
            .get(service_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| format!("rpc: can't find service {method}"))?;
        service
            .call(method_name, params)
            .await
            .map_err(|err| err.to_string())
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("codec", &self.codec.name())
            .field("services", &self.service_names())
            .finish()
    }
}
