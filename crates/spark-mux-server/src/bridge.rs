use async_trait::async_trait;
use spark_mux::{BoxedStream, HandlerError, PeerInfo, StreamHandler};
use spark_mux_rpc::RpcServer;
use tracing::trace;

/// `REG` 协议的处理函数：把整条连接交给调用引擎。
#[derive(Clone, Debug)]
pub struct RegisteredBridge {
    server: RpcServer,
}

impl RegisteredBridge {
    pub fn new(server: RpcServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl StreamHandler for RegisteredBridge {
    async fn serve(&self, stream: BoxedStream, peer: PeerInfo) -> Result<(), HandlerError> {
        trace!(target: "spark::mux::server", peer = %peer.remote_addr, secured = peer.secured, "serving registered rpc");
        self.server.serve(stream).await?;
        Ok(())
    }
}
