//! TLS 协作者：证书材料加载、出入站 rustls 配置与服务端配置热更新。
//!
//! # 教案式说明
//! - **意图 (Why)**：握手层只需要“把这条流包成 TLS”的能力，证书从哪里来、是否要求客户端证书
//!   等细节统一收敛在本模块；出站与入站配置相互独立，修改一方不会影响另一方；
//! - **契约 (What)**：[`TlsSettings`] 持有 CA 根、证书链、私钥与期望的服务端名称，分别生成
//!   [`ClientTls`]（拨号方）与 [`InboundTls`]（受理方）；入站配置可在运行时原子替换；
//! - **风险 (Trade-offs)**：所有配置显式绑定 AWS-LC provider，不依赖进程级默认 provider，
//!   因此与其它库并存时不会因 provider 冲突而 panic。

use std::{fmt, io, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::{CryptoProvider, aws_lc_rs},
    server::{VerifierBuilderError, WebPkiClientVerifier},
};
use rustls_pki_types::{
    CertificateDer, PrivateKeyDer, ServerName,
    pem::{self, PemObject},
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use crate::{
    config::TlsFiles,
    error::{ErrorCategory, ErrorClass},
};

/// 证书材料加载或 rustls 配置构建失败。
#[derive(Debug, Error)]
pub enum TlsError {
    /// PEM 文件无法读取或解析。
    #[error("failed to read pem material from `{path}`: {source}")]
    Pem {
        path: String,
        #[source]
        source: pem::Error,
    },
    /// 文件中没有任何证书。
    #[error("`{path}` contains no certificates")]
    NoCertificates { path: String },
    /// 期望的服务端名称不是合法的 DNS 名或 IP。
    #[error("invalid tls server name `{0}`")]
    InvalidServerName(String),
    /// CA 证书无法加入信任根。
    #[error("invalid trust anchor: {0}")]
    TrustAnchor(#[source] rustls::Error),
    /// 客户端证书校验器构建失败（通常是信任根为空）。
    #[error("failed to build client certificate verifier: {0}")]
    Verifier(#[source] VerifierBuilderError),
    /// rustls 拒绝证书链或私钥。
    #[error("rustls rejected the configuration: {0}")]
    Config(#[source] rustls::Error),
}

impl ErrorClass for TlsError {
    fn code(&self) -> &'static str {
        match self {
            TlsError::Pem { .. } => "spark.mux.tls.pem_unreadable",
            TlsError::NoCertificates { .. } => "spark.mux.tls.no_certificates",
            TlsError::InvalidServerName(_) => "spark.mux.tls.invalid_server_name",
            TlsError::TrustAnchor(_) => "spark.mux.tls.invalid_trust_anchor",
            TlsError::Verifier(_) => "spark.mux.tls.verifier_failed",
            TlsError::Config(_) => "spark.mux.tls.config_rejected",
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

/// 入站连接对客户端证书的要求。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientAuth {
    /// 必须出示由 CA 签发的证书。
    #[default]
    Required,
    /// 出示则校验，不出示也放行。
    Optional,
    /// 不请求客户端证书。
    Disabled,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

/// 双向 TLS 所需的全部材料。
pub struct TlsSettings {
    roots: Arc<RootCertStore>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    server_name: ServerName<'static>,
}

impl TlsSettings {
    /// 由内存中的 DER 材料构造。
    pub fn from_der(
        ca: impl IntoIterator<Item = CertificateDer<'static>>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        server_name: &str,
    ) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in ca {
            roots.add(cert).map_err(TlsError::TrustAnchor)?;
        }
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_owned()))?;
        Ok(Self {
            roots: Arc::new(roots),
            chain,
            key,
            server_name,
        })
    }

    /// 由 PEM 文件加载。
    pub fn from_files(files: &TlsFiles) -> Result<Self, TlsError> {
        let ca = read_certificates(&files.ca_file)?;
        let chain = read_certificates(&files.cert_file)?;
        let key = PrivateKeyDer::from_pem_file(&files.key_file).map_err(|source| TlsError::Pem {
            path: files.key_file.display().to_string(),
            source,
        })?;
        Self::from_der(ca, chain, key, &files.server_name)
    }

    /// 拨号方期望对端证书匹配的名称。
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// 出站 rustls 配置：信任 CA 根，并以本端证书做客户端认证。
    pub fn outgoing_config(&self) -> Result<ClientConfig, TlsError> {
        ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsError::Config)?
            .with_root_certificates(Arc::clone(&self.roots))
            .with_client_auth_cert(self.chain.clone(), self.key.clone_key())
            .map_err(TlsError::Config)
    }

    /// 入站 rustls 配置，按 `auth` 决定是否校验客户端证书。
    pub fn incoming_config(&self, auth: ClientAuth) -> Result<ServerConfig, TlsError> {
        let builder = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsError::Config)?;
        let builder = match auth {
            ClientAuth::Disabled => builder.with_no_client_auth(),
            ClientAuth::Required | ClientAuth::Optional => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), provider());
                let verifier = if auth == ClientAuth::Optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                builder.with_client_cert_verifier(verifier.build().map_err(TlsError::Verifier)?)
            }
        };
        builder
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(TlsError::Config)
    }

    /// 拨号方使用的 TLS 句柄。
    pub fn client_tls(&self) -> Result<ClientTls, TlsError> {
        Ok(ClientTls::new(
            Arc::new(self.outgoing_config()?),
            self.server_name.clone(),
        ))
    }

    /// 受理方使用的可热更新 TLS 句柄，要求客户端证书。
    pub fn inbound_tls(&self) -> Result<InboundTls, TlsError> {
        Ok(InboundTls::from_config(
            self.incoming_config(ClientAuth::Required)?,
        ))
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("roots", &self.roots.len())
            .field("chain", &self.chain.len())
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let display = || path.display().to_string();
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|source| TlsError::Pem {
            path: display(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates { path: display() });
    }
    Ok(certs)
}

/// 拨号方的 TLS 连接器与期望的服务端名称。
#[derive(Clone)]
pub struct ClientTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTls {
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            server_name,
        }
    }

    /// 在已建立的流上完成客户端 TLS 握手。
    pub async fn connect<IO>(&self, stream: IO) -> io::Result<client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
    }
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// 可热更新的入站 TLS 配置。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 证书轮换时不能重建监听器，也不能打断已完成升级的连接；
///
/// ## 契约 (What)
/// - `accept` 每次握手读取一次最新快照，旧连接继续持有各自的 `Arc<ServerConfig>`；
/// - `replace` 对之后的握手立即可见，并返回被替换的旧配置。
///
/// ## 实现 (How)
/// - `ArcSwap<ServerConfig>`：读路径无锁，写路径原子交换指针（RCU 式广播）。
#[derive(Clone)]
pub struct InboundTls {
    inner: Arc<ArcSwap<ServerConfig>>,
}

impl InboundTls {
    pub fn new(initial: Arc<ServerConfig>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    #[inline]
    pub fn from_config(initial: ServerConfig) -> Self {
        Self::new(Arc::new(initial))
    }

    /// 当前配置的共享快照。
    #[inline]
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.inner.load_full()
    }

    /// 替换配置并返回旧值。
    #[inline]
    pub fn replace(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        self.inner.swap(next)
    }

    /// 以当前快照受理一次 TLS 握手。
    pub async fn accept<IO>(&self, stream: IO) -> io::Result<server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        TlsAcceptor::from(self.inner.load_full())
            .accept(stream)
            .await
    }
}

impl fmt::Debug for InboundTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundTls").finish_non_exhaustive()
    }
}

/// 测试用的临时 PKI：一个 CA 与它签发的两张叶子证书。
#[cfg(test)]
pub(crate) mod test_pki {
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    };
    use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    use super::TlsSettings;

    pub(crate) struct Pki {
        pub(crate) ca: CertificateDer<'static>,
        pub(crate) server: (CertificateDer<'static>, PrivateKeyDer<'static>),
        pub(crate) client: (CertificateDer<'static>, PrivateKeyDer<'static>),
    }

    impl Pki {
        pub(crate) fn generate() -> Self {
            let ca_key = KeyPair::generate().expect("ca key");
            let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
            ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            ca_params
                .distinguished_name
                .push(DnType::CommonName, "spark-mux test ca");
            let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

            let leaf = |name: &str| {
                let key = KeyPair::generate().expect("leaf key");
                let mut params =
                    CertificateParams::new(vec!["localhost".to_owned()]).expect("leaf params");
                params.distinguished_name.push(DnType::CommonName, name);
                params.extended_key_usages = vec![
                    ExtendedKeyUsagePurpose::ServerAuth,
                    ExtendedKeyUsagePurpose::ClientAuth,
                ];
                let cert = params
                    .signed_by(&key, &ca_cert, &ca_key)
                    .expect("leaf cert");
                (
                    cert.der().clone(),
                    PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der())),
                )
            };
            let server = leaf("spark-mux server");
            let client = leaf("spark-mux client");
            Self {
                ca: ca_cert.der().clone(),
                server,
                client,
            }
        }

        pub(crate) fn server_settings(&self) -> TlsSettings {
            TlsSettings::from_der(
                [self.ca.clone()],
                vec![self.server.0.clone()],
                self.server.1.clone_key(),
                "localhost",
            )
            .expect("server settings")
        }

        pub(crate) fn client_settings(&self) -> TlsSettings {
            TlsSettings::from_der(
                [self.ca.clone()],
                vec![self.client.0.clone()],
                self.client.1.clone_key(),
                "localhost",
            )
            .expect("client settings")
        }
    }
}
