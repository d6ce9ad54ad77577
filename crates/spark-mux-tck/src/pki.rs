//! 一次性测试 PKI。
//!
//! # 教案式说明
//! - **意图（Why）**：场景测试需要一个互相信任的 CA、服务端与客户端证书，且不能依赖仓库中的固定密钥；
//! - **契约（What）**：叶子证书的 SAN 固定为 `localhost`，同时带有 ServerAuth 与 ClientAuth 用途，
//!   因此同一份材料既可用于受理方也可用于拨号方；
//! - **权衡（Trade-off）**：每次调用都重新生成密钥，耗时毫秒级，换取用例之间完全隔离。

use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spark_mux::{TlsFiles, TlsSettings};

/// 证书与私钥，同时保留 DER 与 PEM 两种形式。
pub struct Identity {
    pub cert: CertificateDer<'static>,
    pub cert_pem: String,
    key_der: Vec<u8>,
    pub key_pem: String,
}

impl Identity {
    fn issue(name: &str, ca_cert: &Certificate, ca_key: &KeyPair) -> Result<Self> {
        let key = KeyPair::generate().context("generating leaf key")?;
        let mut params = CertificateParams::new(vec!["localhost".to_owned()])
            .context("building leaf params")?;
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params
            .signed_by(&key, ca_cert, ca_key)
            .context("signing leaf certificate")?;
        Ok(Self {
            cert: cert.der().clone(),
            cert_pem: cert.pem(),
            key_der: key.serialize_der(),
            key_pem: key.serialize_pem(),
        })
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// 测试 CA 及其签发的服务端、客户端身份。
pub struct TestPki {
    pub ca: CertificateDer<'static>,
    pub ca_pem: String,
    pub server: Identity,
    pub client: Identity,
}

impl TestPki {
    pub fn generate() -> Result<Self> {
        let ca_key = KeyPair::generate().context("generating ca key")?;
        let mut params =
            CertificateParams::new(Vec::<String>::new()).context("building ca params")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "spark-mux tck ca");
        let ca_cert = params.self_signed(&ca_key).context("self-signing ca")?;

        Ok(Self {
            server: Identity::issue("spark-mux tck server", &ca_cert, &ca_key)?,
            client: Identity::issue("spark-mux tck client", &ca_cert, &ca_key)?,
            ca: ca_cert.der().clone(),
            ca_pem: ca_cert.pem(),
        })
    }

    /// 受理方使用的 TLS 材料。
    pub fn server_settings(&self) -> Result<TlsSettings> {
        self.settings_for(&self.server)
    }

    /// 拨号方使用的 TLS 材料。
    pub fn client_settings(&self) -> Result<TlsSettings> {
        self.settings_for(&self.client)
    }

    fn settings_for(&self, identity: &Identity) -> Result<TlsSettings> {
        TlsSettings::from_der(
            [self.ca.clone()],
            vec![identity.cert.clone()],
            identity.key(),
            "localhost",
        )
        .context("building tls settings")
    }

    /// 把 CA 与服务端身份写成 PEM 文件，返回可直接放入配置的路径集合。
    pub fn write_server_pem(&self, dir: &Path) -> Result<TlsFiles> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let files = TlsFiles {
            ca_file: dir.join("ca.pem"),
            cert_file: dir.join("server.pem"),
            key_file: dir.join("server.key"),
            server_name: "localhost".to_owned(),
        };
        write(&files.ca_file, &self.ca_pem)?;
        write(&files.cert_file, &self.server.cert_pem)?;
        write(&files.key_file, &self.server.key_pem)?;
        Ok(files)
    }
}

fn write(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}

/// 进程内唯一的临时目录路径（不会自动创建）。
pub fn scratch_dir(label: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("spark-mux-tck-{label}-{}-{n}", process::id()))
}
