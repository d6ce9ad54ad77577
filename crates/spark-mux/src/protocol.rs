//! 协议标识与内建标识常量。
//!
//! 标识在构造时规范化为去除首尾空白的大写 ASCII，注册表与握手两侧据此按字节比较；
//! `RPCTLS` 与 `REG` 为保留标识，不可被注册覆盖。

use std::{borrow::Borrow, fmt, str::FromStr, sync::Arc};

use crate::error::ProtocolIdError;

/// TLS 升级标识：握手中出现该标识时，双方把连接包装为 TLS 后重新协商协议标识。
pub const RPC_TLS: &str = "RPCTLS";
/// 共识协议的内建占位标识。
pub const RAFT: &str = "RAFT";
/// Mesh 协议的内建占位标识。
pub const MESH: &str = "MESH";
/// 通用 RPC（Registered）标识，桥接到 RPC 调用引擎。
pub const REGISTERED: &str = "REG";

/// 不可被注册覆盖的内建标识。
pub const RESERVED: [&str; 2] = [RPC_TLS, REGISTERED];

/// 经过规范化（去除首尾空白、转大写）的协议标识。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 协议标识既出现在线上握手，也作为注册表与连接池键的一部分，三处必须使用同一规范形式，
///   否则 `"reg"` 与 `"REG"` 会被当作两个协议；
/// - 内部使用 `Arc<str>`，在注册表快照、连接池键与日志字段之间共享时只增加引用计数。
///
/// ## 契约 (What)
/// - 非空、仅含 ASCII 可见字符、长度不超过 [`ProtocolId::MAX_LEN`]；
/// - 实现 `Borrow<str>`，因此 `HashMap<ProtocolId, _>` 可以直接用 `&str` 查询（需已规范化）。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(Arc<str>);

impl ProtocolId {
    /// 单个标识的最大字节数，同时约束分隔符线格式的读取上限。
    pub const MAX_LEN: usize = 64;

    /// 校验并规范化协议标识。
    pub fn new(name: &str) -> Result<Self, ProtocolIdError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ProtocolIdError::Empty);
        }
        if trimmed.len() > Self::MAX_LEN {
            return Err(ProtocolIdError::TooLong {
                len: trimmed.len(),
                limit: Self::MAX_LEN,
            });
        }
        if !trimmed.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ProtocolIdError::InvalidCharacter(trimmed.to_owned()));
        }
        Ok(Self(Arc::from(trimmed.to_ascii_uppercase())))
    }

    /// `RPCTLS`
    pub fn rpc_tls() -> Self {
        Self(Arc::from(RPC_TLS))
    }

    /// `REG`
    pub fn registered() -> Self {
        Self(Arc::from(REGISTERED))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 是否为 TLS 升级标识。
    pub fn is_escalation(&self) -> bool {
        self.as_str() == RPC_TLS
    }

    /// 是否为不可覆盖的保留标识。
    pub fn is_reserved(&self) -> bool {
        RESERVED.contains(&self.as_str())
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolId({})", self.0)
    }
}

impl FromStr for ProtocolId {
    type Err = ProtocolIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ProtocolId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ProtocolId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        let id = ProtocolId::new("  raft\r").expect("valid identifier");
        assert_eq!(id.as_str(), RAFT);
        assert_eq!(id, "RAFT".parse().expect("valid identifier"));
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(ProtocolId::new(" \n"), Err(ProtocolIdError::Empty));
        assert!(matches!(
            ProtocolId::new("two words"),
            Err(ProtocolIdError::InvalidCharacter(_))
        ));
        let long = "x".repeat(ProtocolId::MAX_LEN + 1);
        assert!(matches!(
            ProtocolId::new(&long),
            Err(ProtocolIdError::TooLong { .. })
        ));
    }

    #[test]
    fn reserved_set() {
        assert!(ProtocolId::rpc_tls().is_reserved());
        assert!(ProtocolId::registered().is_reserved());
        assert!(!ProtocolId::new(MESH).expect("valid").is_reserved());
        assert!(ProtocolId::new("rpctls").expect("valid").is_escalation());
    }
}
