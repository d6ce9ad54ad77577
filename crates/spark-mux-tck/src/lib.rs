#![doc = r#"
# spark-mux-tck

## 章节定位（Why）
- 为分发器、握手与连接池提供跨 crate 的端到端回归：单个 crate 的单元测试只能覆盖自己的一侧，
  这里把真实监听端口、真实 TLS 与连接池串起来；

## 结构概览（How）
- [`pki`]：用 `rcgen` 生成一次性 CA 与双用途叶子证书，可导出为 DER 设置或 PEM 文件；
- [`mock`]：与调用引擎约定的 `ServMock` 回显服务；
- [`harness`]：在回环地址上启动分发器、构造连接池设置；
- 场景用例位于 `tests/` 目录。
"#]
#![deny(unsafe_code)]

pub mod harness;
pub mod mock;
pub mod pki;
