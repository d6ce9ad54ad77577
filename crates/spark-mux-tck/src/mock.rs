//! 模拟服务。

use std::sync::Arc;

use spark_mux_rpc::{MethodTable, ServiceError, SharedService};

/// 只有一个 `ServMock` 方法的服务：原样返回整数参数。
pub fn serv_mock() -> SharedService {
    Arc::new(
        MethodTable::new().method("ServMock", |n: i64| async move { Ok::<_, ServiceError>(n) }),
    )
}

/// `ServMock` 之外再提供一个总是失败的 `Fail` 方法。
pub fn failing_mock() -> SharedService {
    Arc::new(
        MethodTable::new()
            .method("ServMock", |n: i64| async move { Ok::<_, ServiceError>(n) })
            .method("Fail", |_: ()| async move {
                Err::<(), _>(ServiceError::failed("mock failure"))
            }),
    )
}
