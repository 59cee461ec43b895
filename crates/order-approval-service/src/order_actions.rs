//! 订单聚合动作层
//!
//! 将审批结果落到 orders 表。每次状态变更都带版本号条件更新，
//! 版本不匹配说明决定已被先到的副本应用过，返回并发冲突而不是覆盖。

use async_trait::async_trait;
use sqlx::Row;
use tracing::debug;

use order_shared::database::Database;

use crate::payload::OrderApprovalOutcome;

/// 订单动作执行错误
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// 版本条件更新未命中，决定已被应用或订单被并发修改
    #[error("订单 {order_id} 版本冲突")]
    ConcurrencyConflict { order_id: String },

    /// 订单不存在，重投的决定对应的订单可能已被归档
    #[error("订单 {order_id} 不存在")]
    OrderNotFound { order_id: String },

    /// 底层存储错误
    #[error("订单存储错误: {0}")]
    Storage(#[from] sqlx::Error),
}

impl ActionError {
    /// 若底层是唯一约束冲突，返回对应的 SQLSTATE
    ///
    /// 幂等表的重复插入属于重投的正常副作用，调用方据此归类为良性空操作。
    pub fn duplicate_sql_state(&self) -> Option<String> {
        match self {
            Self::Storage(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                db_err.code().map(|c| c.into_owned())
            }
            _ => None,
        }
    }
}

/// 审批决定对应的订单动作
///
/// 处理层通过该 trait 驱动订单状态变更，测试时以内存实现替换。
#[async_trait]
pub trait OrderApprovalActions: Send + Sync {
    /// 审批通过，订单进入 APPROVED
    async fn approve_order(&self, outcome: &OrderApprovalOutcome) -> Result<(), ActionError>;

    /// 审批驳回，订单取消并记录驳回原因
    async fn reject_order(&self, outcome: &OrderApprovalOutcome) -> Result<(), ActionError>;
}

/// 基于 PostgreSQL 的订单动作实现
pub struct PgOrderApprovalActions {
    db: Database,
}

impl PgOrderApprovalActions {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 版本条件的状态迁移
    ///
    /// 先读当前版本，再以该版本为条件更新。两步之间被并发修改时
    /// 更新影响行数为 0，按并发冲突返回。
    async fn transition(
        &self,
        outcome: &OrderApprovalOutcome,
        target_status: &str,
        failure_messages: Option<String>,
    ) -> Result<(), ActionError> {
        let row = sqlx::query("SELECT version FROM orders WHERE id = $1")
            .bind(&outcome.order_id)
            .fetch_optional(self.db.pool())
            .await?;

        let Some(row) = row else {
            return Err(ActionError::OrderNotFound {
                order_id: outcome.order_id.clone(),
            });
        };
        let version: i32 = row.get("version");

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET order_status = $1, failure_messages = $2, version = version + 1
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(target_status)
        .bind(&failure_messages)
        .bind(&outcome.order_id)
        .bind(version)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(ActionError::ConcurrencyConflict {
                order_id: outcome.order_id.clone(),
            });
        }

        debug!(
            order_id = %outcome.order_id,
            status = target_status,
            version = version + 1,
            "订单状态已更新"
        );
        Ok(())
    }
}

#[async_trait]
impl OrderApprovalActions for PgOrderApprovalActions {
    async fn approve_order(&self, outcome: &OrderApprovalOutcome) -> Result<(), ActionError> {
        self.transition(outcome, "APPROVED", None).await
    }

    async fn reject_order(&self, outcome: &OrderApprovalOutcome) -> Result<(), ActionError> {
        self.transition(outcome, "CANCELLED", Some(outcome.joined_failure_messages()))
            .await
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::ActionError;

    /// 模拟 PostgreSQL 唯一约束冲突的存储错误
    #[derive(Debug)]
    pub(crate) struct DuplicateKeyViolation;

    impl std::fmt::Display for DuplicateKeyViolation {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("duplicate key value violates unique constraint")
        }
    }

    impl std::error::Error for DuplicateKeyViolation {}

    impl sqlx::error::DatabaseError for DuplicateKeyViolation {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some("23505".into())
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::UniqueViolation
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
    }

    pub(crate) fn duplicate_key_error() -> ActionError {
        ActionError::Storage(sqlx::Error::Database(Box::new(DuplicateKeyViolation)))
    }
}
