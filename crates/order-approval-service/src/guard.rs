//! 幂等防护与失败分类
//!
//! 变更流是 at-least-once 的，同一审批决定可能被重复投递，
//! 也可能与另一个消费副本并发处理。本模块把动作执行的失败
//! 分为两类：重投的正常副作用（良性空操作，吞掉并告警）与
//! 真正的异常（上抛给调用方决定是否进死信队列）。

use tracing::{error, info, warn};

use crate::error::ApprovalError;
use crate::order_actions::{ActionError, OrderApprovalActions};
use crate::payload::{ApprovalStatus, OrderApprovalOutcome};

/// 良性空操作的具体成因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenignOutcome {
    /// 版本条件更新落空，决定已被先到的投递应用
    ConcurrencyConflict,
    /// 订单不存在，通常是重投时订单已被归档
    OrderNotFound,
    /// 幂等记录的唯一约束冲突
    DuplicateKey { sql_state: String },
}

impl BenignOutcome {
    /// 指标与日志用的成因标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::OrderNotFound => "order_not_found",
            Self::DuplicateKey { .. } => "duplicate_key",
        }
    }
}

/// 记录被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// 不是新插入的审批决定（更新、删除或快照读）
    NotNewDecision,
    /// 审批状态不是可执行的取值
    NotActionableStatus,
}

/// 单条变更记录的处理结果
#[derive(Debug)]
pub enum RecordOutcome {
    /// 决定已生效
    Applied,
    /// 记录被跳过
    Ignored(IgnoreReason),
    /// 失败被归类为重投的正常副作用
    BenignNoOp(BenignOutcome),
    /// 未归类的失败
    Failed(ApprovalError),
}

/// 按审批状态执行订单动作并归类结果
pub async fn apply_decision(
    actions: &dyn OrderApprovalActions,
    outcome: &OrderApprovalOutcome,
) -> RecordOutcome {
    let result = match outcome.status {
        ApprovalStatus::Approved => actions.approve_order(outcome).await,
        ApprovalStatus::Rejected => actions.reject_order(outcome).await,
        ApprovalStatus::Other => {
            warn!(
                order_id = %outcome.order_id,
                "审批状态不可执行，跳过记录"
            );
            return RecordOutcome::Ignored(IgnoreReason::NotActionableStatus);
        }
    };

    match result {
        Ok(()) => {
            info!(
                order_id = %outcome.order_id,
                saga_id = ?outcome.saga_id,
                status = ?outcome.status,
                "审批决定已生效"
            );
            RecordOutcome::Applied
        }
        Err(err) => classify_action_error(outcome, err),
    }
}

/// 把动作错误归类为良性空操作或未归类失败
fn classify_action_error(outcome: &OrderApprovalOutcome, err: ActionError) -> RecordOutcome {
    if let Some(sql_state) = err.duplicate_sql_state() {
        warn!(
            order_id = %outcome.order_id,
            sql_state = %sql_state,
            "唯一约束冲突，决定已处理过"
        );
        return RecordOutcome::BenignNoOp(BenignOutcome::DuplicateKey { sql_state });
    }

    match err {
        ActionError::ConcurrencyConflict { .. } => {
            warn!(
                order_id = %outcome.order_id,
                "乐观锁冲突，决定已被并发投递应用"
            );
            RecordOutcome::BenignNoOp(BenignOutcome::ConcurrencyConflict)
        }
        ActionError::OrderNotFound { .. } => {
            warn!(
                order_id = %outcome.order_id,
                "订单不存在，按重投副作用忽略"
            );
            RecordOutcome::BenignNoOp(BenignOutcome::OrderNotFound)
        }
        err => {
            error!(
                order_id = %outcome.order_id,
                error = %err,
                "审批决定执行失败"
            );
            RecordOutcome::Failed(ApprovalError::Action(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 按脚本返回结果的动作桩
    struct ScriptedActions {
        approve_result: Mutex<Option<ActionError>>,
        reject_result: Mutex<Option<ActionError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedActions {
        fn ok() -> Self {
            Self {
                approve_result: Mutex::new(None),
                reject_result: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing_approve(err: ActionError) -> Self {
            let actions = Self::ok();
            *actions.approve_result.lock().unwrap() = Some(err);
            actions
        }
    }

    #[async_trait]
    impl OrderApprovalActions for ScriptedActions {
        async fn approve_order(
            &self,
            outcome: &OrderApprovalOutcome,
        ) -> Result<(), ActionError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("approve:{}", outcome.order_id));
            match self.approve_result.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn reject_order(
            &self,
            outcome: &OrderApprovalOutcome,
        ) -> Result<(), ActionError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reject:{}", outcome.order_id));
            match self.reject_result.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn outcome(order_id: &str, status: ApprovalStatus) -> OrderApprovalOutcome {
        OrderApprovalOutcome {
            order_id: order_id.to_string(),
            saga_id: Some("saga-1".to_string()),
            status,
            failure_messages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_approved_routes_to_approve_order() {
        let actions = ScriptedActions::ok();
        let result = apply_decision(&actions, &outcome("O1", ApprovalStatus::Approved)).await;
        assert!(matches!(result, RecordOutcome::Applied));
        assert_eq!(actions.calls.lock().unwrap().as_slice(), ["approve:O1"]);
    }

    #[tokio::test]
    async fn test_rejected_routes_to_reject_order() {
        let actions = ScriptedActions::ok();
        let result = apply_decision(&actions, &outcome("O2", ApprovalStatus::Rejected)).await;
        assert!(matches!(result, RecordOutcome::Applied));
        assert_eq!(actions.calls.lock().unwrap().as_slice(), ["reject:O2"]);
    }

    #[tokio::test]
    async fn test_other_status_is_ignored_without_action() {
        let actions = ScriptedActions::ok();
        let result = apply_decision(&actions, &outcome("O3", ApprovalStatus::Other)).await;
        assert!(matches!(
            result,
            RecordOutcome::Ignored(IgnoreReason::NotActionableStatus)
        ));
        assert!(actions.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_conflict_is_benign() {
        let actions = ScriptedActions::failing_approve(ActionError::ConcurrencyConflict {
            order_id: "O1".to_string(),
        });
        let result = apply_decision(&actions, &outcome("O1", ApprovalStatus::Approved)).await;
        match result {
            RecordOutcome::BenignNoOp(benign) => {
                assert_eq!(benign.kind(), "concurrency_conflict")
            }
            other => panic!("期望良性空操作，得到 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_order_not_found_is_benign() {
        let actions = ScriptedActions::failing_approve(ActionError::OrderNotFound {
            order_id: "O1".to_string(),
        });
        let result = apply_decision(&actions, &outcome("O1", ApprovalStatus::Approved)).await;
        match result {
            RecordOutcome::BenignNoOp(benign) => assert_eq!(benign.kind(), "order_not_found"),
            other => panic!("期望良性空操作，得到 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_violation_is_benign() {
        let actions = ScriptedActions::failing_approve(
            crate::order_actions::test_fixtures::duplicate_key_error(),
        );
        let result = apply_decision(&actions, &outcome("O1", ApprovalStatus::Approved)).await;
        match result {
            RecordOutcome::BenignNoOp(BenignOutcome::DuplicateKey { sql_state }) => {
                assert_eq!(sql_state, "23505")
            }
            other => panic!("期望良性空操作，得到 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_storage_error_is_unexpected_failure() {
        let actions =
            ScriptedActions::failing_approve(ActionError::Storage(sqlx::Error::PoolTimedOut));
        let result = apply_decision(&actions, &outcome("O1", ApprovalStatus::Approved)).await;
        match result {
            RecordOutcome::Failed(err) => assert!(!err.is_structural()),
            other => panic!("期望失败结果，得到 {:?}", other),
        }
    }
}
