//! 审批决定负载模型
//!
//! outbox 行的 payload 列是餐厅服务序列化的审批决定 JSON。
//! 本模块负责解码并校验该负载，再与行上的 saga 元数据合并为
//! 下游动作层消费的审批结果。

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::cdc::OutboxRow;
use crate::error::ApprovalError;

/// 餐厅审批状态
///
/// 上游可能引入新的状态值，未识别的值归入 Other，
/// 由处理层按"不可执行"忽略而不是解析失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// 餐厅确认可以接单
    Approved,
    /// 餐厅驳回了订单
    Rejected,
    /// 未识别的状态值
    #[serde(other)]
    Other,
}

/// outbox payload 列反序列化出的审批决定
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecisionPayload {
    /// 被审批的订单标识
    pub order_id: String,
    /// 做出决定的餐厅标识
    #[serde(default)]
    pub restaurant_id: Option<String>,
    /// 审批结果
    pub order_approval_status: ApprovalStatus,
    /// 驳回原因列表，审批通过时为空
    #[serde(default)]
    pub failure_messages: Vec<String>,
    /// 决定产生时间
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// 解码 outbox 行携带的审批决定负载
///
/// 负载无法解析或缺少有效的订单标识都视为结构性错误，
/// 这类记录重投也无法修复，不进入死信队列。
pub fn decode_decision_payload(raw: &str) -> Result<ApprovalDecisionPayload, ApprovalError> {
    let payload: ApprovalDecisionPayload =
        serde_json::from_str(raw).map_err(|e| ApprovalError::MalformedPayload {
            reason: e.to_string(),
        })?;

    if payload.order_id.trim().is_empty() {
        return Err(ApprovalError::MalformedPayload {
            reason: "orderId 为空".to_string(),
        });
    }

    Ok(payload)
}

/// 合并负载与行元数据后的审批结果
///
/// 动作层只依赖这一结构，不感知 CDC 信封或 outbox 行的形状。
#[derive(Debug, Clone)]
pub struct OrderApprovalOutcome {
    pub order_id: String,
    pub saga_id: Option<String>,
    pub status: ApprovalStatus,
    pub failure_messages: Vec<String>,
}

impl OrderApprovalOutcome {
    /// 由解码后的负载与 outbox 行构造审批结果
    pub fn from_parts(payload: ApprovalDecisionPayload, row: &OutboxRow) -> Self {
        Self {
            order_id: payload.order_id,
            saga_id: row.saga_id.clone(),
            status: payload.order_approval_status,
            failure_messages: payload.failure_messages,
        }
    }

    /// 驳回原因合并为单列存储的文本
    pub fn joined_failure_messages(&self) -> String {
        self.failure_messages.join(",")
    }
}
