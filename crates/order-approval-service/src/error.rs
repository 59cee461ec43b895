//! 订单审批服务专用错误类型
//!
//! 在共享库 OrderError 基础上定义本服务特有的错误变体。
//! "结构性"错误（信封或负载无法解析）重投只会原样复现，
//! 因此跳过记录而不进入死信队列；动作执行的未归类失败则会进入
//! DLQ 交给传输层的重试策略。

use order_shared::error::OrderError;

use crate::order_actions::ActionError;

/// 订单审批处理错误
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// CDC 变更信封无法解析，说明上游序列化格式发生了不兼容变化
    #[error("无法解析的变更信封: {reason}")]
    MalformedEnvelope { reason: String },

    /// outbox 行内嵌的审批负载无法解析或缺少必需字段
    #[error("无法解析的审批负载: {reason}")]
    MalformedPayload { reason: String },

    /// 订单聚合动作执行失败（已排除可归类为良性空操作的失败）
    #[error("订单审批动作执行失败: {0}")]
    Action(#[from] ActionError),

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] OrderError),
}

impl ApprovalError {
    /// 是否为结构性错误
    ///
    /// 结构性错误的字节在重投后不会改变，发送到 DLQ 重试没有意义。
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::MalformedEnvelope { .. } | Self::MalformedPayload { .. }
        )
    }
}
