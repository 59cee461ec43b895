//! 订单审批消费服务
//!
//! 消费 Debezium 从餐厅服务 order_outbox 表捕获的变更流，
//! 将每条"新审批决定"转换为恰好一次生效的订单状态变更：
//! 审批通过 → 订单 APPROVED，审批驳回 → 订单按驳回原因取消。
//! 变更流是 at-least-once 的，重投与并发消费由乐观锁冲突分类兜底，
//! 单条记录的失败不会中断同批其余记录的处理。

pub mod cdc;
pub mod consumer;
pub mod error;
pub mod guard;
pub mod listener;
pub mod order_actions;
pub mod payload;
