//! 审批变更批处理器
//!
//! 接收一批 CDC 变更消息，先统计其中的新审批决定，再逐条处理。
//! 单条记录的任何结果（生效、跳过、良性空操作、失败）都不会
//! 中断后续记录，整批尝试完毕后把逐条结果交还给消费层，
//! 由消费层决定哪些失败需要进死信队列。

use std::sync::Arc;
use std::time::Instant;

use tracing::{Instrument, info, info_span, warn};

use order_shared::kafka::ConsumerMessage;
use order_shared::observability::set_parent_from_headers;

use crate::cdc::ChangeEnvelope;
use crate::error::ApprovalError;
use crate::guard::{self, IgnoreReason, RecordOutcome};
use crate::order_actions::OrderApprovalActions;
use crate::payload::{self, OrderApprovalOutcome};

/// 一批变更消息的处理结果
#[derive(Debug)]
pub struct BatchOutcome {
    /// 与输入消息一一对应的逐条结果
    pub results: Vec<RecordOutcome>,
    /// 批内新审批决定的数量
    pub new_decisions: usize,
}

impl BatchOutcome {
    pub fn applied_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, RecordOutcome::Applied))
            .count()
    }

    pub fn benign_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, RecordOutcome::BenignNoOp(_)))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, RecordOutcome::Failed(_)))
            .count()
    }
}

/// 审批变更流的批处理器
pub struct ApprovalBatchListener {
    actions: Arc<dyn OrderApprovalActions>,
}

impl ApprovalBatchListener {
    pub fn new(actions: Arc<dyn OrderApprovalActions>) -> Self {
        Self { actions }
    }

    /// 处理一批变更消息
    pub async fn handle_batch(&self, batch: &[ConsumerMessage]) -> BatchOutcome {
        let started = Instant::now();
        metrics::counter!("approval_records_received_total").increment(batch.len() as u64);

        // 先解一遍信封，统计批内新决定数，与处理结果无关
        let envelopes: Vec<Result<ChangeEnvelope, ApprovalError>> = batch
            .iter()
            .map(|msg| {
                serde_json::from_slice::<ChangeEnvelope>(&msg.payload).map_err(|e| {
                    ApprovalError::MalformedEnvelope {
                        reason: e.to_string(),
                    }
                })
            })
            .collect();

        let new_decisions = envelopes
            .iter()
            .filter(|e| e.as_ref().map(|env| env.is_new_decision()).unwrap_or(false))
            .count();

        info!(
            batch_size = batch.len(),
            new_decisions, "收到审批变更批次"
        );
        metrics::counter!("approval_new_decisions_total").increment(new_decisions as u64);

        let mut results = Vec::with_capacity(batch.len());
        for (msg, envelope) in batch.iter().zip(envelopes) {
            // 每条记录独立的 span，DLQ 重投的消息可携带上游追踪上下文
            let span = info_span!(
                "approval_record",
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
            );
            span.in_scope(|| set_parent_from_headers(&msg.headers));
            results.push(self.handle_record(msg, envelope).instrument(span).await);
        }

        let outcome = BatchOutcome {
            results,
            new_decisions,
        };

        metrics::counter!("approval_decisions_applied_total")
            .increment(outcome.applied_count() as u64);
        metrics::histogram!("approval_batch_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            applied = outcome.applied_count(),
            benign = outcome.benign_count(),
            failed = outcome.failed_count(),
            "审批变更批次处理完毕"
        );

        outcome
    }

    /// 处理单条变更记录
    async fn handle_record(
        &self,
        msg: &ConsumerMessage,
        envelope: Result<ChangeEnvelope, ApprovalError>,
    ) -> RecordOutcome {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %err,
                    "变更信封无法解析，跳过记录"
                );
                metrics::counter!("approval_malformed_payloads_total").increment(1);
                return RecordOutcome::Failed(err);
            }
        };

        if !envelope.is_new_decision() {
            return RecordOutcome::Ignored(IgnoreReason::NotNewDecision);
        }

        let Some(row) = envelope.post_image() else {
            // 插入变更没有后镜像说明 connector 输出异常
            let err = ApprovalError::MalformedEnvelope {
                reason: "插入变更缺少 after 镜像".to_string(),
            };
            warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                error = %err,
                "变更信封不完整，跳过记录"
            );
            metrics::counter!("approval_malformed_payloads_total").increment(1);
            return RecordOutcome::Failed(err);
        };

        let decision = match payload::decode_decision_payload(&row.payload) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    outbox_id = %row.id,
                    saga_id = ?row.saga_id,
                    error = %err,
                    "审批负载无法解析，跳过记录"
                );
                metrics::counter!("approval_malformed_payloads_total").increment(1);
                return RecordOutcome::Failed(err);
            }
        };

        let outcome = OrderApprovalOutcome::from_parts(decision, row);
        let result = guard::apply_decision(self.actions.as_ref(), &outcome).await;

        match &result {
            RecordOutcome::BenignNoOp(benign) => {
                metrics::counter!("approval_benign_noops_total", "kind" => benign.kind())
                    .increment(1);
            }
            RecordOutcome::Failed(_) => {
                metrics::counter!("approval_unexpected_failures_total").increment(1);
            }
            _ => {}
        }

        result
    }
}
