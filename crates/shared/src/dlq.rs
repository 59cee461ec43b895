//! 死信队列
//!
//! 记录处理出现未归类失败时不卡住消费位点：原始消息连同失败元数据
//! 写入死信 topic，独立消费组按指数退避把到期的消息发回原始 topic
//! 重投，耗尽次数后记错误日志等人工介入。
//! 结构性失败（无法解析的记录）不进入死信队列，重投只会原样复现。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::OrderError;
use crate::kafka::{ConsumerMessage, KafkaConsumer, KafkaProducer, topics};
use crate::retry::RetryPolicy;

/// 死信信封
///
/// 字段用 camelCase 序列化，与平台其余服务的死信格式保持一致。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// "topic-partition-offset"，定位原始消息
    pub message_id: String,
    pub source_topic: String,
    /// 原始负载原样透传，重投时字节一致
    pub payload: String,
    /// 最近一次的失败原因
    pub error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    /// None 表示不再安排重投
    pub next_retry_at: Option<DateTime<Utc>>,
    pub source_service: String,
}

/// 对一条死信此刻的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryDecision {
    /// 发回原始 topic 重投
    Redeliver,
    /// 重试时间未到，留待下次消费
    NotDue,
    /// 已耗尽重试次数，人工介入
    Exhausted,
}

impl DeadLetterMessage {
    /// 由处理失败的原始消息构造首个死信信封
    ///
    /// next_retry_at 置为当前时间，重投消费者首轮扫描即可尝试。
    pub fn from_record(
        record: &ConsumerMessage,
        error: &str,
        max_retries: u32,
        source_service: &str,
    ) -> Result<Self, OrderError> {
        let now = Utc::now();
        Ok(Self {
            message_id: format!("{}-{}-{}", record.topic, record.partition, record.offset),
            source_topic: record.topic.clone(),
            payload: record.payload_str()?.to_string(),
            error: error.to_string(),
            retry_count: 0,
            max_retries,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: Some(now),
            source_service: source_service.to_string(),
        })
    }

    /// 重投失败后推进重试元数据
    ///
    /// 未到上限时按退避策略排下一次重投时间，到上限则不再安排。
    pub fn record_failure(&mut self, error: &str, policy: &RetryPolicy) {
        self.retry_count += 1;
        self.error = error.to_string();
        self.last_failed_at = Utc::now();
        self.next_retry_at = (self.retry_count < self.max_retries).then(|| {
            let delay = policy.delay_for_attempt(self.retry_count);
            self.last_failed_at + chrono::Duration::from_std(delay).unwrap_or_default()
        });
    }

    /// 判定此刻的处置
    pub fn redelivery_decision(&self, now: DateTime<Utc>) -> RedeliveryDecision {
        if self.retry_count >= self.max_retries {
            return RedeliveryDecision::Exhausted;
        }
        match self.next_retry_at {
            Some(due) if now >= due => RedeliveryDecision::Redeliver,
            _ => RedeliveryDecision::NotDue,
        }
    }
}

// ---------------------------------------------------------------------------
// DlqProducer
// ---------------------------------------------------------------------------

/// 业务消费侧的死信入口
pub struct DlqProducer {
    producer: KafkaProducer,
    source_service: String,
    retry_policy: RetryPolicy,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, source_service: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            producer,
            source_service: source_service.to_string(),
            retry_policy,
        }
    }

    /// 把处理失败的记录连同失败原因停进死信 topic
    pub async fn park(&self, record: &ConsumerMessage, error: &str) -> Result<(), OrderError> {
        let dlq_msg = DeadLetterMessage::from_record(
            record,
            error,
            self.retry_policy.max_retries,
            &self.source_service,
        )?;

        self.producer
            .send_json(topics::DEAD_LETTER_QUEUE, &dlq_msg.message_id, &dlq_msg)
            .await?;

        warn!(
            message_id = %dlq_msg.message_id,
            source_topic = %record.topic,
            error,
            "记录已写入死信队列"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DlqConsumer
// ---------------------------------------------------------------------------

/// 死信重投消费者
///
/// 挂在 ".dlq" 后缀的独立消费组上，与业务消费互不影响。
pub struct DlqConsumer {
    consumer: KafkaConsumer,
    producer: KafkaProducer,
    retry_policy: RetryPolicy,
}

impl DlqConsumer {
    pub fn new(config: &AppConfig, producer: KafkaProducer) -> Result<Self, OrderError> {
        let consumer = KafkaConsumer::new(&config.kafka, Some("dlq"))?;
        consumer.subscribe(&[topics::DEAD_LETTER_QUEUE])?;

        Ok(Self {
            consumer,
            producer,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// 启动重投循环，直到收到关闭信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let producer = self.producer.clone();
        let policy = self.retry_policy.clone();

        self.consumer
            .start(shutdown, move |msg| {
                let producer = producer.clone();
                let policy = policy.clone();
                async move { redeliver(&msg, &producer, &policy).await }
            })
            .await;

        info!("死信重投循环已退出");
    }
}

/// 处理一条死信
async fn redeliver(
    msg: &ConsumerMessage,
    producer: &KafkaProducer,
    policy: &RetryPolicy,
) -> Result<(), OrderError> {
    let mut dlq_msg: DeadLetterMessage = msg.deserialize_payload()?;

    match dlq_msg.redelivery_decision(Utc::now()) {
        RedeliveryDecision::Redeliver => {
            info!(
                message_id = %dlq_msg.message_id,
                source_topic = %dlq_msg.source_topic,
                retry_count = dlq_msg.retry_count,
                "重投死信消息到原始 topic"
            );

            if let Err(err) = producer
                .send(
                    &dlq_msg.source_topic,
                    &dlq_msg.message_id,
                    dlq_msg.payload.as_bytes(),
                )
                .await
            {
                // 发回原始 topic 失败，推进计数后放回死信 topic
                dlq_msg.record_failure(&err.to_string(), policy);
                producer
                    .send_json(topics::DEAD_LETTER_QUEUE, &dlq_msg.message_id, &dlq_msg)
                    .await?;
            }
        }
        RedeliveryDecision::NotDue => {
            info!(
                message_id = %dlq_msg.message_id,
                next_retry_at = ?dlq_msg.next_retry_at,
                "死信消息重试时间未到"
            );
        }
        RedeliveryDecision::Exhausted => {
            error!(
                message_id = %dlq_msg.message_id,
                source_topic = %dlq_msg.source_topic,
                source_service = %dlq_msg.source_service,
                retry_count = dlq_msg.retry_count,
                error = %dlq_msg.error,
                "死信消息已耗尽重试次数，需人工介入"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn record(offset: i64) -> ConsumerMessage {
        ConsumerMessage {
            topic: "restaurant.public.order_outbox".to_string(),
            partition: 3,
            offset,
            key: None,
            payload: br#"{"op":"c","before":null}"#.to_vec(),
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_from_record_builds_first_envelope() {
        let msg = DeadLetterMessage::from_record(
            &record(41),
            "订单存储错误",
            3,
            "order-approval-service",
        )
        .unwrap();

        assert_eq!(msg.message_id, "restaurant.public.order_outbox-3-41");
        assert_eq!(msg.source_topic, "restaurant.public.order_outbox");
        assert_eq!(msg.payload, r#"{"op":"c","before":null}"#);
        assert_eq!(msg.retry_count, 0);
        // 首轮扫描就应判定为可重投
        assert_eq!(
            msg.redelivery_decision(Utc::now()),
            RedeliveryDecision::Redeliver
        );
    }

    #[test]
    fn test_future_retry_time_is_not_due() {
        let mut msg =
            DeadLetterMessage::from_record(&record(1), "超时", 3, "svc").unwrap();
        msg.next_retry_at = Some(Utc::now() + chrono::Duration::minutes(5));

        assert_eq!(
            msg.redelivery_decision(Utc::now()),
            RedeliveryDecision::NotDue
        );
    }

    #[test]
    fn test_record_failure_schedules_backoff_then_exhausts() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        };
        let mut msg = DeadLetterMessage::from_record(&record(1), "首次失败", 2, "svc").unwrap();
        let first_failed = msg.first_failed_at;

        msg.record_failure("再次失败", &policy);
        assert_eq!(msg.retry_count, 1);
        assert_eq!(msg.error, "再次失败");
        // 首次失败时间不随重试变化
        assert_eq!(msg.first_failed_at, first_failed);
        let due = msg.next_retry_at.expect("应排了下一次重投");
        assert!(due > msg.last_failed_at);

        msg.record_failure("最终失败", &policy);
        assert_eq!(msg.retry_count, 2);
        assert!(msg.next_retry_at.is_none());
        assert_eq!(
            msg.redelivery_decision(Utc::now()),
            RedeliveryDecision::Exhausted
        );
    }

    #[test]
    fn test_envelope_round_trips_as_camel_case() {
        let msg = DeadLetterMessage::from_record(&record(9), "写入失败", 3, "svc").unwrap();

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("messageId"));
        assert!(json.contains("sourceTopic"));
        assert!(json.contains("nextRetryAt"));

        let parsed: DeadLetterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.message_id, msg.message_id);
        assert_eq!(parsed.max_retries, 3);
    }

    #[test]
    fn test_non_utf8_payload_is_rejected() {
        let mut bad = record(1);
        bad.payload = vec![0xFF, 0xFE];

        assert!(DeadLetterMessage::from_record(&bad, "err", 3, "svc").is_err());
    }
}
