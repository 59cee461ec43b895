//! 审批变更流消费入口
//!
//! 把共享库的攒批消费者、批处理器和 DLQ 生产者接到一起：
//! 订阅 outbox 变更 topic，整批交给 ApprovalBatchListener 处理，
//! 未归类失败的记录送入死信队列，结构性失败只记日志。
//! 批处理闭包总是返回 Ok，offset 在每批尝试完毕后提交，
//! 失败记录靠 DLQ 重投而不是靠卡住消费位点。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use order_shared::config::AppConfig;
use order_shared::dlq::DlqProducer;
use order_shared::error::OrderError;
use order_shared::kafka::{KafkaConsumer, KafkaProducer, topics};
use order_shared::retry::RetryPolicy;

use crate::guard::RecordOutcome;
use crate::listener::ApprovalBatchListener;
use crate::order_actions::OrderApprovalActions;

/// 审批变更流消费者
pub struct ApprovalConsumer {
    consumer: KafkaConsumer,
    listener: ApprovalBatchListener,
    dlq: DlqProducer,
    max_batch_size: usize,
    batch_linger: Duration,
}

impl ApprovalConsumer {
    /// 创建消费者并完成全部依赖装配
    pub fn new(
        config: &AppConfig,
        service_name: &str,
        actions: Arc<dyn OrderApprovalActions>,
    ) -> Result<Self, OrderError> {
        let consumer = KafkaConsumer::new_manual_commit(&config.kafka, None)?;
        let producer = KafkaProducer::new(&config.kafka)?;
        let dlq = DlqProducer::new(producer, service_name, RetryPolicy::default());

        Ok(Self {
            consumer,
            listener: ApprovalBatchListener::new(actions),
            dlq,
            max_batch_size: config.kafka.max_batch_size,
            batch_linger: Duration::from_millis(config.kafka.batch_linger_ms),
        })
    }

    /// 启动消费循环，直到收到关闭信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), OrderError> {
        self.consumer
            .subscribe(&[topics::RESTAURANT_APPROVAL_RESPONSES])?;

        info!(
            topic = topics::RESTAURANT_APPROVAL_RESPONSES,
            "审批变更流消费者已启动"
        );

        let Self {
            consumer,
            listener,
            dlq,
            max_batch_size,
            batch_linger,
        } = self;

        let listener = &listener;
        let dlq = &dlq;

        consumer
            .start_batches(shutdown, max_batch_size, batch_linger, |batch| async move {
                let outcome = listener.handle_batch(&batch).await;

                // 未归类失败进 DLQ，结构性失败已在处理器里记过日志
                for (msg, result) in batch.iter().zip(&outcome.results) {
                    if let RecordOutcome::Failed(err) = result
                        && !err.is_structural()
                        && let Err(dlq_err) = dlq.park(msg, &err.to_string()).await
                    {
                        error!(
                            topic = %msg.topic,
                            partition = msg.partition,
                            offset = msg.offset,
                            error = %dlq_err,
                            "写入死信队列失败"
                        );
                    }
                }

                Ok(())
            })
            .await;

        info!("审批变更流消费者已退出");
        Ok(())
    }
}
