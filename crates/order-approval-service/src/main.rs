//! 订单审批消费服务入口
//!
//! 启动顺序：加载配置、初始化可观测性、连接数据库（带退避重试）并应用
//! 迁移、装配审批消费者与死信重投消费者各自跑在后台任务中。
//! 主任务等待 Ctrl-C 后通过 watch channel 广播关闭信号，
//! 待消费循环处理完当前批次再退出。

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use order_shared::config::AppConfig;
use order_shared::database::Database;
use order_shared::dlq::DlqConsumer;
use order_shared::kafka::KafkaProducer;
use order_shared::observability;
use order_shared::retry::{RetryPolicy, with_backoff};

use order_approval_service::consumer::ApprovalConsumer;
use order_approval_service::order_actions::{OrderApprovalActions, PgOrderApprovalActions};

const SERVICE_NAME: &str = "order-approval-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME).context("加载配置失败")?;

    let _observability_guard = observability::init(SERVICE_NAME, &config.observability)
        .await
        .context("初始化可观测性失败")?;

    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        "订单审批消费服务启动中"
    );

    // 容器编排环境里数据库可能比服务晚就绪，带退避重试连接
    let retry_policy = RetryPolicy::default();
    let db = with_backoff(
        &retry_policy,
        "database_connect",
        |e| e.is_retryable(),
        || Database::connect(&config.database),
    )
    .await
    .context("连接数据库失败")?;
    db.migrate().await.context("执行数据库迁移失败")?;
    db.health_check().await.context("数据库健康检查失败")?;

    let actions: Arc<dyn OrderApprovalActions> =
        Arc::new(PgOrderApprovalActions::new(db.clone()));
    let consumer = ApprovalConsumer::new(&config, SERVICE_NAME, actions)?;

    let redelivery =
        DlqConsumer::new(&config, KafkaProducer::new(&config.kafka)?).context("创建死信重投消费者失败")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let redelivery_task = tokio::spawn(redelivery.run(shutdown_tx.subscribe()));
    let consumer_task = tokio::spawn(consumer.run(shutdown_rx));

    info!("订单审批消费服务已就绪");

    tokio::signal::ctrl_c().await.context("监听关闭信号失败")?;
    info!("收到关闭信号，开始优雅关闭");

    shutdown_tx.send(true).context("广播关闭信号失败")?;
    consumer_task.await.context("等待消费任务退出失败")??;
    redelivery_task.await.context("等待死信重投任务退出失败")?;

    db.close().await;
    info!("订单审批消费服务已退出");

    Ok(())
}
