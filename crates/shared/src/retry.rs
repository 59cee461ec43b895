//! 启动期的指数退避重试
//!
//! 容器编排环境里数据库与 broker 往往比服务晚几秒就绪，启动阶段的
//! 连接操作在此按指数退避重试。记录级失败不走这里，那是死信队列的
//! 职责；`RetryPolicy` 同时给死信重投提供退避参数。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::OrderError;

/// 指数退避参数
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次执行之外最多再试几次
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待时间（attempt 从 0 计，封顶 max_delay）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// 按策略重试异步操作
///
/// 只对 `is_retryable` 判定为瞬时的错误退避重试；
/// 其余错误以及耗尽次数后的最后一个错误直接返回。
pub async fn with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&OrderError) -> bool,
    mut operation: F,
) -> Result<T, OrderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrderError>>,
{
    let mut failures: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    info!(operation = operation_name, failures, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) || failures >= policy.max_retries {
            warn!(operation = operation_name, failures, error = %err, "放弃重试");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(failures);
        warn!(
            operation = operation_name,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "操作失败，退避后重试"
        );
        tokio::time::sleep(delay).await;
        failures += 1;
    }
}
