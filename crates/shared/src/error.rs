//! 统一错误处理模块
//!
//! 定义各服务共享的基础设施错误类型，使用 thiserror 提供良好的错误信息。
//! 业务层错误（如审批结果分类）由各服务在自己的 crate 中定义。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    /// 获取错误码，用于日志与指标中的统一标识
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 数据库与 Kafka 的故障多为瞬时（连接池满、broker 抖动），
    /// 配置错误与 NotFound 重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Kafka(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = OrderError::NotFound {
            entity: "Order".to_string(),
            id: "o-001".to_string(),
        };
        assert_eq!(err.code(), "NOT_FOUND");

        let err = OrderError::Kafka("broker 不可达".to_string());
        assert_eq!(err.code(), "KAFKA_ERROR");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = OrderError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let not_found = OrderError::NotFound {
            entity: "Order".to_string(),
            id: "o-001".to_string(),
        };
        assert!(!not_found.is_retryable());

        let config_err = OrderError::Config("缺少 kafka.brokers".to_string());
        assert!(!config_err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = OrderError::Kafka("订阅失败".to_string());
        assert_eq!(err.to_string(), "Kafka 错误: 订阅失败");
    }
}
