//! PostgreSQL 连接池管理
//!
//! 按配置构建 PgPool，提供启动时的迁移执行、健康检查与优雅关闭。
//! 订单审批消费者只通过这里拿连接池，不直接持有 sqlx 的配置细节。

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// 数据库连接池包装
///
/// Clone 开销只是 Arc 引用计数，可放心在任务间传递。
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 按配置建立连接池
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!("数据库连接池已建立");
        Ok(Self { pool })
    }

    /// 执行内嵌的 schema 迁移
    ///
    /// 迁移脚本编译期打包进二进制，部署时无需额外拷贝 sql 文件。
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;

        info!("数据库迁移已应用");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 连通性探测，供启动自检与就绪检查使用
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// 等待在途查询结束后关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

impl std::ops::Deref for Database {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}
