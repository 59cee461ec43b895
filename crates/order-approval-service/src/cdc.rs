//! Debezium 变更信封模型
//!
//! 餐厅服务的 order_outbox 表由 Debezium 捕获变更后发布到 Kafka。
//! 每条记录是一个变更信封：操作类型、变更前后的行快照以及捕获时间戳。
//! 本服务只关心"新插入的审批决定"，即 op 为 create 且无前镜像的记录。
//! 信封可能携带本模型未声明的字段（connector 版本升级会新增），
//! 反序列化时一律忽略未知字段。

use serde::Deserialize;

/// 变更操作类型
///
/// 对应 Debezium 信封的 op 字段单字符编码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChangeOp {
    /// 新插入的行
    #[serde(rename = "c")]
    Create,
    /// 已有行被更新
    #[serde(rename = "u")]
    Update,
    /// 行被删除
    #[serde(rename = "d")]
    Delete,
    /// 快照阶段读取的存量行
    #[serde(rename = "r")]
    Read,
}

/// outbox 行快照
///
/// payload 列存的是审批决定的 JSON 文本，在此保持为字符串，
/// 由 payload 模块负责二次解析。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OutboxRow {
    /// outbox 记录主键
    pub id: String,
    /// 所属 saga 标识，用于跨服务关联一次审批流程
    #[serde(default)]
    pub saga_id: Option<String>,
    /// 消息类型标签
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    /// 审批决定负载（嵌套 JSON 文本）
    pub payload: String,
    /// outbox 发件状态
    #[serde(default)]
    pub outbox_status: Option<String>,
    /// 行版本号
    #[serde(default)]
    pub version: Option<i32>,
    /// 行创建时间（epoch 毫秒，由 connector 转换）
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Debezium 变更信封
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEnvelope {
    /// 操作类型
    pub op: ChangeOp,
    /// 变更前的行快照，插入时为 null
    #[serde(default)]
    pub before: Option<OutboxRow>,
    /// 变更后的行快照，删除时为 null
    #[serde(default)]
    pub after: Option<OutboxRow>,
    /// connector 捕获变更的时间戳（epoch 毫秒）
    #[serde(default)]
    pub ts_ms: Option<i64>,
}

impl ChangeEnvelope {
    /// 是否为一条新的审批决定
    ///
    /// 只有插入且无前镜像的变更才代表餐厅服务写入了新决定。
    /// 更新（如 outbox_status 翻转为已完成）、删除（outbox 清理任务）、
    /// 快照重放的存量行都不触发订单动作。
    pub fn is_new_decision(&self) -> bool {
        self.op == ChangeOp::Create && self.before.is_none()
    }

    /// 取后镜像
    pub fn post_image(&self) -> Option<&OutboxRow> {
        self.after.as_ref()
    }
}
