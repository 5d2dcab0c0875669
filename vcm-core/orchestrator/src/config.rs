//! 编排引擎配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 编排引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// 任务轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// 回答问题后的等待时间（毫秒）
    #[serde(default = "default_question_settle_ms")]
    pub question_settle_ms: u64,

    /// 任务状态连续读取失败上限
    #[serde(default = "default_max_poll_read_failures")]
    pub max_poll_read_failures: u32,

    /// 名称生成重试策略
    #[serde(default)]
    pub name_retry: NameRetryPolicy,

    /// 高于该版本的服务器使用预分配磁盘
    #[serde(default = "default_preallocated_min_version")]
    pub preallocated_min_version: String,

    /// 快速克隆母盘备注
    #[serde(default = "default_quick_clone_master_annotation")]
    pub quick_clone_master_annotation: String,

    /// 快速克隆基线快照名称
    #[serde(default = "default_quick_clone_snapshot_name")]
    pub quick_clone_snapshot_name: String,

    /// 快速克隆基线快照描述
    #[serde(default = "default_quick_clone_snapshot_description")]
    pub quick_clone_snapshot_description: String,

    /// 克隆前要求的最小剩余空间（GB），未设置时不检查
    #[serde(default)]
    pub min_free_space_gb: Option<u64>,

    /// 注册时的目标主机
    #[serde(default)]
    pub default_host: Option<String>,

    /// 注册时的资源池
    #[serde(default)]
    pub default_resource_pool: Option<String>,
}

/// 名称生成重试策略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameRetryPolicy {
    /// 最大尝试次数，未设置时不限
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl NameRetryPolicy {
    /// 是否还允许第 `attempt` 次尝试 (从 1 开始)
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            question_settle_ms: default_question_settle_ms(),
            max_poll_read_failures: default_max_poll_read_failures(),
            name_retry: NameRetryPolicy::default(),
            preallocated_min_version: default_preallocated_min_version(),
            quick_clone_master_annotation: default_quick_clone_master_annotation(),
            quick_clone_snapshot_name: default_quick_clone_snapshot_name(),
            quick_clone_snapshot_description: default_quick_clone_snapshot_description(),
            min_free_space_gb: None,
            default_host: None,
            default_resource_pool: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn question_settle(&self) -> Duration {
        Duration::from_millis(self.question_settle_ms)
    }

    pub fn min_free_space_bytes(&self) -> Option<u64> {
        self.min_free_space_gb
            .map(|gb| gb.saturating_mul(1024 * 1024 * 1024))
    }
}

// 默认值函数
fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_question_settle_ms() -> u64 {
    2000
}

fn default_max_poll_read_failures() -> u32 {
    3
}

fn default_preallocated_min_version() -> String {
    "4.0.0".to_string()
}

fn default_quick_clone_master_annotation() -> String {
    "Type: Quick Clone Master VM\nDo not destroy, clones depend on its disks.".to_string()
}

fn default_quick_clone_snapshot_name() -> String {
    "Quick Clone Snapshot".to_string()
}

fn default_quick_clone_snapshot_description() -> String {
    "Initial snapshot of a quick cloned VM".to_string()
}
