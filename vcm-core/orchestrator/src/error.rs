//! 编排引擎错误定义

use std::fmt;

use thiserror::Error;
use vcm_vimclient::VimError;

/// 克隆流水线步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloneStep {
    /// 解析/生成目标名称
    ResolveName,
    /// 源虚拟机状态前置检查
    Precondition,
    /// 源虚拟机快照检查 (快速克隆)
    SnapshotGuard,
    /// 数据存储剩余空间检查
    SpaceCheck,
    /// 读取源虚拟机配置
    InspectSource,
    /// 创建目标目录
    MakeDirectory,
    /// 复制虚拟磁盘
    CopyDisk,
    /// 复制描述文件
    CopyDescriptor,
    /// 标记母盘虚拟机
    AnnotateMaster,
    /// 注册目标虚拟机
    Register,
    /// 重新配置目标虚拟机
    Reconfigure,
    /// 创建基线快照
    Snapshot,
    /// 开机
    PowerOn,
    /// 冷重置
    Reset,
}

impl CloneStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolveName => "解析目标名称",
            Self::Precondition => "状态前置检查",
            Self::SnapshotGuard => "快照检查",
            Self::SpaceCheck => "剩余空间检查",
            Self::InspectSource => "读取源配置",
            Self::MakeDirectory => "创建目标目录",
            Self::CopyDisk => "复制虚拟磁盘",
            Self::CopyDescriptor => "复制描述文件",
            Self::AnnotateMaster => "标记母盘",
            Self::Register => "注册虚拟机",
            Self::Reconfigure => "重新配置",
            Self::Snapshot => "创建基线快照",
            Self::PowerOn => "开机",
            Self::Reset => "冷重置",
        }
    }
}

impl fmt::Display for CloneStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 编排引擎错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("名称冲突: {0}")]
    NameCollision(String),

    #[error("前置条件不满足: {0}")]
    Precondition(String),

    #[error("任务失败 [{operation}]: {reason}")]
    TaskFailure { operation: String, reason: String },

    #[error("任务状态连续 {attempts} 次读取失败: {last_error}")]
    TransientPollError { attempts: u32, last_error: String },

    #[error("不支持的磁盘格式: {0}")]
    UnsupportedDiskFormat(String),

    #[error("无法识别的交互式问题 {code}: {text}")]
    InteractiveQuestionUnknown { code: String, text: String },

    #[error("管理服务器错误: {0}")]
    Server(VimError),

    #[error("克隆步骤 [{step}] 失败 ({source_vm} -> {destination_vm}): {cause}")]
    Clone {
        step: CloneStep,
        source_vm: String,
        destination_vm: String,
        #[source]
        cause: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    /// 附加克隆步骤信息，已带步骤的错误保持不变
    pub fn at_step(self, step: CloneStep, source_vm: &str, destination_vm: &str) -> Self {
        match self {
            Self::Clone { .. } => self,
            cause => Self::Clone {
                step,
                source_vm: source_vm.to_string(),
                destination_vm: destination_vm.to_string(),
                cause: Box::new(cause),
            },
        }
    }

    /// 失败的克隆步骤
    pub fn step(&self) -> Option<CloneStep> {
        match self {
            Self::Clone { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// 去掉步骤包装后的根因
    pub fn root_cause(&self) -> &OrchestratorError {
        let mut current = self;
        while let Self::Clone { cause, .. } = current {
            current = cause.as_ref();
        }
        current
    }
}

impl From<VimError> for OrchestratorError {
    fn from(err: VimError) -> Self {
        match err {
            VimError::NotFound(what) => Self::NotFound(what),
            other => Self::Server(other),
        }
    }
}

/// 编排引擎结果类型
pub type Result<T> = std::result::Result<T, OrchestratorError>;
