//! 管理服务器数据模型
//!
//! 管理服务器所有文件操作都使用数据存储路径语言 (`[datastore] directory/file`)，
//! 虚拟磁盘的后端格式用带标签的枚举表达，不支持的格式必须显式匹配。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VimError};

// ============================================
// 虚拟机与电源状态
// ============================================

/// 虚拟机句柄
///
/// `id` 是服务器侧的不透明标识，`name` 是清单中的显示名称。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef {
    /// 服务器侧标识
    pub id: String,

    /// 显示名称
    pub name: String,
}

impl VmRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// 虚拟机电源状态
///
/// `PendingQuestion` 是叠加状态: 不论底层电源状态如何，虚拟机上有待回答的问题。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    /// 已开机
    PoweredOn,
    /// 已关机
    PoweredOff,
    /// 已挂起
    Suspended,
    /// 等待回答问题
    PendingQuestion,
}

impl PowerState {
    /// 服务器使用的状态字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoweredOn => "poweredOn",
            Self::PoweredOff => "poweredOff",
            Self::Suspended => "suspended",
            Self::PendingQuestion => "pendingQuestion",
        }
    }

    /// 是否处于非运行 (可安全复制磁盘) 状态
    pub fn is_quiescent(&self) -> bool {
        matches!(self, Self::PoweredOff | Self::Suspended)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务器提出的交互式问题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// 问题 ID，回答时原样回传
    pub id: String,

    /// 消息代码，例如 `msg.uuid.moved`
    pub message_code: String,

    /// 问题正文
    #[serde(default)]
    pub free_text: String,

    /// 可选答案
    #[serde(default)]
    pub choices: Vec<QuestionChoice>,
}

impl Question {
    pub fn new(id: impl Into<String>, message_code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message_code: message_code.into(),
            free_text: String::new(),
            choices: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.free_text = text.into();
        self
    }
}

/// 问题的一个可选答案
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionChoice {
    /// 答案键
    pub key: String,

    /// 显示标签
    pub label: String,
}

/// 虚拟机运行时信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRuntime {
    /// 底层电源状态 (不会是 `PendingQuestion`)
    pub power_state: PowerState,

    /// 待回答的问题
    #[serde(default)]
    pub question: Option<Question>,
}

impl VmRuntime {
    /// 叠加问题后的有效状态
    pub fn effective_state(&self) -> PowerState {
        if self.question.is_some() {
            PowerState::PendingQuestion
        } else {
            self.power_state
        }
    }
}

// ============================================
// 异步任务
// ============================================

/// 服务器侧异步任务句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(pub String);

impl TaskRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 任务状态
///
/// 单调推进: queued → running → {success, error}，终态不会回退。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// 任务信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// 当前状态
    pub state: TaskState,

    /// 错误原因 (仅 error 状态)
    #[serde(default)]
    pub error: Option<String>,
}

// ============================================
// 快照
// ============================================

/// 快照树节点 (服务器返回的嵌套形式)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// 快照句柄
    pub id: String,

    /// 快照名称
    pub name: String,

    /// 描述
    #[serde(default)]
    pub description: String,

    /// 创建时间
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,

    /// 子快照 (有序)
    #[serde(default)]
    pub children: Vec<SnapshotInfo>,
}

// ============================================
// 数据存储
// ============================================

/// 数据存储路径
///
/// 形如 `[datastore1] master/master.vmx`。`file_name` 为空时表示目录。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatastorePath {
    /// 数据存储名称
    pub datastore: String,

    /// 目录 (相对数据存储根，可包含 `/`)
    pub directory: String,

    /// 文件名
    #[serde(default)]
    pub file_name: Option<String>,
}

impl DatastorePath {
    /// 目录路径
    pub fn directory(datastore: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
            directory: directory.into().trim_matches('/').to_string(),
            file_name: None,
        }
    }

    /// 文件路径
    pub fn file(
        datastore: impl Into<String>,
        directory: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            datastore: datastore.into(),
            directory: directory.into().trim_matches('/').to_string(),
            file_name: Some(file_name.into()),
        }
    }

    /// 解析文件路径，最后一段是文件名
    pub fn parse_file(s: &str) -> Result<Self> {
        let (datastore, rest) = split_datastore(s)?;
        if rest.is_empty() || rest.ends_with('/') {
            return Err(VimError::InvalidPath(format!("缺少文件名: {}", s)));
        }
        Ok(match rest.rsplit_once('/') {
            Some((dir, file)) => Self::file(datastore, dir, file),
            None => Self::file(datastore, "", rest),
        })
    }

    /// 解析目录路径
    pub fn parse_directory(s: &str) -> Result<Self> {
        let (datastore, rest) = split_datastore(s)?;
        Ok(Self::directory(datastore, rest))
    }

    /// 是否为目录路径
    pub fn is_directory(&self) -> bool {
        self.file_name.is_none()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// 在目录下拼接文件名
    ///
    /// 对文件路径调用时，文件本身被视为子目录。
    pub fn join(&self, file_name: &str) -> Self {
        Self::file(self.datastore.clone(), self.relative_path(), file_name)
    }

    /// 上级目录
    pub fn parent(&self) -> Self {
        match &self.file_name {
            Some(_) => Self::directory(self.datastore.clone(), self.directory.clone()),
            None => match self.directory.rsplit_once('/') {
                Some((parent, _)) => Self::directory(self.datastore.clone(), parent),
                None => Self::directory(self.datastore.clone(), ""),
            },
        }
    }

    /// 相对数据存储根的路径
    pub fn relative_path(&self) -> String {
        match (&self.file_name, self.directory.is_empty()) {
            (Some(file), true) => file.clone(),
            (Some(file), false) => format!("{}/{}", self.directory, file),
            (None, _) => self.directory.clone(),
        }
    }

    /// 路径是否位于给定目录 (含子目录) 之下
    pub fn is_within(&self, dir: &DatastorePath) -> bool {
        if self.datastore != dir.datastore {
            return false;
        }
        let base = dir.relative_path();
        let own = self.relative_path();
        base.is_empty() || own == base || own.starts_with(&format!("{}/", base))
    }
}

fn split_datastore(s: &str) -> Result<(&str, &str)> {
    let s = s.trim();
    let rest = s
        .strip_prefix('[')
        .ok_or_else(|| VimError::InvalidPath(format!("缺少数据存储前缀: {}", s)))?;
    let (datastore, path) = rest
        .split_once(']')
        .ok_or_else(|| VimError::InvalidPath(format!("数据存储名称未闭合: {}", s)))?;
    if datastore.is_empty() {
        return Err(VimError::InvalidPath(format!("数据存储名称为空: {}", s)));
    }
    Ok((datastore, path.trim()))
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.relative_path())
    }
}

impl FromStr for DatastorePath {
    type Err = VimError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_file(s)
    }
}

/// 数据存储信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreInfo {
    /// 名称
    pub name: String,

    /// 剩余空间 (字节)
    pub free_bytes: u64,
}

// ============================================
// 虚拟机配置与设备
// ============================================

/// 虚拟磁盘后端格式
///
/// 线上格式为 `{"format": "...", "file_name": ...}`。`flatV1`/`flatVer1` 与
/// `flatV2`/`flatVer2` 之外的任何格式都解析为 `Other`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDiskBacking", into = "RawDiskBacking")]
pub enum DiskBacking {
    /// 平面文件格式 v1
    FlatV1 { file_name: DatastorePath },
    /// 平面文件格式 v2
    FlatV2 { file_name: DatastorePath },
    /// 其他格式 (裸设备映射、稀疏格式等)
    Other { tag: String },
}

impl DiskBacking {
    /// 平面文件格式的后端文件
    pub fn flat_file(&self) -> Option<&DatastorePath> {
        match self {
            Self::FlatV1 { file_name } | Self::FlatV2 { file_name } => Some(file_name),
            Self::Other { .. } => None,
        }
    }

    /// 格式标签
    pub fn tag(&self) -> &str {
        match self {
            Self::FlatV1 { .. } => "flatVer1",
            Self::FlatV2 { .. } => "flatVer2",
            Self::Other { tag } => tag,
        }
    }

    /// 替换平面文件格式的后端文件，其他格式原样返回 `false`
    pub fn set_flat_file(&mut self, path: DatastorePath) -> bool {
        match self {
            Self::FlatV1 { file_name } | Self::FlatV2 { file_name } => {
                *file_name = path;
                true
            }
            Self::Other { .. } => false,
        }
    }
}

/// `DiskBacking` 的线上表示
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDiskBacking {
    format: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_name: Option<DatastorePath>,

    /// 兼容 `{"format": "other", "tag": ...}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

impl TryFrom<RawDiskBacking> for DiskBacking {
    type Error = String;

    fn try_from(raw: RawDiskBacking) -> std::result::Result<Self, Self::Error> {
        let RawDiskBacking {
            format,
            file_name,
            tag,
        } = raw;
        let missing = || format!("平面文件磁盘缺少 file_name: {}", format);
        match format.as_str() {
            "flatV1" | "flatVer1" => Ok(Self::FlatV1 {
                file_name: file_name.ok_or_else(missing)?,
            }),
            "flatV2" | "flatVer2" => Ok(Self::FlatV2 {
                file_name: file_name.ok_or_else(missing)?,
            }),
            "other" => Ok(Self::Other {
                tag: tag.unwrap_or_else(|| "other".to_string()),
            }),
            _ => Ok(Self::Other {
                tag: format.clone(),
            }),
        }
    }
}

impl From<DiskBacking> for RawDiskBacking {
    fn from(backing: DiskBacking) -> Self {
        match backing {
            DiskBacking::FlatV1 { file_name } => Self {
                format: "flatV1".to_string(),
                file_name: Some(file_name),
                tag: None,
            },
            DiskBacking::FlatV2 { file_name } => Self {
                format: "flatV2".to_string(),
                file_name: Some(file_name),
                tag: None,
            },
            DiskBacking::Other { tag } => Self {
                format: tag,
                file_name: None,
                tag: None,
            },
        }
    }
}

/// 设备类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceKind {
    /// 虚拟磁盘
    Disk { backing: DiskBacking },
    /// 磁盘控制器
    Controller,
    /// 其他设备
    Other,
}

/// 虚拟设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    /// 设备键 (虚拟机内唯一)
    pub key: i32,

    /// 所属控制器键
    #[serde(default)]
    pub controller_key: Option<i32>,

    /// 设备摘要，例如 "LSI Logic"
    #[serde(default)]
    pub summary: String,

    /// 设备类型
    pub kind: DeviceKind,
}

impl VirtualDevice {
    pub fn disk_backing(&self) -> Option<&DiskBacking> {
        match &self.kind {
            DeviceKind::Disk { backing } => Some(backing),
            _ => None,
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk { .. })
    }
}

/// 扩展配置项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionValue {
    pub key: String,
    pub value: String,
}

impl OptionValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 虚拟机文件布局
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFiles {
    /// 主描述文件 (VMX)
    pub descriptor_path: DatastorePath,

    /// 挂起状态文件所在目录
    pub suspend_directory: DatastorePath,
}

/// 虚拟机配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// 文件布局
    pub files: VmFiles,

    /// 设备列表
    #[serde(default)]
    pub devices: Vec<VirtualDevice>,

    /// 扩展配置项
    #[serde(default)]
    pub extra_config: Vec<OptionValue>,

    /// 备注
    #[serde(default)]
    pub annotation: Option<String>,
}

impl VmConfig {
    /// 查询扩展配置项，空值视为不存在
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra_config
            .iter()
            .find(|entry| entry.key == key && !entry.value.is_empty())
            .map(|entry| entry.value.as_str())
    }

    /// 所有虚拟磁盘
    pub fn disks(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.devices.iter().filter(|d| d.is_disk())
    }

    /// 按设备键查找
    pub fn device(&self, key: i32) -> Option<&VirtualDevice> {
        self.devices.iter().find(|d| d.key == key)
    }

    /// 虚拟机目录
    pub fn directory(&self) -> DatastorePath {
        self.files.descriptor_path.parent()
    }
}

/// 设备变更操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceOperation {
    Add,
    Remove,
    Edit,
}

/// 设备变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    pub device: VirtualDevice,
}

/// 重新配置请求
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSpec {
    /// 新备注
    #[serde(default)]
    pub annotation: Option<String>,

    /// 设备变更 (批量)
    #[serde(default)]
    pub device_changes: Vec<DeviceChange>,

    /// 扩展配置项 (覆盖同名项)
    #[serde(default)]
    pub extra_config: Vec<OptionValue>,
}

impl ConfigSpec {
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra_config.push(OptionValue::new(key, value));
        self
    }
}

/// 虚拟磁盘复制参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// 适配器类型标签，例如 `lsiLogic`
    pub adapter_type: String,

    /// 磁盘类型提示 (`preallocated` 或空)
    #[serde(default)]
    pub disk_type: Option<String>,
}

/// 注册虚拟机请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSpec {
    /// 描述文件路径
    pub path: DatastorePath,

    /// 注册名称
    pub name: String,

    /// 是否注册为模板
    #[serde(default)]
    pub as_template: bool,

    /// 目标主机，空则由服务器选择
    #[serde(default)]
    pub host: Option<String>,

    /// 资源池，空则由服务器选择
    #[serde(default)]
    pub resource_pool: Option<String>,
}

// ============================================
// 客户机与服务器信息
// ============================================

/// 客户机网卡
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNic {
    /// MAC 地址
    pub mac_address: String,

    /// IP 地址列表
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

/// 管理服务器信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAbout {
    /// 版本号，例如 "4.1.0"
    pub version: String,

    /// 主机名
    #[serde(default)]
    pub hostname: Option<String>,

    /// 管理地址
    #[serde(default)]
    pub ip: Option<String>,
}

/// 通用 API 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// 状态码，0 表示成功
    pub status: i64,

    /// 消息
    #[serde(default)]
    pub msg: Option<String>,

    /// 数据
    pub data: Option<T>,
}
