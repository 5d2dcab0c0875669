//! VCM 管理服务器客户端
//!
//! 虚拟化管理服务器的接口抽象与实现。编排引擎只依赖 [`ManagementServer`]
//! trait，具体实现有两种：
//!
//! - **HTTP 客户端** (`VimClient`): 通过 `/api/v1` JSON 接口访问真实的管理服务器
//! - **内存服务器** (`InMemoryServer`): 完整模拟清单、数据存储文件和异步任务，
//!   支持故障注入与调用记录，用于测试 (需开启 `testing` feature)
//!
//! # 示例
//!
//! ```ignore
//! use vcm_vimclient::{ManagementServer, ServerConfig, VimClient};
//!
//! let client = VimClient::new("https://vcenter.local/sdk", ServerConfig::default())?;
//! client.login("administrator", "password").await?;
//!
//! let vm = client.find_vm_by_name("master").await?;
//! let task = client.power_on(&vm.unwrap()).await?;
//! ```

pub mod api;
pub mod client;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod models;
pub mod server;

pub use client::{ServerConfig, VimClient};
pub use error::{Result, VimError};
#[cfg(any(test, feature = "testing"))]
pub use memory::{Call, InMemoryServer, InMemoryServerBuilder, StoredFile, VmFixture};
pub use server::ManagementServer;

// 导出 API 模块
pub use api::{DatastoreApi, SnapshotApi, TaskApi, VmApi};

// 导出数据模型
pub use models::{
    // 虚拟机与电源
    PowerState, Question, QuestionChoice, VmRef, VmRuntime,

    // 任务
    TaskInfo, TaskRef, TaskState,

    // 快照
    SnapshotInfo,

    // 数据存储
    DatastoreInfo, DatastorePath,

    // 配置与设备
    ConfigSpec, DeviceChange, DeviceKind, DeviceOperation, DiskBacking, DiskSpec, OptionValue,
    RegisterSpec, VirtualDevice, VmConfig, VmFiles,

    // 客户机与服务器
    ApiResponse, GuestNic, ServerAbout,
};
