//! 管理服务器 API 模块
//!
//! - 虚拟机管理 (VmApi)
//! - 快照管理 (SnapshotApi)
//! - 数据存储文件 (DatastoreApi)
//! - 异步任务 (TaskApi)

pub mod datastore;
pub mod snapshot;
pub mod task;
pub mod vm;

pub use datastore::DatastoreApi;
pub use snapshot::SnapshotApi;
pub use task::TaskApi;
pub use vm::VmApi;
