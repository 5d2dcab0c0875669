//! VCM 编排引擎
//!
//! 针对远程虚拟化管理服务器的虚拟机克隆与快照编排。
//!
//! # 组件
//!
//! - **任务轮询** (`TaskPoller`): 等待异步任务进入终态，运行中自动回答交互式问题
//! - **名称分配** (`NameAllocator`): 虚拟机与快照共享命名空间，生成 32 位十六进制名称
//! - **快照树** (`SnapshotForest`): 基于索引的快照森林，迭代遍历
//! - **前置条件** (`StatePrecondition`): 复制前确保源虚拟机处于关机或挂起状态
//! - **文件复制** (`FileCopyPipeline`): 完整复制与快速复制
//! - **克隆编排** (`CloneOrchestrator`): 完整克隆与快速 (差分) 克隆流水线
//! - **生命周期** (`PowerOps`、`SnapshotOps`、`InventoryOps`): 电源、快照、清单与销毁
//!
//! 所有组件都从显式构造的 [`Context`] 获取管理服务器、配置和时钟。
//!
//! # 示例
//!
//! ```ignore
//! use std::sync::Arc;
//! use vcm_orchestrator::{CloneOrchestrator, CloneSpec, Context, OrchestratorConfig};
//!
//! let ctx = Context::new(Arc::new(client), OrchestratorConfig::default());
//! let outcome = CloneOrchestrator::new(ctx)
//!     .full_clone(&CloneSpec::new("master"))
//!     .await?;
//! println!("克隆完成: {}", outcome.name);
//! ```

pub mod clock;
pub mod clone;
pub mod config;
pub mod context;
pub mod error;
pub mod file_copy;
pub mod inventory;
pub mod lease;
pub mod naming;
pub mod poller;
pub mod power;
pub mod precondition;
pub mod question;
pub mod snapshot_ops;
pub mod snapshot_tree;

pub use clock::{Clock, TokioClock};
pub use clone::{CloneOrchestrator, CloneOutcome, CloneSpec, CloneState};
pub use config::{NameRetryPolicy, OrchestratorConfig};
pub use context::Context;
pub use error::{CloneStep, OrchestratorError, Result};
pub use file_copy::{CopyRequest, FileCopyPipeline};
pub use inventory::InventoryOps;
pub use lease::{NameLease, NameLeases, SourceLocks};
pub use naming::{generate_name, NameAllocator};
pub use poller::{TaskOutcome, TaskPoller};
pub use power::PowerOps;
pub use precondition::StatePrecondition;
pub use question::{QuestionKind, QuestionResponder};
pub use snapshot_ops::SnapshotOps;
pub use snapshot_tree::{NodeId, SnapshotForest, SnapshotNode};
