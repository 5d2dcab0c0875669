//! CLI 命令实现

pub mod clone;
pub mod common;
pub mod snapshot;
pub mod vm;
