//! VCM CLI 应用

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "vcm")]
#[command(about = "VCM - 虚拟机克隆与快照编排工具", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件路径 (默认 ~/.config/vcm/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别 (RUST_LOG 优先)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 虚拟机管理
    Vm {
        #[command(subcommand)]
        action: VmAction,
    },

    /// 克隆虚拟机
    Clone {
        #[command(subcommand)]
        action: CloneAction,
    },

    /// 快照管理
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
pub enum VmAction {
    /// 列出已注册的虚拟机
    List,

    /// 查询电源状态
    State {
        /// 虚拟机名称
        name: String,
    },

    /// 开机
    Start {
        /// 虚拟机名称
        name: String,
    },

    /// 关机
    Stop {
        /// 虚拟机名称
        name: String,
    },

    /// 挂起
    Suspend {
        /// 虚拟机名称
        name: String,
    },

    /// 冷重置
    Reset {
        /// 虚拟机名称
        name: String,
    },

    /// 销毁虚拟机 (快速克隆只删除自身文件)
    Destroy {
        /// 虚拟机名称
        name: String,
    },

    /// 显示虚拟机详情
    Info {
        /// 虚拟机名称
        name: String,
    },
}

#[derive(Subcommand)]
pub enum CloneAction {
    /// 完整克隆 (复制所有磁盘)
    Full {
        /// 源虚拟机名称
        source: String,

        /// 目标名称 (不指定则自动生成)
        #[arg(short, long)]
        name: Option<String>,

        /// 目标目录 (默认与名称相同)
        #[arg(short, long)]
        dir: Option<String>,

        /// 磁盘适配器类型 (默认沿用源磁盘)
        #[arg(short, long)]
        adapter: Option<String>,

        /// 克隆完成后不开机
        #[arg(long)]
        no_power_on: bool,

        /// 标记为模板 (不开机)
        #[arg(long)]
        template: bool,
    },

    /// 快速克隆 (共享源虚拟机磁盘)
    Quick {
        /// 源虚拟机名称
        source: String,

        /// 目标名称 (不指定则自动生成)
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum SnapshotAction {
    /// 创建快照
    Create {
        /// 虚拟机名称
        vm: String,

        /// 快照名称 (不指定则自动生成)
        #[arg(short, long)]
        name: Option<String>,

        /// 快照描述
        #[arg(short, long)]
        desc: Option<String>,

        /// 跳过名称唯一性检查
        #[arg(long)]
        ignore_collisions: bool,
    },

    /// 列出快照树
    List {
        /// 虚拟机名称
        vm: String,
    },

    /// 恢复到快照
    Revert {
        /// 虚拟机名称
        vm: String,

        /// 快照名称
        snapshot: String,
    },

    /// 重命名快照
    Rename {
        /// 虚拟机名称
        vm: String,

        /// 原快照名称
        old: String,

        /// 新名称 (不指定则自动生成)
        #[arg(short, long)]
        new: Option<String>,

        /// 新描述
        #[arg(short, long)]
        desc: Option<String>,
    },

    /// 删除快照
    Remove {
        /// 虚拟机名称
        vm: String,

        /// 快照名称
        snapshot: String,

        /// 保留子快照
        #[arg(long)]
        keep_children: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("VCM CLI 启动");

    let config = CliConfig::load(cli.config.as_deref())?;

    // 处理命令
    match cli.command {
        Commands::Vm { action } => commands::vm::handle(action, &config).await?,
        Commands::Clone { action } => commands::clone::handle(action, &config).await?,
        Commands::Snapshot { action } => commands::snapshot::handle(action, &config).await?,
    }

    Ok(())
}
