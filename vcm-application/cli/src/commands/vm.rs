//! 虚拟机管理命令

use anyhow::Result;
use colored::Colorize;
use vcm_orchestrator::{Context, InventoryOps, PowerOps};
use vcm_vimclient::PowerState;

use super::common;
use crate::config::CliConfig;
use crate::VmAction;

pub async fn handle(action: VmAction, config: &CliConfig) -> Result<()> {
    let session = common::connect(config).await?;
    let result = run(action, &session.context()).await;
    session.close().await;
    result
}

async fn run(action: VmAction, ctx: &Context) -> Result<()> {
    match action {
        VmAction::List => list_vms(ctx).await,
        VmAction::State { name } => show_state(ctx, &name).await,
        VmAction::Start { name } => {
            PowerOps::new(ctx.clone()).start(&name).await?;
            report_done("已开机", &name);
            Ok(())
        }
        VmAction::Stop { name } => {
            PowerOps::new(ctx.clone()).stop(&name).await?;
            report_done("已关机", &name);
            Ok(())
        }
        VmAction::Suspend { name } => {
            PowerOps::new(ctx.clone()).suspend(&name).await?;
            report_done("已挂起", &name);
            Ok(())
        }
        VmAction::Reset { name } => {
            PowerOps::new(ctx.clone()).reset(&name).await?;
            report_done("已重置", &name);
            Ok(())
        }
        VmAction::Destroy { name } => {
            InventoryOps::new(ctx.clone()).destroy(&name).await?;
            report_done("已销毁", &name);
            Ok(())
        }
        VmAction::Info { name } => show_info(ctx, &name).await,
    }
}

fn report_done(what: &str, name: &str) {
    println!("{} 虚拟机 {} {}", "✓".green().bold(), name.cyan().bold(), what);
}

fn colored_state(state: PowerState) -> colored::ColoredString {
    match state {
        PowerState::PoweredOn => state.as_str().green(),
        PowerState::PoweredOff => state.as_str().bright_black(),
        PowerState::Suspended => state.as_str().yellow(),
        PowerState::PendingQuestion => state.as_str().red(),
    }
}

async fn list_vms(ctx: &Context) -> Result<()> {
    let names = InventoryOps::new(ctx.clone()).list_registered().await?;

    if names.is_empty() {
        println!("{}", "没有已注册的虚拟机".yellow());
        return Ok(());
    }

    println!("{}", "已注册的虚拟机:".bold());
    for name in &names {
        println!("  {} {}", "•".cyan(), name);
    }
    println!("\n共 {} 台", names.len());

    Ok(())
}

async fn show_state(ctx: &Context, name: &str) -> Result<()> {
    let state = PowerOps::new(ctx.clone()).state(name).await?;
    println!("{}: {}", name.cyan().bold(), colored_state(state));
    Ok(())
}

async fn show_info(ctx: &Context, name: &str) -> Result<()> {
    let inventory = InventoryOps::new(ctx.clone());
    let state = PowerOps::new(ctx.clone()).state(name).await?;
    let descriptor = inventory.descriptor_path(name).await?;
    let quick_clone = inventory.is_quick_clone(name).await?;
    let mac = inventory.mac_address(name).await?;
    let ip = inventory.ip_address(name).await?;
    let space = inventory.datastore_space(name).await?;

    println!("{}", name.cyan().bold());
    println!("  状态:     {}", colored_state(state));
    println!("  描述文件: {}", descriptor.to_string().yellow());
    println!(
        "  类型:     {}",
        if quick_clone { "快速克隆" } else { "完整虚拟机" }
    );
    println!("  MAC:      {}", mac.as_deref().unwrap_or("-"));
    println!("  IP:       {}", ip.as_deref().unwrap_or("-"));

    if !space.is_empty() {
        println!("  数据存储:");
        for (datastore, free) in &space {
            println!("    {} 剩余 {}", datastore, common::format_bytes(*free).green());
        }
    }

    Ok(())
}
