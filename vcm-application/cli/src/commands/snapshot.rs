//! 快照管理命令

use anyhow::Result;
use colored::Colorize;
use vcm_orchestrator::{Context, SnapshotForest, SnapshotOps};

use super::common;
use crate::config::CliConfig;
use crate::SnapshotAction;

pub async fn handle(action: SnapshotAction, config: &CliConfig) -> Result<()> {
    let session = common::connect(config).await?;
    let result = run(action, &session.context()).await;
    session.close().await;
    result
}

async fn run(action: SnapshotAction, ctx: &Context) -> Result<()> {
    let ops = SnapshotOps::new(ctx.clone());

    match action {
        SnapshotAction::Create {
            vm,
            name,
            desc,
            ignore_collisions,
        } => {
            let name = ops
                .create(&vm, name.as_deref(), desc.as_deref(), ignore_collisions)
                .await?;
            println!(
                "{} 虚拟机 {} 已创建快照 {}",
                "✓".green().bold(),
                vm.cyan().bold(),
                name.yellow()
            );
        }
        SnapshotAction::List { vm } => {
            let forest = ops.forest(&vm).await?;
            print_forest(&vm, &forest);
        }
        SnapshotAction::Revert { vm, snapshot } => {
            ops.revert(&vm, &snapshot).await?;
            println!(
                "{} 虚拟机 {} 已恢复到快照 {}",
                "✓".green().bold(),
                vm.cyan().bold(),
                snapshot.yellow()
            );
        }
        SnapshotAction::Rename { vm, old, new, desc } => {
            let name = ops
                .rename(&vm, &old, new.as_deref(), desc.as_deref())
                .await?;
            println!(
                "{} 快照 {} 已重命名为 {}",
                "✓".green().bold(),
                old.yellow(),
                name.cyan().bold()
            );
        }
        SnapshotAction::Remove {
            vm,
            snapshot,
            keep_children,
        } => {
            ops.remove(&vm, &snapshot, !keep_children).await?;
            let scope = if keep_children { "" } else { " (含子快照)" };
            println!(
                "{} 已删除快照 {}{}",
                "✓".green().bold(),
                snapshot.yellow(),
                scope
            );
        }
    }

    Ok(())
}

fn print_forest(vm: &str, forest: &SnapshotForest) {
    if forest.is_empty() {
        println!("{}", format!("虚拟机 {} 没有快照", vm).yellow());
        return;
    }

    println!("{} 的快照:", vm.cyan().bold());
    for id in forest.preorder() {
        let node = forest.node(id);
        let indent = "  ".repeat(node.depth + 1);
        let created = node
            .create_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{}{} {} {}",
            indent,
            node.name.bold(),
            node.description.bright_black(),
            created.bright_black()
        );
    }
    println!("\n共 {} 个快照", forest.len());
}
