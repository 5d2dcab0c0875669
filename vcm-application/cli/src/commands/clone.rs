//! 克隆命令

use anyhow::Result;
use colored::Colorize;
use vcm_orchestrator::{CloneOrchestrator, CloneOutcome, CloneSpec, Context, OrchestratorError};

use super::common;
use crate::config::CliConfig;
use crate::CloneAction;

pub async fn handle(action: CloneAction, config: &CliConfig) -> Result<()> {
    let session = common::connect(config).await?;
    let result = run(action, &session.context()).await;
    session.close().await;
    result.map(|_| ())
}

async fn run(action: CloneAction, ctx: &Context) -> Result<CloneOutcome> {
    let orchestrator = CloneOrchestrator::new(ctx.clone());

    let (kind, result) = match action {
        CloneAction::Full {
            source,
            name,
            dir,
            adapter,
            no_power_on,
            template,
        } => {
            let mut spec = CloneSpec::new(source)
                .with_power_on(!no_power_on)
                .as_template(template);
            if let Some(name) = name {
                spec = spec.with_name(name);
            }
            if let Some(dir) = dir {
                spec = spec.with_directory(dir);
            }
            if let Some(adapter) = adapter {
                spec = spec.with_adapter_type(adapter);
            }
            ("完整克隆", orchestrator.full_clone(&spec).await)
        }
        CloneAction::Quick { source, name } => {
            let mut spec = CloneSpec::new(source);
            if let Some(name) = name {
                spec = spec.with_name(name);
            }
            ("快速克隆", orchestrator.quick_clone(&spec).await)
        }
    };

    match result {
        Ok(outcome) => {
            print_outcome(kind, &outcome);
            Ok(outcome)
        }
        Err(e) => {
            print_failure(kind, &e);
            Err(e.into())
        }
    }
}

fn print_outcome(kind: &str, outcome: &CloneOutcome) {
    println!(
        "{} {}完成: {}",
        "✓".green().bold(),
        kind,
        outcome.name.cyan().bold()
    );
    println!(
        "  描述文件: {}",
        outcome.descriptor_path.to_string().yellow()
    );
    println!("  源状态:   {}", outcome.source_state);
    println!(
        "  已开机:   {}",
        if outcome.powered_on { "是".green() } else { "否".bright_black() }
    );
    if outcome.reset_issued {
        println!("  {}", "已对克隆执行冷重置".yellow());
    }
}

fn print_failure(kind: &str, err: &OrchestratorError) {
    match err {
        OrchestratorError::Clone {
            step,
            destination_vm,
            ..
        } => {
            eprintln!(
                "{} {}失败 (步骤: {}, 目标: {})",
                "❌".red(),
                kind,
                step.to_string().yellow(),
                destination_vm.cyan()
            );
            eprintln!("  原因: {}", err.root_cause());
        }
        other => eprintln!("{} {}失败: {}", "❌".red(), kind, other),
    }
}
