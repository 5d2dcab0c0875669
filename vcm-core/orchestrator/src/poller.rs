//! 任务轮询器
//!
//! 把服务器侧异步任务驱动到终态。任务运行期间按固定间隔检查所属虚拟机，
//! 发现待回答问题时先应答再继续轮询。任务一经提交不可取消，唯一的超时
//! 行为是任务状态连续读取失败超过上限。

use tracing::{debug, warn};
use vcm_vimclient::{TaskRef, TaskState, VmRef};

use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::question::QuestionResponder;

/// 任务终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure(String),
}

/// 任务轮询器
pub struct TaskPoller {
    ctx: Context,
    responder: QuestionResponder,
}

impl TaskPoller {
    pub fn new(ctx: Context) -> Self {
        Self {
            responder: QuestionResponder::new(ctx.clone()),
            ctx,
        }
    }

    /// 等待任务结束
    ///
    /// `vm` 为任务所属虚拟机，给出时轮询期间会检查并回答其问题。
    pub async fn wait(&self, task: &TaskRef, vm: Option<&VmRef>) -> Result<TaskOutcome> {
        let server = self.ctx.server();
        let max_failures = self.ctx.config().max_poll_read_failures.max(1);
        let mut failures = 0u32;

        loop {
            let info = match server.task_info(task).await {
                Ok(info) => {
                    failures = 0;
                    info
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "读取任务 {} 状态失败 ({}/{}): {}",
                        task, failures, max_failures, e
                    );
                    if failures >= max_failures {
                        return Err(OrchestratorError::TransientPollError {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            match info.state {
                TaskState::Success => return Ok(TaskOutcome::Success),
                TaskState::Error => {
                    let reason = info.error.unwrap_or_else(|| "未知错误".to_string());
                    return Ok(TaskOutcome::Failure(reason));
                }
                TaskState::Queued | TaskState::Running => {
                    debug!("任务 {} 状态: {:?}", task, info.state);
                    self.ctx.clock().sleep(self.ctx.config().poll_interval()).await;
                    if let Some(vm) = vm {
                        self.check_question(vm).await?;
                    }
                }
            }
        }
    }

    /// 等待任务成功，失败时返回 `TaskFailure`
    pub async fn wait_success(
        &self,
        task: &TaskRef,
        vm: Option<&VmRef>,
        operation: &str,
    ) -> Result<()> {
        match self.wait(task, vm).await? {
            TaskOutcome::Success => Ok(()),
            TaskOutcome::Failure(reason) => Err(OrchestratorError::TaskFailure {
                operation: operation.to_string(),
                reason,
            }),
        }
    }

    async fn check_question(&self, vm: &VmRef) -> Result<()> {
        let runtime = match self.ctx.server().runtime(vm).await {
            Ok(runtime) => runtime,
            Err(e) => {
                // 运行时读取失败不影响任务本身，下一轮再查
                warn!("读取虚拟机 {} 运行时状态失败: {}", vm, e);
                return Ok(());
            }
        };
        if let Some(question) = runtime.question {
            self.responder.resolve(vm, &question).await?;
        }
        Ok(())
    }
}
