//! 交互式问题应答
//!
//! 服务器可能在任务运行中暂停并向操作员提问。问题按消息代码查表作答，
//! 表中没有的代码一律视为致命错误，从不猜测答案。

use tracing::{info, warn};
use vcm_vimclient::{Question, VmRef};

use crate::context::Context;
use crate::error::{OrchestratorError, Result};

/// 已知的问题类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestionKind {
    /// 虚拟机标识疑似被移动
    UuidMoved,
    /// 磁盘适配器类型不匹配
    AdapterMismatch,
}

impl QuestionKind {
    pub const ALL: [QuestionKind; 2] = [Self::UuidMoved, Self::AdapterMismatch];

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::UuidMoved => "msg.uuid.moved",
            Self::AdapterMismatch => "msg.disk.adapterMismatch",
        }
    }

    /// 预定的答案
    pub fn choice(&self) -> &'static str {
        match self {
            // 始终生成新的标识
            Self::UuidMoved => "2",
            Self::AdapterMismatch => "0",
        }
    }
}

/// 问题的消息代码
///
/// 服务器未给出代码时，取问题正文第一个 `:` 之前的部分。
pub fn message_code(question: &Question) -> &str {
    let code = question.message_code.trim();
    if !code.is_empty() {
        return code;
    }
    question
        .free_text
        .trim()
        .split(':')
        .next()
        .unwrap_or_default()
        .trim()
}

/// 问题应答器
pub struct QuestionResponder {
    ctx: Context,
}

impl QuestionResponder {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// 读取虚拟机当前问题并作答，返回是否存在问题
    pub async fn answer(&self, vm: &VmRef) -> Result<bool> {
        let runtime = self.ctx.server().runtime(vm).await?;
        match runtime.question {
            Some(question) => {
                self.resolve(vm, &question).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 回答给定问题，提交后等待服务器恢复任务
    pub async fn resolve(&self, vm: &VmRef, question: &Question) -> Result<()> {
        let code = message_code(question);
        let kind = QuestionKind::from_code(code).ok_or_else(|| {
            warn!("虚拟机 {} 遇到无法识别的问题: {}", vm, code);
            OrchestratorError::InteractiveQuestionUnknown {
                code: code.to_string(),
                text: question.free_text.clone(),
            }
        })?;

        info!(
            "回答虚拟机 {} 的问题 {} ({:?}) -> {}",
            vm,
            code,
            kind,
            kind.choice()
        );
        self.ctx
            .server()
            .answer_question(vm, &question.id, kind.choice())
            .await?;

        self.ctx
            .clock()
            .sleep(self.ctx.config().question_settle())
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_table() {
        assert_eq!(
            QuestionKind::from_code("msg.uuid.moved"),
            Some(QuestionKind::UuidMoved)
        );
        assert_eq!(QuestionKind::UuidMoved.choice(), "2");
        assert_eq!(QuestionKind::AdapterMismatch.choice(), "0");
        assert_eq!(
            QuestionKind::AdapterMismatch.code(),
            "msg.disk.adapterMismatch"
        );
        assert_eq!(QuestionKind::from_code("msg.hbacommon.outofspace"), None);
    }

    #[test]
    fn test_message_code_from_text() {
        let question = Question::new("q-1", "")
            .with_text("msg.uuid.moved:The virtual machine may have been moved or copied.");
        assert_eq!(message_code(&question), "msg.uuid.moved");

        let question = Question::new("q-2", " msg.disk.adapterMismatch ");
        assert_eq!(message_code(&question), "msg.disk.adapterMismatch");
    }
}
