//! 命令层统一错误定义
//!
//! 只覆盖执行落定时可能出现的失败。并发抑制与销毁后执行不属于错误，
//! 由 `Command::execute` 返回 `None` 表达。
//!
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CommandError {
    /// 动作返回了错误
    #[error("action failed: {error}")]
    ActionFailed { error: anyhow::Error },

    /// 动作 panic；执行标记仍会被释放
    #[error("action panicked: {reason}")]
    ActionPanicked { reason: String },

    /// 驱动动作的任务在落定前被运行时丢弃（如运行时关闭）
    #[error("execution cancelled before settlement")]
    Cancelled,

    #[error("no tokio runtime available to drive an async action")]
    NoRuntime,
}

impl CommandError {
    pub fn action_failed(error: impl Into<anyhow::Error>) -> Self {
        Self::ActionFailed {
            error: error.into(),
        }
    }

    /// 是否由动作本身导致（失败或 panic）
    pub fn is_action_error(&self) -> bool {
        matches!(self, Self::ActionFailed { .. } | Self::ActionPanicked { .. })
    }
}

/// 统一 Result 类型别名
pub type CommandResult<T> = Result<T, CommandError>;
