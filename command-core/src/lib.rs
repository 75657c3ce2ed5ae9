//! 命令基础库（command-core）
//!
//! 提供“命令”这一进程内响应式原语：封装一个动作、一个可执行闸门与一个执行状态机，
//! 可被重复与并发调用，并通过两个推送信号对外暴露状态：
//! - 信号（`signal`）：重放最新值的推送源，支持回调订阅与异步流订阅；
//! - 闸门（`gate`）：固定值、实时信号或布尔流形式的可执行条件；
//! - 动作（`action`）：同步或异步的实际操作；
//! - 命令（`command`）：生命周期、执行状态机与 `can_execute` 推导；
//! - 工厂（`creator`）：由宿主对象与绑定函数动态生成命令。
//!
//! 典型用法：
//! 1. 使用 `Command::builder()` 或 `CommandCreator` 构建命令；
//! 2. 调用 `subscribe()` 激活；
//! 3. 订阅 `can_execute_signal()` / `is_executing_signal()` 驱动展示状态；
//! 4. 调用 `execute(args)` 触发动作；
//! 5. 销毁时调用 `unsubscribe()`。
//!
pub mod action;
pub mod command;
pub mod creator;
pub mod error;
pub mod gate;
pub mod signal;

pub use action::Action;
pub use command::{Command, ErrorHandler, Execution, Lifecycle};
pub use creator::CommandCreator;
pub use error::{CommandError, CommandResult};
pub use gate::Executability;
pub use signal::{Signal, Subscription};
