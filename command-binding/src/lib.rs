//! 命令绑定层（command-binding）
//!
//! 面向展示层的命令消费者：不涉及任何具体的界面技术，只把命令的公开契约
//! （subscribe/unsubscribe、execute、`can_execute`/`is_executing` 信号）
//! 转换为可直接驱动界面的 `BindingState`，并在不可执行时拦截交互。
//!
pub mod binding;

pub use binding::{BindingOwnership, BindingState, CommandBinding};
