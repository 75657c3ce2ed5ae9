use command_binding::CommandBinding;
use command_core::{Command, CommandCreator, CommandError, Signal};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Default)]
struct Account {
    balance: AtomicU64,
}

impl Account {
    async fn deposit(&self, amount: u64) -> anyhow::Result<u64> {
        // 模拟远端调用
        tokio::time::sleep(Duration::from_millis(200)).await;
        if amount == 0 {
            anyhow::bail!("amount must be > 0");
        }
        Ok(self.balance.fetch_add(amount, Ordering::SeqCst) + amount)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,command_core=debug,command_binding=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let online = Signal::new(true);
    let account = Arc::new(Account::default());

    let deposit: Command<u64, u64> = CommandCreator::new(account.clone())
        .name("deposit")
        .executability(online.clone())
        .on_error(Arc::new(|err: &CommandError| {
            info!(%err, "deposit rejected");
        }))
        .create_async(|account: Arc<Account>, (): (), amount: u64| async move {
            account.deposit(amount).await
        });

    let button = CommandBinding::owned(deposit);
    let _trace = button.state_signal().observe(|state| {
        info!(disabled = state.disabled, executing = state.executing, "button state");
    });
    button.attach();

    // 执行中再次点击会被忽略
    let first = button.trigger(100);
    let second = button.trigger(50);
    info!(accepted = first.is_some(), ignored = second.is_none(), "double click");
    if let Some(first) = first {
        info!(balance = first.await?, "deposit settled");
    }

    // 闸门关闭时点击无效
    online.set(false);
    info!(accepted = button.trigger(10).is_some(), "click while offline");
    online.set(true);

    // 失败会被上报，执行状态照常释放
    if let Some(failed) = button.trigger(0) {
        if let Err(err) = failed.await {
            info!(%err, executing = button.state().executing, "deposit failed");
        }
    }

    button.detach();
    info!(
        balance = account.balance.load(Ordering::SeqCst),
        lifecycle = ?button.command().lifecycle(),
        "done"
    );

    Ok(())
}
