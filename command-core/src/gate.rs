//! 可执行闸门（Executability）
//!
//! 外部提供的“当前是否允许执行”条件，`Command` 只观察、从不修改它：
//! - `Always`：未提供时的默认值，始终可执行；
//! - `Fixed`：固定布尔值；
//! - `Signal`：实时信号，查询时同步读取当前值；
//! - `Stream`：任意布尔流，命令订阅期间由后台任务泵入内部信号，取消订阅时停止。
//!
use crate::signal::{Signal, Subscription};
use futures_core::Stream;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 可执行闸门
#[derive(Default)]
pub enum Executability {
    #[default]
    Always,
    Fixed(bool),
    Signal(Signal<bool>),
    Stream(GateStream),
}

/// 带初始值的布尔流闸门，流只会被消费一次
pub struct GateStream {
    initial: bool,
    stream: Mutex<Option<BoxStream<'static, bool>>>,
}

impl GateStream {
    fn take(&self) -> Option<BoxStream<'static, bool>> {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Executability {
    /// 由布尔流构造闸门；`initial` 为流产出第一个值之前使用的值
    pub fn from_stream<S>(initial: bool, stream: S) -> Self
    where
        S: Stream<Item = bool> + Send + 'static,
    {
        Self::Stream(GateStream {
            initial,
            stream: Mutex::new(Some(Box::pin(stream))),
        })
    }

    /// 订阅前使用的闸门值
    pub fn initial(&self) -> bool {
        match self {
            Self::Always => true,
            Self::Fixed(open) => *open,
            Self::Signal(signal) => signal.get(),
            Self::Stream(gate) => gate.initial,
        }
    }

    /// 将闸门接入 `on_change`：立即回调当前值，之后每次变化回调一次
    ///
    /// 返回的订阅需要由调用方持有；`token` 取消时流闸门的泵任务退出。
    pub(crate) fn connect<F>(&self, token: &CancellationToken, on_change: F) -> Option<Subscription>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        match self {
            Self::Always => {
                on_change(true);
                None
            }
            Self::Fixed(open) => {
                on_change(*open);
                None
            }
            Self::Signal(signal) => Some(signal.observe(move |open| on_change(*open))),
            Self::Stream(gate) => {
                let signal = Signal::new(gate.initial);
                let subscription = signal.observe(move |open| on_change(*open));

                match (gate.take(), Handle::try_current()) {
                    (Some(stream), Ok(runtime)) => {
                        runtime.spawn(pump(stream, signal, token.clone()));
                    }
                    (None, _) => debug!("gate stream already consumed"),
                    (Some(_), Err(_)) => {
                        warn!("no tokio runtime, gate stream stays at its initial value");
                    }
                }

                Some(subscription)
            }
        }
    }
}

async fn pump(mut stream: BoxStream<'static, bool>, signal: Signal<bool>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => match next {
                Some(open) => {
                    signal.set(open);
                }
                None => break,
            },
        }
    }
}

impl From<bool> for Executability {
    fn from(open: bool) -> Self {
        Self::Fixed(open)
    }
}

impl From<Signal<bool>> for Executability {
    fn from(signal: Signal<bool>) -> Self {
        Self::Signal(signal)
    }
}

impl From<watch::Receiver<bool>> for Executability {
    fn from(rx: watch::Receiver<bool>) -> Self {
        let initial = *rx.borrow();
        Self::from_stream(initial, WatchStream::from_changes(rx))
    }
}

impl fmt::Debug for Executability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Fixed(open) => f.debug_tuple("Fixed").field(open).finish(),
            Self::Signal(signal) => f.debug_tuple("Signal").field(signal).finish(),
            Self::Stream(gate) => f
                .debug_struct("Stream")
                .field("initial", &gate.initial)
                .finish_non_exhaustive(),
        }
    }
}
