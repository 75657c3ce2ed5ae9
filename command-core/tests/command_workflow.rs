use command_core::{Action, Command, CommandError, Executability, Signal, Subscription};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// 每次执行从队列中取出一个闸门，动作挂起直到对应的 sender 被触发
#[derive(Clone, Default)]
struct Latches {
    pending: Arc<Mutex<Vec<oneshot::Receiver<anyhow::Result<()>>>>>,
    runs: Arc<AtomicUsize>,
}

impl Latches {
    fn arm(&self, n: usize) -> Vec<oneshot::Sender<anyhow::Result<()>>> {
        let mut senders = Vec::with_capacity(n);
        let mut pending = self.pending.lock().unwrap();
        for _ in 0..n {
            let (tx, rx) = oneshot::channel();
            senders.push(tx);
            pending.push(rx);
        }
        // 按执行顺序从尾部弹出
        pending.reverse();
        senders
    }

    fn action(&self) -> Action<(), ()> {
        let latches = self.clone();
        Action::future(move |()| {
            latches.runs.fetch_add(1, Ordering::SeqCst);
            let rx = latches.pending.lock().unwrap().pop();
            async move {
                match rx {
                    Some(rx) => rx.await.unwrap_or(Ok(())),
                    None => Ok(()),
                }
            }
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

fn record(signal: &Signal<bool>) -> (Arc<Mutex<Vec<bool>>>, Subscription) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let sub = signal.observe(move |v| sink.lock().unwrap().push(*v));
    (log, sub)
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_execute_runs_action_once_when_concurrency_disallowed() {
    let latches = Latches::default();
    let mut release = latches.arm(1);
    let command = Command::builder().action(latches.action()).build();
    command.subscribe();

    let (executing, _a) = record(&command.is_executing_signal());
    let (can_execute, _b) = record(&command.can_execute_signal());

    let first = command.execute(()).expect("first execution starts");
    assert!(command.is_executing());
    assert!(!command.can_execute());

    // 执行中再次调用：被忽略，动作不会被再次调用
    assert!(command.execute(()).is_none());
    assert!(command.is_executing());

    release.remove(0).send(Ok(())).unwrap();
    first.await.unwrap();

    assert_eq!(latches.runs(), 1);
    assert_eq!(*executing.lock().unwrap(), vec![false, true, false]);
    assert_eq!(*can_execute.lock().unwrap(), vec![true, false, true]);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_executions_stay_executing_until_the_last_settles() {
    let latches = Latches::default();
    let mut release = latches.arm(2);
    let command = Command::builder()
        .action(latches.action())
        .allow_concurrent_execution(true)
        .build();
    command.subscribe();

    let (executing, _a) = record(&command.is_executing_signal());
    let (can_execute, _b) = record(&command.can_execute_signal());

    let first = command.execute(()).unwrap();
    let second = command.execute(()).unwrap();
    assert_eq!(latches.runs(), 2);
    assert_eq!(command.in_flight(), 2);
    assert!(command.can_execute());

    release.remove(0).send(Ok(())).unwrap();
    first.await.unwrap();
    assert!(command.is_executing());
    assert_eq!(command.in_flight(), 1);

    release.remove(0).send(Ok(())).unwrap();
    second.await.unwrap();
    assert!(!command.is_executing());

    assert_eq!(*executing.lock().unwrap(), vec![false, true, false]);
    // 允许并发时执行状态不影响 can_execute
    assert_eq!(*can_execute.lock().unwrap(), vec![true]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_action_releases_flag_and_surfaces_error() {
    let latches = Latches::default();
    let mut release = latches.arm(1);
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();

    let command = Command::builder()
        .action(latches.action())
        .name("upload")
        .on_error(Arc::new(move |err: &CommandError| {
            sink.lock().unwrap().push(err.to_string());
        }))
        .build();
    command.subscribe();

    let execution = command.execute(()).unwrap();
    release
        .remove(0)
        .send(Err(anyhow::anyhow!("connection reset")))
        .unwrap();

    let err = execution.await.unwrap_err();
    assert!(matches!(err, CommandError::ActionFailed { .. }));
    assert!(!command.is_executing());
    assert!(command.can_execute());
    assert_eq!(
        *reported.lock().unwrap(),
        vec!["action failed: connection reset".to_string()]
    );

    // 失败后可以再次执行
    assert!(command.execute(()).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_action_releases_flag() {
    let command: Command<u8, ()> = Command::from_async(|n: u8| async move {
        if n > 0 {
            panic!("bad input {n}");
        }
        anyhow::Ok(())
    });
    command.subscribe();

    let err = command.execute(7).unwrap().await.unwrap_err();
    match err {
        CommandError::ActionPanicked { reason } => assert_eq!(reason, "bad input 7"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!command.is_executing());
    assert_eq!(command.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_execution_still_settles() {
    let latches = Latches::default();
    let mut release = latches.arm(1);
    let command = Command::builder().action(latches.action()).build();
    command.subscribe();

    drop(command.execute(()).unwrap());
    assert!(command.is_executing());

    release.remove(0).send(Ok(())).unwrap();
    let probe = command.clone();
    eventually(move || !probe.is_executing()).await;
    assert_eq!(latches.runs(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn gate_signal_changes_propagate_synchronously() {
    let gate = Signal::new(true);
    let latches = Latches::default();
    let mut release = latches.arm(1);
    let command = Command::builder()
        .action(latches.action())
        .executability(gate.clone())
        .build();
    command.subscribe();
    let (can_execute, _sub) = record(&command.can_execute_signal());

    gate.set(false);
    assert!(!command.can_execute());
    gate.set(true);
    assert!(command.can_execute());

    let execution = command.execute(()).unwrap();
    // 执行中闸门变化不会让 can_execute 提前恢复
    gate.set(false);
    gate.set(true);
    assert!(!command.can_execute());

    release.remove(0).send(Ok(())).unwrap();
    execution.await.unwrap();

    assert_eq!(
        *can_execute.lock().unwrap(),
        vec![true, false, true, false, true]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_receiver_gate_is_followed_while_subscribed() {
    let (tx, rx) = watch::channel(false);
    let command: Command<(), ()> = Command::builder()
        .action(Action::sync(|()| anyhow::Ok(())))
        .executability(rx)
        .build();

    assert!(!command.can_execute());
    command.subscribe();

    tx.send(true).unwrap();
    let probe = command.clone();
    eventually(move || probe.can_execute()).await;

    command.unsubscribe();
    let _ = tx.send(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(command.can_execute(), "no updates after unsubscribe");
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_gate_from_arbitrary_stream() {
    let updates = futures_util::stream::iter(vec![true, false, true]);
    let command: Command<(), ()> = Command::builder()
        .action(Action::sync(|()| anyhow::Ok(())))
        .executability(Executability::from_stream(false, updates))
        .build();

    let (can_execute, _sub) = record(&command.can_execute_signal());
    command.subscribe();

    let log = can_execute.clone();
    eventually(move || log.lock().unwrap().len() >= 4).await;
    assert_eq!(*can_execute.lock().unwrap(), vec![false, true, false, true]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_freezes_signals_and_disables_execute() {
    let latches = Latches::default();
    let mut release = latches.arm(1);
    let command = Command::builder().action(latches.action()).build();
    command.subscribe();

    let (executing, _sub) = record(&command.is_executing_signal());
    let mut can_execute = command.can_execute_signal().watch();
    assert_eq!(can_execute.next().await, Some(true));

    let in_flight = command.execute(()).unwrap();
    command.unsubscribe();
    assert!(command.execute(()).is_none());

    // 进行中的动作仍运行到落定，但不再发布任何值
    release.remove(0).send(Ok(())).unwrap();
    in_flight.await.unwrap();

    assert_eq!(latches.runs(), 1);
    assert_eq!(*executing.lock().unwrap(), vec![false, true]);
    assert_eq!(command.in_flight(), 0);
    // 流可能先产出最后一个值，之后一定结束
    while can_execute.next().await.is_some() {}
    assert!(command.can_execute_signal().is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_from_an_observer_silences_the_rest_of_the_round() {
    let gate = Signal::new(false);
    let command: Command<(), ()> = Command::builder()
        .action(Action::sync(|()| anyhow::Ok(())))
        .executability(gate.clone())
        .build();
    command.subscribe();

    let teardown = command.clone();
    let _first = command.can_execute_signal().observe(move |can| {
        if *can {
            teardown.unsubscribe();
        }
    });
    let (later, _second) = record(&command.can_execute_signal());

    gate.set(true);

    assert_eq!(command.lifecycle(), command_core::Lifecycle::Disposed);
    assert!(command.can_execute_signal().is_closed());
    assert_eq!(*later.lock().unwrap(), vec![false]);
}

#[tokio::test(flavor = "multi_thread")]
async fn observers_may_call_back_into_the_command() {
    let latches = Latches::default();
    let mut release = latches.arm(2);
    let command = Command::builder().action(latches.action()).build();
    command.subscribe();

    // 第二次看到 true（首个值为订阅时的当前值）时在回调内再次执行
    let again = command.clone();
    let seen_true = Arc::new(AtomicUsize::new(0));
    let counter = seen_true.clone();
    let _sub = command.can_execute_signal().observe(move |can| {
        if *can && counter.fetch_add(1, Ordering::SeqCst) == 1 {
            drop(again.execute(()));
        }
    });

    let first = command.execute(()).unwrap();
    release.remove(0).send(Ok(())).unwrap();
    first.await.unwrap();

    assert_eq!(latches.runs(), 2);
    assert!(command.is_executing());
    assert!(!command.can_execute());

    release.remove(0).send(Ok(())).unwrap();
    let probe = command.clone();
    eventually(move || !probe.is_executing()).await;
    assert!(command.can_execute());
}
