//! Single-threaded, message-driven actors.
//!
//! Every engine in this crate implements [`Actor`]: it handles one message
//! at a time and exposes a `tick` that is re-run (rate limited) while it
//! reports unfinished work. The driver owns the mailbox, the rate limiter and
//! the shutdown signal; the engines only implement `handle` and `tick`.
//!
//! Shutdown is two-phase: the mailbox stops accepting external messages,
//! queued messages are handled, then the driver waits for outstanding worker
//! jobs to report back before resolving the shutdown signal.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::Instrument;

use crate::{error::ActorError, workers::WorkerPool};

/// Behaviour of a single actor.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Mailbox message type.
    type Message: Send + 'static;

    /// Name used in logs and errors.
    const NAME: &'static str;

    /// Called once before the first message is handled.
    async fn started(&mut self, _ctx: &Context<Self::Message>) {}

    /// Handle one mailbox message.
    async fn handle(&mut self, message: Self::Message, ctx: &Context<Self::Message>);

    /// Run one round of periodic work; return `true` to be ticked again.
    async fn tick(&mut self, ctx: &Context<Self::Message>) -> bool;

    /// Called after the mailbox has drained, just before the shutdown signal fires.
    async fn stopping(&mut self) {}
}

enum Envelope<M> {
    Message(M),
    Completed(M),
    Abandoned,
    Trigger,
    Stop,
}

#[derive(Debug)]
struct Shared {
    name: &'static str,
    accepting: AtomicBool,
    trigger_queued: AtomicBool,
    outstanding: AtomicUsize,
}

/// Sending side of an actor's mailbox.
pub struct Mailbox<M> {
    tx: mpsc::UnboundedSender<Envelope<M>>,
    shared: Arc<Shared>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<M> std::fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("actor", &self.shared.name)
            .finish()
    }
}

/// Receiving side of an actor's mailbox, consumed by [`spawn`].
pub struct Inbox<M> {
    rx: mpsc::UnboundedReceiver<Envelope<M>>,
    mailbox: Mailbox<M>,
}

/// Create a mailbox before the actor exists, so actors can hold each
/// other's addresses regardless of spawn order.
pub fn channel<M>(name: &'static str) -> (Mailbox<M>, Inbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mailbox = Mailbox {
        tx,
        shared: Arc::new(Shared {
            name,
            accepting: AtomicBool::new(true),
            trigger_queued: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
        }),
    };
    let inbox = Inbox {
        rx,
        mailbox: mailbox.clone(),
    };
    (mailbox, inbox)
}

impl<M: Send + 'static> Mailbox<M> {
    /// Queue a message.
    pub fn send(&self, message: M) -> Result<(), ActorError> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(ActorError::ShuttingDown(self.shared.name));
        }
        self.tx
            .send(Envelope::Message(message))
            .map_err(|_| ActorError::Closed(self.shared.name))
    }

    /// Send a message carrying a reply channel and wait up to `wait` for the answer.
    pub async fn ask<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> M,
        wait: Duration,
    ) -> Result<R, ActorError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        match time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ActorError::Closed(self.shared.name)),
            Err(_) => Err(ActorError::Timeout(self.shared.name)),
        }
    }

    /// Ask the actor to tick. Coalesced: while one trigger is queued, further
    /// calls do nothing.
    pub fn trigger(&self) {
        if !self.shared.trigger_queued.swap(true, Ordering::AcqRel)
            && self.tx.send(Envelope::Trigger).is_err()
        {
            self.shared.trigger_queued.store(false, Ordering::Release);
        }
    }

    /// Whether external messages are still accepted.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Name of the owning actor.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    fn close(&self) {
        if self.shared.accepting.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Envelope::Stop);
        }
    }

    fn complete(&self, message: M) {
        let _ = self.tx.send(Envelope::Completed(message));
    }

    fn abandon(&self) {
        let _ = self.tx.send(Envelope::Abandoned);
    }
}

/// What an actor sees of its own runtime.
pub struct Context<M> {
    mailbox: Mailbox<M>,
    workers: WorkerPool,
}

impl<M: Send + 'static> Context<M> {
    /// Context around an existing mailbox. The driver builds one per actor;
    /// tests build their own to call `handle`/`tick` directly.
    pub fn new(mailbox: Mailbox<M>, workers: WorkerPool) -> Self {
        Self { mailbox, workers }
    }

    /// The actor's own mailbox.
    pub fn mailbox(&self) -> &Mailbox<M> {
        &self.mailbox
    }

    /// Schedule another tick (coalesced, rate limited).
    pub fn trigger(&self) {
        self.mailbox.trigger();
    }

    /// Whether the actor is in its shutdown phase.
    pub fn is_stopping(&self) -> bool {
        !self.mailbox.is_accepting()
    }

    /// Number of worker jobs that have not reported back yet.
    pub fn outstanding(&self) -> usize {
        self.mailbox.shared.outstanding.load(Ordering::Acquire)
    }

    /// Run `job` on the worker pool and deliver `complete(result)` back to
    /// this actor's mailbox. The actor keeps handling messages meanwhile.
    pub fn dispatch<T, F, C>(&self, job: F, complete: C)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        C: FnOnce(T) -> M + Send + 'static,
    {
        self.mailbox.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let mailbox = self.mailbox.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            match workers.run(job).await {
                Ok(out) => mailbox.complete(complete(out)),
                Err(_) => mailbox.abandon(),
            }
        });
    }
}

/// Resolves once the actor has fully stopped.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until the actor has stopped.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }

    /// Whether the actor has stopped.
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Driver settings for one actor.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Minimum spacing between ticks.
    pub interval: Duration,
    /// How long the shutdown phase waits for outstanding worker jobs.
    pub drain: Duration,
}

/// Owner's handle on a running actor.
pub struct ActorHandle<M> {
    mailbox: Mailbox<M>,
    signal: ShutdownSignal,
    task: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> ActorHandle<M> {
    /// The actor's mailbox.
    pub fn mailbox(&self) -> &Mailbox<M> {
        &self.mailbox
    }

    /// A signal that resolves when the actor has stopped.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Stop accepting external work, drain, and wait for the actor to finish.
    pub async fn shutdown(mut self) {
        self.mailbox.close();
        self.signal.clone().wait().await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<M> Drop for ActorHandle<M> {
    fn drop(&mut self) {
        if self.shared_accepting() {
            self.mailbox.shared.accepting.store(false, Ordering::Release);
            let _ = self.mailbox.tx.send(Envelope::Stop);
        }
    }
}

impl<M> ActorHandle<M> {
    fn shared_accepting(&self) -> bool {
        self.mailbox.shared.accepting.load(Ordering::Acquire)
    }
}

/// Spawn `actor` on the current tokio runtime.
pub fn spawn<A: Actor>(
    actor: A,
    inbox: Inbox<A::Message>,
    workers: WorkerPool,
    settings: Settings,
) -> ActorHandle<A::Message> {
    let (done_tx, done_rx) = watch::channel(false);
    let mailbox = inbox.mailbox.clone();
    let span = tracing::info_span!("actor", name = A::NAME);
    let task = tokio::spawn(run(actor, inbox, workers, settings, done_tx).instrument(span));
    ActorHandle {
        mailbox,
        signal: ShutdownSignal { rx: done_rx },
        task: Some(task),
    }
}

async fn run<A: Actor>(
    mut actor: A,
    mut inbox: Inbox<A::Message>,
    workers: WorkerPool,
    settings: Settings,
    done: watch::Sender<bool>,
) {
    let shared = inbox.mailbox.shared.clone();
    let ctx = Context::new(inbox.mailbox.clone(), workers);

    actor.started(&ctx).await;
    tracing::debug!("started");

    let mut tick_due = false;
    let mut last_tick: Option<Instant> = None;

    loop {
        let next_tick = last_tick.map_or_else(Instant::now, |t| t + settings.interval);
        tokio::select! {
            biased;
            envelope = inbox.rx.recv() => match envelope {
                Some(Envelope::Message(message)) => actor.handle(message, &ctx).await,
                Some(Envelope::Completed(message)) => {
                    shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                    actor.handle(message, &ctx).await;
                }
                Some(Envelope::Abandoned) => {
                    shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                    ctx.trigger();
                }
                Some(Envelope::Trigger) => {
                    shared.trigger_queued.store(false, Ordering::Release);
                    tick_due = true;
                }
                Some(Envelope::Stop) | None => break,
            },
            _ = time::sleep_until(next_tick), if tick_due => {
                tick_due = false;
                last_tick = Some(Instant::now());
                if actor.tick(&ctx).await {
                    ctx.trigger();
                }
            }
        }
    }

    tracing::debug!(
        outstanding = shared.outstanding.load(Ordering::Acquire),
        "draining"
    );
    let deadline = Instant::now() + settings.drain;
    while shared.outstanding.load(Ordering::Acquire) > 0 {
        match time::timeout_at(deadline, inbox.rx.recv()).await {
            Ok(Some(Envelope::Completed(message))) => {
                shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                actor.handle(message, &ctx).await;
            }
            Ok(Some(Envelope::Abandoned)) => {
                shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    outstanding = shared.outstanding.load(Ordering::Acquire),
                    "shutdown drain timed out"
                );
                break;
            }
        }
    }

    actor.stopping().await;
    tracing::debug!("stopped");
    let _ = done.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log {
        events: Vec<String>,
        ticks: usize,
    }

    struct Recorder {
        log: Arc<Mutex<Log>>,
        extra_ticks: usize,
    }

    enum Msg {
        Note(&'static str),
        Work(u32),
        Done(u32),
    }

    #[async_trait]
    impl Actor for Recorder {
        type Message = Msg;
        const NAME: &'static str = "recorder";

        async fn handle(&mut self, message: Msg, ctx: &Context<Msg>) {
            let mut log = self.log.lock().unwrap();
            match message {
                Msg::Note(n) => log.events.push(n.to_string()),
                Msg::Work(n) => ctx.dispatch(move || n * 2, Msg::Done),
                Msg::Done(n) => log.events.push(format!("done {n}")),
            }
        }

        async fn tick(&mut self, _ctx: &Context<Msg>) -> bool {
            let mut log = self.log.lock().unwrap();
            log.ticks += 1;
            if self.extra_ticks > 0 {
                self.extra_ticks -= 1;
                true
            } else {
                false
            }
        }
    }

    fn settings(interval_ms: u64) -> Settings {
        Settings {
            interval: Duration::from_millis(interval_ms),
            drain: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn handles_in_order_and_coalesces_triggers() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (mailbox, inbox) = channel("recorder");
        let handle = spawn(
            Recorder {
                log: log.clone(),
                extra_ticks: 0,
            },
            inbox,
            WorkerPool::new(1),
            settings(50),
        );

        mailbox.send(Msg::Note("a")).unwrap();
        for _ in 0..10 {
            mailbox.trigger();
        }
        mailbox.send(Msg::Note("b")).unwrap();
        time::sleep(Duration::from_millis(200)).await;

        {
            let log = log.lock().unwrap();
            assert_eq!(log.events, vec!["a", "b"]);
            assert_eq!(log.ticks, 1);
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reticks_while_work_remains() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (mailbox, inbox) = channel("recorder");
        let handle = spawn(
            Recorder {
                log: log.clone(),
                extra_ticks: 2,
            },
            inbox,
            WorkerPool::new(1),
            settings(10),
        );
        mailbox.trigger();
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(log.lock().unwrap().ticks, 3);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_worker_results_and_refuses_new_work() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (mailbox, inbox) = channel("recorder");
        let handle = spawn(
            Recorder {
                log: log.clone(),
                extra_ticks: 0,
            },
            inbox,
            WorkerPool::new(1),
            settings(10),
        );
        mailbox.send(Msg::Work(21)).unwrap();
        let signal = handle.shutdown_signal();
        handle.shutdown().await;

        assert!(signal.is_done());
        assert_eq!(
            mailbox.send(Msg::Note("late")),
            Err(ActorError::ShuttingDown("recorder"))
        );
        assert_eq!(log.lock().unwrap().events, vec!["done 42"]);
    }
}
