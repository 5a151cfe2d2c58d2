//! Per-session lifecycle shared by the interceptors that run a feedback loop.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use waitgroup::WaitGroup;

use crate::attributes::Attributes;
use crate::error::Result;
use crate::{RTCPWriter, RtcpPacket, lock};

/// Opaque identifier of one logical peer connection.
///
/// Uniqueness is the caller's responsibility: building two chains with the
/// same id yields two independent sets of interceptors that log under the
/// same name.
pub type SessionId = String;

/// Clock source override, mainly for tests.
pub type FnTimeGen = Arc<dyn (Fn() -> SystemTime) + Sync + Send + 'static>;

/// Ticker drives a feedback loop.
#[async_trait]
pub trait Ticker: Send {
    /// Completes at the next tick.
    async fn tick(&mut self);
}

/// Ticker factory override, called once per loop with the configured interval.
pub type FnTickerGen = Arc<dyn (Fn(Duration) -> Box<dyn Ticker>) + Sync + Send + 'static>;

struct IntervalTicker(tokio::time::Interval);

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.0.tick().await;
    }
}

/// Default ticker: first tick one interval after creation, then periodic.
pub fn interval_ticker(interval: Duration) -> Box<dyn Ticker> {
    Box::new(IntervalTicker(tokio::time::interval_at(
        Instant::now() + interval,
        interval,
    )))
}

pub(crate) fn system_now() -> SystemTime {
    SystemTime::now()
}

/// The RTCP writer a feedback loop writes to. Binding another writer while
/// the loop runs swaps the target for every later write.
#[derive(Clone)]
pub(crate) struct WriterSlot(Arc<Mutex<Arc<dyn RTCPWriter + Send + Sync>>>);

impl WriterSlot {
    fn new(writer: Arc<dyn RTCPWriter + Send + Sync>) -> Self {
        WriterSlot(Arc::new(Mutex::new(writer)))
    }

    fn replace(&self, writer: Arc<dyn RTCPWriter + Send + Sync>) {
        *lock(&self.0) = writer;
    }

    pub(crate) async fn write(
        &self,
        pkts: &[RtcpPacket],
        attributes: &Attributes,
    ) -> Result<usize> {
        let writer = Arc::clone(&lock(&self.0));
        writer.write(pkts, attributes).await
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SessionState {
    Fresh,
    Running,
    TornDown,
}

/// Owns the teardown signal and join point of a session's background loop.
///
/// The loop is started at most once. Dropping the teardown sender is the
/// close signal: the loop observes `recv()` returning `None`.
pub(crate) struct Session {
    id: SessionId,
    state: Mutex<SessionState>,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
    close_rx: Mutex<Option<mpsc::Receiver<()>>>,
    wg: Mutex<Option<WaitGroup>>,
    writer: Mutex<Option<WriterSlot>>,
}

impl Session {
    pub(crate) fn new(id: &str) -> Self {
        let (close_tx, close_rx) = mpsc::channel(1);
        Session {
            id: id.to_owned(),
            state: Mutex::new(SessionState::Fresh),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx: Mutex::new(Some(close_rx)),
            wg: Mutex::new(Some(WaitGroup::new())),
            writer: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == SessionState::TornDown
    }

    /// Spawns the background loop unless it already runs or the session is
    /// torn down. Returns whether a loop was started.
    pub(crate) fn spawn_loop<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce(mpsc::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&self.state);
        if *state != SessionState::Fresh {
            return false;
        }

        let Some(close_rx) = lock(&self.close_rx).take() else {
            return false;
        };
        let Some(worker) = lock(&self.wg).as_ref().map(|wg| wg.worker()) else {
            return false;
        };
        *state = SessionState::Running;
        drop(state);

        log::debug!("session {}: starting feedback loop", self.id);
        let fut = f(close_rx);
        tokio::spawn(async move {
            let _d = worker;
            fut.await;
        });
        true
    }

    /// Points the feedback loop at `writer`. The first call starts the loop
    /// through `f`, later calls replace the writer it uses. Returns whether a
    /// loop was started.
    pub(crate) fn bind_writer<F, Fut>(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
        f: F,
    ) -> bool
    where
        F: FnOnce(WriterSlot, mpsc::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut current = lock(&self.writer);
        if let Some(slot) = current.as_ref() {
            if !self.is_closed() {
                log::debug!("session {}: rtcp writer replaced", self.id);
                slot.replace(writer);
            }
            return false;
        }

        let slot = WriterSlot::new(writer);
        let loop_slot = slot.clone();
        if !self.spawn_loop(move |close_rx| f(loop_slot, close_rx)) {
            return false;
        }
        *current = Some(slot);
        true
    }

    /// Runs `fut` as a task that [`Session::close`] waits for. Returns false
    /// once the session is torn down.
    pub(crate) fn spawn_task<Fut>(&self, fut: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(worker) = lock(&self.wg).as_ref().map(|wg| wg.worker()) else {
            return false;
        };
        tokio::spawn(async move {
            let _d = worker;
            fut.await;
        });
        true
    }

    /// Signals teardown and waits for the loop to exit. Idempotent.
    pub(crate) async fn close(&self) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::TornDown {
                return;
            }
            *state = SessionState::TornDown;
        }

        lock(&self.close_tx).take();
        lock(&self.close_rx).take();
        lock(&self.writer).take();

        let wg = lock(&self.wg).take();
        if let Some(wg) = wg {
            wg.wait().await;
        }
        log::debug!("session {}: closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_session_lifecycle() {
        let session = Session::new("s1");
        assert_eq!(session.state(), SessionState::Fresh);
        assert_eq!(session.id(), "s1");

        let exited = Arc::new(AtomicUsize::new(0));
        let exited2 = Arc::clone(&exited);
        assert!(session.spawn_loop(move |mut close_rx| async move {
            let _ = close_rx.recv().await;
            exited2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(session.state(), SessionState::Running);

        // a second loop is never started
        assert!(!session.spawn_loop(|_| async {}));

        session.close().await;
        assert_eq!(exited.load(Ordering::SeqCst), 1);
        assert!(session.is_closed());

        // idempotent
        session.close().await;
        assert!(!session.spawn_loop(|_| async {}));
    }

    #[tokio::test]
    async fn test_bind_writer_swaps_running_loop_target() {
        use crate::mock::rtcp_writer_channel;

        let session = Session::new("s3");
        let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);
        let (first, mut first_rx) = rtcp_writer_channel();
        assert!(session.bind_writer(first, move |slot, mut close_rx| async move {
            loop {
                tokio::select! {
                    Some(()) = tick_rx.recv() => {
                        let pkts: [RtcpPacket; 1] =
                            [Box::new(rtcp::goodbye::Goodbye::default())];
                        let _ = slot.write(&pkts, &Attributes::new()).await;
                    }
                    _ = close_rx.recv() => return,
                }
            }
        }));

        tick_tx.send(()).await.unwrap();
        assert_eq!(first_rx.recv().await.unwrap().len(), 1);

        let (second, mut second_rx) = rtcp_writer_channel();
        assert!(!session.bind_writer(second, |_, _| async {}));
        tick_tx.send(()).await.unwrap();
        assert_eq!(second_rx.recv().await.unwrap().len(), 1);
        assert!(first_rx.try_recv().is_err());

        session.close().await;
        let (third, _third_rx) = rtcp_writer_channel();
        assert!(!session.bind_writer(third, |_, _| async {}));
    }

    #[tokio::test]
    async fn test_close_waits_for_tasks() {
        let session = Session::new("s4");
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        assert!(session.spawn_task(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            done2.fetch_add(1, Ordering::SeqCst);
        }));

        session.close().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!session.spawn_task(async {}));
    }

    #[tokio::test]
    async fn test_close_without_loop() {
        let session = Session::new("s2");
        session.close().await;
        assert!(session.is_closed());
        assert!(!session.spawn_loop(|_| async {}));
    }

    #[tokio::test]
    async fn test_interval_ticker_skips_immediate_tick() {
        let start = Instant::now();
        let mut ticker = interval_ticker(Duration::from_millis(20));
        ticker.tick().await;
        assert!(Instant::now() - start >= Duration::from_millis(20));
    }
}
