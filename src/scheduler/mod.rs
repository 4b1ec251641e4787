use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ValueCache;
use crate::config::{PollConfig, RetryPolicy};
use crate::connector::{Connector, Link, ReadError};
use crate::listeners::ListenerRegistry;
use crate::parser::FrameParser;

/// Where a device's poll loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Polling,
    /// Waiting to retry after the `attempt`-th failed read of this cycle
    RetryWait { attempt: u32 },
    /// Retries exhausted, nothing happens until a reset
    Suspended,
}

/// Result of one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A frame was parsed and merged, with the number of changed values
    Success(usize),
    /// The frame could not be parsed and was dropped
    Dropped,
    Suspended,
    Cancelled,
}

/// Runs the poll loop of one device
pub struct Scheduler<C: Connector, P: FrameParser> {
    name: String,
    session_id: Uuid,
    link: Link<C>,
    parser: P,
    cache: Arc<ValueCache>,
    listeners: ListenerRegistry,
    poll_interval: Duration,
    timeout: Duration,
    retry: RetryPolicy,
    state: watch::Sender<PollState>,
    reset: Arc<Notify>,
}

impl<C: Connector, P: FrameParser> Scheduler<C, P> {
    pub fn new(name: &str, connector: C, parser: P, config: &PollConfig, listeners: ListenerRegistry) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Scheduler {
            name: name.to_string(),
            session_id: Uuid::new_v4(),
            link: Link::new(connector, config.retry.max_attempts, listeners.clone()),
            parser,
            cache: Arc::new(ValueCache::new()),
            listeners,
            poll_interval: config.poll_interval,
            timeout: config.timeout,
            retry: config.retry.clone(),
            state,
            reset: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn cache(&self) -> Arc<ValueCache> {
        self.cache.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    /// Notify this to wake a suspended scheduler
    pub fn reset_handle(&self) -> Arc<Notify> {
        self.reset.clone()
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    fn set_state(&self, next: PollState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("{} [{}]: {:?} -> {:?}", self.name, self.session_id, current, next);
            *current = next;
            true
        });
    }

    /// One poll cycle: read, parse and merge, retrying transient failures
    /// with backoff until the connector's budget is used up.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> PollOutcome {
        loop {
            self.set_state(PollState::Polling);

            // an in-flight open or read is dropped on cancel, `run` still closes the link
            let read = tokio::select! {
                _ = cancel.cancelled() => None,
                read = self.link.read(self.timeout) => Some(read),
            };
            let Some(read) = read else {
                self.set_state(PollState::Idle);
                return PollOutcome::Cancelled;
            };

            match read {
                Ok(frame) => {
                    self.set_state(PollState::Idle);
                    return self.handle_frame(&frame);
                }
                Err(ReadError::Fatal(e)) => {
                    error!("{} [{}]: polling suspended: {}", self.name, self.session_id, e);
                    self.set_state(PollState::Suspended);
                    return PollOutcome::Suspended;
                }
                Err(e) => {
                    let attempt = self.link.failures();
                    let delay = self.retry.delay(attempt);
                    warn!("{} [{}]: read failed ({}), retry {} in {:?}", self.name, self.session_id, e, attempt, delay);
                    self.set_state(PollState::RetryWait { attempt });

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.set_state(PollState::Idle);
                            return PollOutcome::Cancelled;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) -> PollOutcome {
        match self.parser.parse(frame) {
            Ok(readings) => {
                let changed = self.cache.merge(readings);
                debug!("{} [{}]: {} values changed", self.name, self.session_id, changed.len());
                for entry in &changed {
                    self.listeners.notify_value_changed(entry);
                }
                PollOutcome::Success(changed.len())
            }
            Err(e) => {
                warn!("{} [{}]: dropping frame of {} bytes: {}", self.name, self.session_id, frame.len(), e);
                PollOutcome::Dropped
            }
        }
    }

    /// Poll every `poll_interval` until `cancel` fires. The connection is
    /// always closed before this returns.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("{} [{}]: polling {} every {:?}", self.name, self.session_id, self.link.describe(), self.poll_interval);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once(&cancel).await {
                PollOutcome::Cancelled => break,
                PollOutcome::Suspended => {
                    let reset = self.reset.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = reset.notified() => {
                            info!("{} [{}]: reset, resuming polls", self.name, self.session_id);
                            self.link.reset();
                            self.set_state(PollState::Idle);
                            ticker.reset_immediately();
                        }
                    }
                }
                PollOutcome::Success(_) | PollOutcome::Dropped => {}
            }
        }

        self.link.close().await;
        info!("{} [{}]: stopped", self.name, self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, TransportAddress};
    use crate::connector::tests::{ScriptedConnector, Step};
    use crate::connector::ConnectError;
    use crate::listeners::tests::RecordingListener;
    use crate::models::{ConnectionState, ReadingSet, Value};
    use crate::parser::ParseError;
    use std::sync::atomic::Ordering;

    /// `name=number` per line, `garbage` is malformed
    struct KeyValueParser;

    impl FrameParser for KeyValueParser {
        fn parse(&self, frame: &[u8]) -> Result<ReadingSet, ParseError> {
            let text = std::str::from_utf8(frame).map_err(|e| ParseError::Malformed(e.to_string()))?;
            if text == "garbage" {
                return Err(ParseError::Malformed("garbage".to_string()));
            }
            Ok(text
                .lines()
                .filter_map(|l| l.split_once('='))
                .filter_map(|(k, v)| v.parse::<f64>().ok().map(|v| (k, Value::numeric(v, None))))
                .collect())
        }
    }

    fn config(retries: u32) -> PollConfig {
        PollConfig {
            transport: TransportAddress::Tcp { host: "localhost".to_string(), port: 1 },
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            retry: RetryPolicy { max_attempts: retries, backoff: Backoff::Fixed(Duration::from_secs(1)) },
            baud_rate: 9600,
            unit_id: 1,
        }
    }

    fn scheduler(
        connector: ScriptedConnector,
        retries: u32,
    ) -> (Scheduler<ScriptedConnector, KeyValueParser>, Arc<RecordingListener>) {
        let listeners = ListenerRegistry::new();
        let recorder = Arc::new(RecordingListener::default());
        listeners.register(recorder.clone());
        (Scheduler::new("meter", connector, KeyValueParser, &config(retries), listeners), recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let connector = ScriptedConnector::new(vec![Step::Timeout, Step::Reset], Step::Frame(b"power=42".to_vec()));
        let counters = connector.counters.clone();
        let (mut scheduler, recorder) = scheduler(connector, 3);

        let outcome = scheduler.poll_once(&CancellationToken::new()).await;
        assert_eq!(outcome, PollOutcome::Success(1));
        assert_eq!(scheduler.state(), PollState::Idle);
        assert_eq!(counters.reads.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.state_count(ConnectionState::Failed), 0);
        assert_eq!(recorder.values.lock().unwrap().len(), 1);
        assert_eq!(scheduler.cache().get("power").map(|c| c.value), Some(Value::numeric(42.0, None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_timeout_suspends_once() {
        let connector = ScriptedConnector::new(vec![], Step::Timeout);
        let counters = connector.counters.clone();
        let (scheduler, recorder) = scheduler(connector, 3);
        let mut states = scheduler.subscribe();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        states.wait_for(|s| *s == PollState::Suspended).await.unwrap();
        assert_eq!(counters.reads.load(Ordering::SeqCst), 3);

        // many poll intervals later nothing has been retried
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counters.reads.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.state_count(ConnectionState::Failed), 1);
        assert_eq!(*states.borrow(), PollState::Suspended);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_dropped_without_retry() {
        let connector = ScriptedConnector::new(vec![Step::Frame(b"garbage".to_vec())], Step::Frame(b"a=1".to_vec()));
        let counters = connector.counters.clone();
        let (mut scheduler, recorder) = scheduler(connector, 3);
        let cancel = CancellationToken::new();

        assert_eq!(scheduler.poll_once(&cancel).await, PollOutcome::Dropped);
        assert_eq!(counters.reads.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), PollState::Idle);
        assert!(scheduler.cache().is_empty());

        assert_eq!(scheduler.poll_once(&cancel).await, PollOutcome::Success(1));
        // merging the same values again changes nothing
        assert_eq!(scheduler.poll_once(&cancel).await, PollOutcome::Success(0));
        assert_eq!(recorder.values.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_resumes_polling() {
        let connector = ScriptedConnector::new(
            vec![Step::Timeout, Step::Timeout, Step::Timeout],
            Step::Frame(b"a=1".to_vec()),
        );
        let (scheduler, recorder) = scheduler(connector, 3);
        let mut states = scheduler.subscribe();
        let cache = scheduler.cache();
        let reset = scheduler.reset_handle();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        states.wait_for(|s| *s == PollState::Suspended).await.unwrap();
        assert!(cache.is_empty());

        reset.notify_one();
        for _ in 0..100 {
            if !cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(cache.get("a").map(|c| c.value), Some(Value::numeric(1.0, None)));
        assert_eq!(recorder.state_count(ConnectionState::Failed), 1);
        assert_eq!(*recorder.states.lock().unwrap().last().unwrap(), ConnectionState::Connected);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_closes_connection() {
        let connector = ScriptedConnector::new(vec![], Step::Frame(b"a=1".to_vec()));
        let counters = connector.counters.clone();
        let (scheduler, recorder) = scheduler(connector, 3);
        let states = scheduler.subscribe();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        // first tick fires right away
        while counters.reads.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*states.borrow(), PollState::Idle);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.states.lock().unwrap().last().unwrap(), ConnectionState::Disconnected);
    }

    /// Takes almost the whole timeout to connect, then never sends a frame
    struct SlowConnector;

    #[async_trait::async_trait]
    impl Connector for SlowConnector {
        type Session = ();

        async fn open(&mut self) -> Result<(), ConnectError> {
            tokio::time::sleep(Duration::from_millis(1900)).await;
            Ok(())
        }

        async fn read_frame(&mut self, _session: &mut (), _timeout: Duration) -> Result<Vec<u8>, ReadError> {
            std::future::pending().await
        }

        async fn close(&mut self, _session: ()) {}

        fn describe(&self) -> String {
            "slow".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_connect_stops_promptly() {
        let listeners = ListenerRegistry::new();
        let recorder = Arc::new(RecordingListener::default());
        listeners.register(recorder.clone());
        let scheduler = Scheduler::new("slow", SlowConnector, KeyValueParser, &config(3), listeners);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled_at = tokio::time::Instant::now();
        cancel.cancel();
        task.await.unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_millis(100));
        assert_eq!(*recorder.states.lock().unwrap().last().unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let connector = ScriptedConnector::new(vec![], Step::Timeout);
        let counters = connector.counters.clone();
        let (mut scheduler, _) = scheduler(connector, 5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(scheduler.poll_once(&cancel).await, PollOutcome::Cancelled);
        assert_eq!(counters.reads.load(Ordering::SeqCst), 1);
    }
}
