//! Resilient watch streams
//!
//! A [`WatchStream`] subscribes to one resource kind and hands every change
//! to a callback. Each (re)list is delivered as one [`WatchUpdate::Resynced`]
//! snapshot so handlers can drop objects that vanished while disconnected.
//! Error items and stream ends are absorbed here: the stream pauses with a
//! capped linear backoff and carries on, forever.

use crate::apis::metrics::record_watch_failure;
use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::watcher::{self, watcher};
use kube::Resource;
use serde::de::DeserializeOwned;
use std::fmt::{self, Debug};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds added to the pause per consecutive failure
const PAUSE_STEP_SECS: u64 = 6;
/// Pause ceiling in seconds
const PAUSE_MAX_SECS: u64 = 60;
/// While at the ceiling, only every n-th failure is logged
const LOG_EVERY_AT_MAX: u32 = 5;
/// Server-side timeout of each watch request
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "ADDED"),
            EventType::Modified => write!(f, "MODIFIED"),
            EventType::Deleted => write!(f, "DELETED"),
        }
    }
}

/// What to do after the n-th consecutive failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    pub failures: u32,
    pub pause: Duration,
    pub log: bool,
}

impl RetryStep {
    /// `pause = min(n * 6, 60)` seconds, logged while below the ceiling or
    /// on every fifth failure
    pub fn after(failures: u32) -> Self {
        let pause_secs = (u64::from(failures) * PAUSE_STEP_SECS).min(PAUSE_MAX_SECS);
        Self {
            failures,
            pause: Duration::from_secs(pause_secs),
            log: pause_secs < PAUSE_MAX_SECS || failures % LOG_EVERY_AT_MAX == 0,
        }
    }
}

/// Consecutive failure counter of one stream
#[derive(Debug, Default)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) -> RetryStep {
        self.failures = self.failures.saturating_add(1);
        RetryStep::after(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Log a failed call (subject to suppression) and sleep the backoff pause
pub async fn report_failure(url: &str, error: &(dyn fmt::Display + Sync), failures: u32) {
    let step = RetryStep::after(failures);
    if step.log {
        warn!(
            url = %url,
            failures,
            pause_secs = step.pause.as_secs(),
            "{} failed: {}; retrying in {} sec",
            url,
            error,
            step.pause.as_secs()
        );
    }
    tokio::time::sleep(step.pause).await;
}

/// What a handler receives from a [`WatchStream`]
#[derive(Debug, Clone, PartialEq)]
pub enum WatchUpdate<K> {
    Event(EventType, K),
    /// A relist completed; these objects exist right now and any object not
    /// listed is gone
    Resynced(Vec<K>),
}

/// Subscription to one resource kind that never gives up
pub struct WatchStream<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    api: Api<K>,
    kind: &'static str,
    config: watcher::Config,
}

impl<K> WatchStream<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    pub fn new(api: Api<K>, kind: &'static str) -> Self {
        Self {
            api,
            kind,
            config: watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
        }
    }

    /// Dispatch updates to `on_update` until the process exits
    pub async fn run<F>(self, on_update: F)
    where
        F: FnMut(WatchUpdate<K>) + Send,
    {
        let url = self.api.resource_url().to_string();
        info!(kind = self.kind, url = %url, "Starting watch");

        let api = self.api;
        let config = self.config;
        run_watch(
            self.kind,
            &url,
            move || watcher(api.clone(), config.clone()),
            on_update,
        )
        .await;
    }
}

/// Reconnect loop shared by every watched kind
///
/// Error items and stream ends both count as failures: the pause follows
/// [`RetryStep::after`] and the count resets once a connection delivers data.
pub async fn run_watch<K, S, E, C, F>(
    kind: &'static str,
    url: &str,
    mut connect: C,
    mut on_update: F,
) where
    C: FnMut() -> S,
    S: Stream<Item = Result<watcher::Event<K>, E>>,
    E: fmt::Display,
    F: FnMut(WatchUpdate<K>),
{
    let mut backoff = Backoff::new();
    loop {
        consume(connect(), kind, url, &mut backoff, &mut on_update).await;
        fail(kind, url, "stream ended", &mut backoff).await;
    }
}

/// One connection: returns when the stream ends
async fn consume<K, S, E, F>(
    stream: S,
    kind: &'static str,
    url: &str,
    backoff: &mut Backoff,
    on_update: &mut F,
) where
    S: Stream<Item = Result<watcher::Event<K>, E>>,
    E: fmt::Display,
    F: FnMut(WatchUpdate<K>),
{
    futures::pin_mut!(stream);

    // Objects of an in-progress relist
    let mut relist: Option<Vec<K>> = None;
    let mut delivered: u64 = 0;

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                let reason = e.to_string();
                fail(kind, url, &reason, backoff).await;
                continue;
            }
        };

        // Init only announces a relist, nothing has been received yet
        if !matches!(event, watcher::Event::Init) && backoff.failures() > 0 {
            debug!(kind, failures = backoff.failures(), "Watch recovered");
            backoff.reset();
        }

        match event {
            watcher::Event::Init => relist = Some(Vec::new()),
            watcher::Event::InitApply(obj) => match relist.as_mut() {
                Some(objects) => objects.push(obj),
                None => on_update(WatchUpdate::Event(EventType::Added, obj)),
            },
            watcher::Event::InitDone => {
                let objects = relist.take().unwrap_or_default();
                debug!(kind, objects = objects.len(), "Relist complete");
                on_update(WatchUpdate::Resynced(objects));
            }
            watcher::Event::Apply(obj) => on_update(WatchUpdate::Event(EventType::Modified, obj)),
            watcher::Event::Delete(obj) => on_update(WatchUpdate::Event(EventType::Deleted, obj)),
        }
        delivered += 1;
    }

    debug!(kind, delivered, "Watch stream ended");
}

/// Count a failure, log it unless suppressed, and pause
async fn fail(kind: &'static str, url: &str, reason: &str, backoff: &mut Backoff) {
    let step = backoff.record_failure();
    record_watch_failure(kind);
    if step.log {
        warn!(
            kind,
            failures = step.failures,
            pause_secs = step.pause.as_secs(),
            "Watch {} failed and returned: {}; retrying in {} sec",
            url,
            reason,
            step.pause.as_secs()
        );
    }
    tokio::time::sleep(step.pause).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_seven_failures_backoff() {
        let mut backoff = Backoff::new();
        let steps: Vec<RetryStep> = (0..7).map(|_| backoff.record_failure()).collect();

        let pauses: Vec<u64> = steps.iter().map(|s| s.pause.as_secs()).collect();
        assert_eq!(pauses, vec![6, 12, 18, 24, 30, 36, 42]);
        assert!(steps.iter().all(|s| s.log), "all pauses below 60s are logged");
    }

    #[test]
    fn test_log_suppression_at_ceiling() {
        let logged: Vec<u32> = (1..=20).filter(|&n| RetryStep::after(n).log).collect();
        assert_eq!(logged, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 15, 20]);
        assert_eq!(RetryStep::after(11).pause, Duration::from_secs(60));
        assert_eq!(RetryStep::after(1000).pause, Duration::from_secs(60));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new();
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.record_failure().pause, Duration::from_secs(6));
    }

    #[test]
    fn test_zero_failures_means_no_pause() {
        let step = RetryStep::after(0);
        assert_eq!(step.pause, Duration::ZERO);
        assert!(step.log);
    }

    type Item = Result<watcher::Event<Pod>, String>;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Offsets from start at which each connection was opened, within `limit`
    async fn connection_times(mut connections: Vec<Vec<Item>>, limit: Duration) -> Vec<Duration> {
        let start = tokio::time::Instant::now();
        let mut opened = Vec::new();
        connections.reverse();

        let _ = tokio::time::timeout(
            limit,
            run_watch(
                "Pod",
                "/api/v1/pods",
                || {
                    opened.push(start.elapsed());
                    futures::stream::iter(connections.pop().unwrap_or_default())
                },
                |_| {},
            ),
        )
        .await;
        opened
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_counts_as_failure() {
        let opened = connection_times(vec![], Duration::from_secs(40)).await;
        let secs: Vec<u64> = opened.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![0, 6, 18, 36]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reset_after_delivered_event() {
        let opened = connection_times(
            vec![
                vec![Err("connection reset".to_string())],
                vec![Ok(watcher::Event::Apply(pod("a")))],
            ],
            Duration::from_secs(30),
        )
        .await;
        let secs: Vec<u64> = opened.iter().map(|d| d.as_secs()).collect();
        // error (6s) + end (12s), then the delivered event restarts at 6s
        assert_eq!(secs, vec![0, 18, 24]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_and_errors_do_not_reset() {
        let opened = connection_times(
            vec![
                vec![Err("connection reset".to_string())],
                vec![Ok(watcher::Event::Init), Err("410 Gone".to_string())],
            ],
            Duration::from_secs(70),
        )
        .await;
        let secs: Vec<u64> = opened.iter().map(|d| d.as_secs()).collect();
        // 6 + 12, then 18 + 24 on the second connection
        assert_eq!(secs, vec![0, 18, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relist_is_delivered_as_snapshot() {
        let mut updates = Vec::new();
        let mut connections: Vec<Vec<Item>> = vec![vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(pod("a"))),
            Ok(watcher::Event::InitApply(pod("b"))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Apply(pod("c"))),
            Ok(watcher::Event::Delete(pod("a"))),
        ]];

        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            run_watch(
                "Pod",
                "/api/v1/pods",
                || futures::stream::iter(connections.pop().unwrap_or_default()),
                |update: WatchUpdate<Pod>| updates.push(update),
            ),
        )
        .await;

        assert_eq!(
            updates,
            vec![
                WatchUpdate::Resynced(vec![pod("a"), pod("b")]),
                WatchUpdate::Event(EventType::Modified, pod("c")),
                WatchUpdate::Event(EventType::Deleted, pod("a")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_failure_sleeps_pause() {
        let start = tokio::time::Instant::now();
        report_failure("GET /api/v1/pods", &"boom", 2).await;
        assert_eq!(start.elapsed(), Duration::from_secs(12));
    }
}
