//! Fan-out of reminder pushes over a fixed worker pool.

use super::apns::PushClient;
use super::bad_tokens::BadTokenStore;
use super::devices::DeviceRepository;
use super::payload::NotificationTask;
use crate::error::{NotificationError, NotificationResult};
use crate::metrics::PushMetrics;
use amqp_worker::shutdown::shutdown_requested;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const WORKER_COUNT: usize = 20;

/// Deadline for a single push, token signing included.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

type TaskReceiver = Arc<Mutex<mpsc::Receiver<NotificationTask>>>;

/// Streams reminder tasks from the device query into [`WORKER_COUNT`] workers.
///
/// A run always ends in an error: [`NotificationError::SenderFinished`] once the
/// query is drained, [`NotificationError::Cancelled`] when shutdown stopped it.
#[derive(Clone)]
pub struct PushSender {
    devices: Arc<dyn DeviceRepository>,
    client: Arc<dyn PushClient>,
    bad_tokens: Arc<dyn BadTokenStore>,
    workers: usize,
    push_timeout: Duration,
    metrics: PushMetrics,
}

impl PushSender {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        client: Arc<dyn PushClient>,
        bad_tokens: Arc<dyn BadTokenStore>,
    ) -> Self {
        Self {
            devices,
            client,
            bad_tokens,
            workers: WORKER_COUNT,
            push_timeout: PUSH_TIMEOUT,
            metrics: PushMetrics::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_push_timeout(mut self, push_timeout: Duration) -> Self {
        self.push_timeout = push_timeout;
        self
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> NotificationResult<()> {
        self.metrics.run_started();
        info!(workers = self.workers, "Push sender starting");

        let (tx, rx) = mpsc::channel(self.workers);
        let devices = self.devices.clone();
        let source = tokio::spawn(async move {
            if let Err(e) = devices.notifications(tx).await {
                error!(error = %e, "Notification query failed");
            }
        });

        let rx: TaskReceiver = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for number in 1..=self.workers {
            let sender = self.clone();
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { sender.worker(number, rx, shutdown).await });
        }
        drop(rx);

        let mut cancelled = false;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(stopped_by_shutdown) => cancelled |= stopped_by_shutdown,
                Err(e) => error!(error = %e, "Push worker panicked"),
            }
        }
        source.abort();

        self.metrics.run_finished();
        if cancelled {
            info!("Push sender cancelled");
            Err(NotificationError::Cancelled)
        } else {
            info!("Push sender finished");
            Err(NotificationError::SenderFinished)
        }
    }

    /// Returns true when stopped by shutdown rather than an exhausted source.
    async fn worker(
        &self,
        number: usize,
        rx: TaskReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> bool {
        info!(worker = number, "worker started");
        let stopped = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break true,
                next = async { rx.lock().await.recv().await } => next,
            };
            match next {
                Some(task) => self.deliver(task).await,
                None => break false,
            }
        };
        info!(worker = number, "worker finished");
        stopped
    }

    async fn deliver(&self, task: NotificationTask) {
        let payload = match task.payload().to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.push_failed();
                error!(error = %e, "Failed to encode push payload");
                return;
            }
        };

        let pushed =
            tokio::time::timeout(self.push_timeout, self.client.push(&task.device_token, payload))
                .await;

        match pushed {
            Ok(Ok(response)) if response.is_sent() => {
                self.metrics.push_succeeded();
                debug!(apns_id = ?response.apns_id, "Push sent");
            }
            Ok(Ok(response)) => {
                self.metrics.push_failed();
                warn!(
                    status = response.status,
                    reason = ?response.reason,
                    "Push rejected"
                );
                if response.is_token_inactive() {
                    self.quarantine(&task.device_token).await;
                }
            }
            Ok(Err(e)) => {
                self.metrics.push_failed();
                warn!(error = %e, "Push failed");
            }
            Err(_) => {
                self.metrics.push_failed();
                warn!(timeout = ?self.push_timeout, "Push timed out");
            }
        }
    }

    async fn quarantine(&self, token: &str) {
        match self.bad_tokens.save(token).await {
            Ok(()) => self.metrics.bad_token_saved(),
            Err(e) => warn!(error = %e, "Failed to save bad token"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::apns::{MockPushClient, PushResponse};
    use crate::push::bad_tokens::MockBadTokenStore;
    use crate::push::devices::MockDeviceRepository;
    use async_trait::async_trait;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use uuid::Uuid;

    fn task(token: &str) -> NotificationTask {
        NotificationTask {
            device_token: token.into(),
            expiring_soon_items_count: 2,
            closest_expiring_item_name: "Milk".into(),
        }
    }

    fn devices_with(tasks: Vec<NotificationTask>) -> MockDeviceRepository {
        let mut devices = MockDeviceRepository::new();
        devices.expect_notifications().times(1).returning(move |tx| {
            for task in tasks.clone() {
                tx.try_send(task).unwrap();
            }
            Ok(())
        });
        devices
    }

    fn sender(
        devices: MockDeviceRepository,
        client: impl PushClient + 'static,
        bad_tokens: MockBadTokenStore,
    ) -> PushSender {
        PushSender::new(Arc::new(devices), Arc::new(client), Arc::new(bad_tokens)).with_workers(4)
    }

    #[tokio::test]
    async fn test_all_sent_still_returns_finished() {
        let mut client = MockPushClient::new();
        client
            .expect_push()
            .times(3)
            .returning(|_, _| Ok(PushResponse::sent("id")));
        let mut bad_tokens = MockBadTokenStore::new();
        bad_tokens.expect_save().never();

        let (_tx, rx) = watch::channel(false);
        let err = sender(devices_with(vec![task("a"), task("b"), task("c")]), client, bad_tokens)
            .run(rx)
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::SenderFinished));
    }

    #[tokio::test]
    async fn test_payload_names_closest_item() {
        let mut client = MockPushClient::new();
        client
            .expect_push()
            .withf(|token, payload| {
                let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
                token == "a"
                    && value["aps"]["alert"]["title-loc-args"] == serde_json::json!(["Milk"])
                    && value["aps"]["alert"]["loc-args"] == serde_json::json!(["2"])
            })
            .times(1)
            .returning(|_, _| Ok(PushResponse::sent("id")));

        let (_tx, rx) = watch::channel(false);
        let result = sender(devices_with(vec![task("a")]), client, MockBadTokenStore::new())
            .run(rx)
            .await;
        assert!(result.unwrap_err().is_completion());
    }

    #[tokio::test]
    async fn test_inactive_token_is_saved_once() {
        let mut client = MockPushClient::new();
        client
            .expect_push()
            .returning(|_, _| Ok(PushResponse::rejected(410, "Unregistered")));
        let mut bad_tokens = MockBadTokenStore::new();
        bad_tokens
            .expect_save()
            .withf(|token| token == "gone")
            .times(1)
            .returning(|_| Ok(()));

        let (_tx, rx) = watch::channel(false);
        let err = sender(devices_with(vec![task("gone")]), client, bad_tokens)
            .run(rx)
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::SenderFinished));
    }

    /// Counter value for `name` whose labels include every pair in `labels`.
    fn counter(snapshot: &[(String, Vec<(String, String)>, u64)], name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        snapshot
            .iter()
            .find(|(key, key_labels, _)| {
                key == name
                    && labels
                        .iter()
                        .all(|(k, v)| key_labels.iter().any(|(lk, lv)| lk == k && lv == v))
            })
            .map(|(_, _, value)| *value)
    }

    #[test]
    fn test_inactive_token_counts_as_failure_only() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let mut client = MockPushClient::new();
        client
            .expect_push()
            .times(1)
            .returning(|_, _| Ok(PushResponse::rejected(410, "Unregistered")));
        let mut bad_tokens = MockBadTokenStore::new();
        bad_tokens.expect_save().times(1).returning(|_| Ok(()));
        let sender = sender(devices_with(vec![task("gone")]), client, bad_tokens);

        // The local recorder is per thread, so every task runs on this one.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        let result = metrics::with_local_recorder(&recorder, || runtime.block_on(sender.run(rx)));
        assert!(matches!(result, Err(NotificationError::SenderFinished)));

        let snapshot: Vec<(String, Vec<(String, String)>, u64)> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(count) => Some((
                    key.key().name().to_string(),
                    key.key()
                        .labels()
                        .map(|l| (l.key().to_string(), l.value().to_string()))
                        .collect(),
                    count,
                )),
                _ => None,
            })
            .collect();

        assert_eq!(
            counter(&snapshot, "apns_attempts_total", &[("entity", "apns"), ("result", "fail")]),
            Some(1)
        );
        assert_eq!(
            counter(&snapshot, "apns_attempts_total", &[("result", "success")]),
            None
        );
        assert_eq!(counter(&snapshot, "apns_bad_tokens_saved_total", &[]), Some(1));
    }

    #[tokio::test]
    async fn test_other_rejections_are_not_quarantined() {
        let mut client = MockPushClient::new();
        client.expect_push().returning(|token, _| {
            if token == "bad" {
                Ok(PushResponse::rejected(400, "BadDeviceToken"))
            } else {
                Ok(PushResponse::rejected(400, "BadTopic"))
            }
        });
        let mut bad_tokens = MockBadTokenStore::new();
        bad_tokens
            .expect_save()
            .withf(|token| token == "bad")
            .times(1)
            .returning(|_| Ok(()));

        let (_tx, rx) = watch::channel(false);
        let result = sender(devices_with(vec![task("bad"), task("topic")]), client, bad_tokens)
            .run(rx)
            .await;
        assert!(matches!(result, Err(NotificationError::SenderFinished)));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_stop_run() {
        let mut client = MockPushClient::new();
        client
            .expect_push()
            .times(2)
            .returning(|_, _| Ok(PushResponse::rejected(410, "Unregistered")));
        let mut bad_tokens = MockBadTokenStore::new();
        bad_tokens
            .expect_save()
            .times(2)
            .returning(|_| Err(NotificationError::Store("down".into())));

        let (_tx, rx) = watch::channel(false);
        let result = sender(devices_with(vec![task("a"), task("b")]), client, bad_tokens)
            .run(rx)
            .await;
        assert!(matches!(result, Err(NotificationError::SenderFinished)));
    }

    #[tokio::test]
    async fn test_query_error_ends_run() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_notifications()
            .returning(|_| Err(NotificationError::DatabaseError("gone".into())));
        let mut client = MockPushClient::new();
        client.expect_push().never();

        let (_tx, rx) = watch::channel(false);
        let result = sender(devices, client, MockBadTokenStore::new()).run(rx).await;
        assert!(matches!(result, Err(NotificationError::SenderFinished)));
    }

    struct SlowClient;

    #[async_trait]
    impl PushClient for SlowClient {
        async fn push(&self, _: &str, _: Vec<u8>) -> NotificationResult<PushResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(PushResponse::sent("late"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_timeout_is_a_plain_failure() {
        let mut bad_tokens = MockBadTokenStore::new();
        bad_tokens.expect_save().never();

        let (_tx, rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        let result = sender(devices_with(vec![task("a")]), SlowClient, bad_tokens)
            .run(rx)
            .await;

        assert!(matches!(result, Err(NotificationError::SenderFinished)));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    /// Source that keeps the channel open until the workers go away.
    struct EndlessDevices;

    #[async_trait]
    impl DeviceRepository for EndlessDevices {
        async fn notifications(&self, tx: mpsc::Sender<NotificationTask>) -> NotificationResult<()> {
            tx.closed().await;
            Ok(())
        }

        async fn add_device_token(&self, _: &str, _: Uuid) -> NotificationResult<()> {
            Ok(())
        }

        async fn remove_device_tokens(&self, _: Vec<String>) -> NotificationResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_shutdown_returns_cancelled() {
        let mut client = MockPushClient::new();
        client.expect_push().never();
        let sender = PushSender::new(
            Arc::new(EndlessDevices),
            Arc::new(client),
            Arc::new(MockBadTokenStore::new()),
        );

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { sender.run(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NotificationError::Cancelled)));
    }
}
