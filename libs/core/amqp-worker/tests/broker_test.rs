//! Producer/consumer round trips against a real RabbitMQ container.
//!
//! Run with `cargo test -p amqp-worker -- --ignored` (needs Docker).

use amqp_worker::{BrokerClient, Consumer, JobProcessor, Producer, QueueConfig, QueueError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use test_utils::TestRabbitMq;
use tokio::sync::{Mutex, watch};

/// Fails the first `failures` calls per message id, recording every call.
struct FlakyJob {
    failures: u32,
    calls: Mutex<Vec<(String, Vec<u8>)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    done: Arc<AtomicU32>,
}

impl FlakyJob {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            done: Arc::new(AtomicU32::new(0)),
        }
    }

    async fn calls_for(&self, message_id: &str) -> u32 {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == message_id)
            .count() as u32
    }
}

#[async_trait]
impl JobProcessor for FlakyJob {
    async fn process(&self, message_id: &str, body: &[u8]) -> Result<(), QueueError> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let previous = {
            let mut calls = self.calls.lock().await;
            let previous = calls.iter().filter(|(id, _)| id == message_id).count() as u32;
            calls.push((message_id.to_string(), body.to_vec()));
            previous
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);

        if previous < self.failures {
            Err(QueueError::job("not yet"))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        "FlakyJob"
    }
}

const BODY: &[u8] = br#"{"recipient":"a@example.com","email":"aGk="}"#;

fn config(uri: &str, queue: &str) -> QueueConfig {
    QueueConfig::new(uri, queue)
        .with_connect_timeout(Duration::from_secs(10))
        .with_connect_retry_delay(Duration::from_millis(500))
}

async fn wait_for(counter: &AtomicU32, target: u32) {
    tokio::time::timeout(Duration::from_secs(20), async {
        while counter.load(Ordering::SeqCst) < target {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("timed out waiting for job invocations");
}

/// Publish `bodies`, consume with `job` until `expected_calls`, then shut down.
async fn run_pipeline(uri: &str, queue: &str, job: Arc<FlakyJob>, bodies: Vec<Vec<u8>>, expected_calls: u32) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (producer, publisher) = Producer::new(config(uri, queue));
    let producer_task = tokio::spawn(producer.run(shutdown_rx.clone()));

    let consumer_job = job.clone();
    let consumer_shutdown = shutdown_rx.clone();
    let consumer_config = config(uri, queue);
    let consumer_task = tokio::spawn(async move {
        let mut consumer = Consumer::new(consumer_config);
        consumer
            .execute_job_on_messages(consumer_job.as_ref(), consumer_shutdown)
            .await
    });

    for body in bodies {
        publisher.publish(body).await.unwrap();
    }

    wait_for(&job.done, expected_calls).await;
    // Let a stray extra delivery show up if the budget were broken.
    tokio::time::sleep(Duration::from_millis(500)).await;

    shutdown_tx.send(true).unwrap();
    assert!(producer_task.await.unwrap().unwrap_err().is_shutdown());
    assert!(consumer_task.await.unwrap().unwrap_err().is_shutdown());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_successful_job_runs_once() {
    let rabbit = TestRabbitMq::new().await;
    let job = Arc::new(FlakyJob::new(0));

    run_pipeline(rabbit.uri(), "emails-ok", job.clone(), vec![BODY.to_vec()], 1).await;

    let calls = job.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].0.is_empty(), "producer assigns a message id");
    assert_eq!(calls[0].1, BODY.to_vec());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_always_failing_job_runs_four_times() {
    let rabbit = TestRabbitMq::new().await;
    let job = Arc::new(FlakyJob::new(u32::MAX));

    run_pipeline(rabbit.uri(), "emails-poison", job.clone(), vec![b"{}".to_vec()], 4).await;

    let calls = job.calls.lock().await;
    assert_eq!(calls.len(), 4);
    // Requeues keep the message id
    assert!(calls.iter().all(|(id, _)| id == &calls[0].0));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_retry_budgets_are_per_message() {
    let rabbit = TestRabbitMq::new().await;
    // Each message fails twice, then succeeds: 3 calls each
    let job = Arc::new(FlakyJob::new(2));

    run_pipeline(rabbit.uri(), "emails-flaky", job.clone(), vec![b"1".to_vec(), b"2".to_vec()], 6).await;

    let ids: Vec<String> = {
        let calls = job.calls.lock().await;
        let mut ids: Vec<String> = calls.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    };
    assert_eq!(ids.len(), 2);
    for id in &ids {
        assert_eq!(job.calls_for(id).await, 3);
    }
    assert_eq!(job.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reset_channel_closes_it_on_the_live_connection() {
    let rabbit = TestRabbitMq::new().await;
    let mut client = BrokerClient::new(config(rabbit.uri(), "emails-reset"));

    let old = client.connect_if_needed().await.unwrap().clone();
    assert!(old.status().connected());

    client.reset_channel().await;
    assert!(!old.status().connected());
    assert!(!client.is_connected());

    let fresh = client.connect_if_needed().await.unwrap();
    assert!(fresh.status().connected());
    assert!(!old.status().connected());

    client.close().await;
}
