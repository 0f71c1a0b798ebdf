//! Job capability and the header-carried retry budget.

use crate::error::QueueError;
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, ShortString};

/// Header holding how many times a message has already been requeued.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Work done for each delivered message.
///
/// Return `Ok(())` to acknowledge the message. Any error spends one unit of
/// the message's retry budget.
///
/// # Example
///
/// ```rust,ignore
/// struct LogJob;
///
/// #[async_trait]
/// impl JobProcessor for LogJob {
///     async fn process(&self, message_id: &str, body: &[u8]) -> Result<(), QueueError> {
///         tracing::info!(message_id, len = body.len(), "Got message");
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "LogJob"
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, message_id: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Processor name for logs and metric labels.
    fn name(&self) -> &'static str {
        "job"
    }
}

/// Number of times a message has been requeued after a failed job.
///
/// Defaults to 0 when the header is absent or not a non-negative integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RetryCount(u32);

impl RetryCount {
    /// Requeues allowed before a failing message is dropped.
    pub const MAX: RetryCount = RetryCount(3);

    pub fn new(count: u32) -> Self {
        Self(count)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn from_headers(headers: Option<&FieldTable>) -> Self {
        headers
            .and_then(|table| {
                table
                    .inner()
                    .iter()
                    .find(|(key, _)| key.as_str() == RETRY_COUNT_HEADER)
                    .map(|(_, value)| value)
            })
            .and_then(header_as_u32)
            .map(Self)
            .unwrap_or_default()
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_exhausted(self) -> bool {
        self >= Self::MAX
    }

    /// Copy `headers` with the retry header set to this count.
    pub fn apply_to(self, headers: Option<&FieldTable>) -> FieldTable {
        let mut table = headers.cloned().unwrap_or_default();
        let value = i32::try_from(self.0).unwrap_or(i32::MAX);
        table.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongInt(value),
        );
        table
    }
}

impl std::fmt::Display for RetryCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn header_as_u32(value: &AMQPValue) -> Option<u32> {
    let wide: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };
    u32::try_from(wide).ok()
}

/// What to do with a delivery once its job has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Put the message back with the given (already incremented) count.
    Requeue(RetryCount),
    /// Drop the message for good.
    Reject,
}

impl Settlement {
    pub fn for_outcome(outcome: &Result<(), QueueError>, retry: RetryCount) -> Self {
        match outcome {
            Ok(()) => Settlement::Ack,
            Err(_) if retry.is_exhausted() => Settlement::Reject,
            Err(_) => Settlement::Requeue(retry.next()),
        }
    }
}
