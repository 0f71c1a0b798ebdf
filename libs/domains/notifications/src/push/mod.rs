//! Reminder pushes to iOS devices.
//!
//! ```text
//! DeviceRepository::notifications ─► PushSender (20 workers) ─► PushClient
//!                                            │ 410 / BadDeviceToken
//!                                            ▼
//!                          BadTokenStore ─► CleanupService ─► ios_devices
//! ```

mod apns;
mod bad_tokens;
mod cleanup;
mod devices;
mod payload;
mod sender;

pub use apns::{ApnsClient, ApnsConfig, PRODUCTION_ENDPOINT, PushClient, PushResponse};
pub use bad_tokens::{BAD_TOKEN_KEY, BadTokenStore, CLEANUP_BATCH_SIZE, RedisBadTokenStore};
pub use cleanup::{BATCH_TIMEOUT, CleanupService};
pub use devices::{ADDED_BEFORE, DeviceRepository, EXPIRING_WITHIN, PostgresDeviceRepository};
pub use payload::{ApnsPayload, NotificationTask};
pub use sender::{PUSH_TIMEOUT, PushSender, WORKER_COUNT};
