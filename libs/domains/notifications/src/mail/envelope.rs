//! Queue body for an outbound email.

use crate::error::NotificationResult;
use serde::{Deserialize, Serialize};

/// A rendered email and its recipient, as carried on the queue.
///
/// On the wire the raw message bytes are a base64 string:
/// `{"recipient":"a@example.com","email":"<base64>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailEnvelope {
    pub recipient: String,
    #[serde(with = "base64_bytes")]
    pub email: Vec<u8>,
}

impl MailEnvelope {
    pub fn new(recipient: impl Into<String>, email: Vec<u8>) -> Self {
        Self {
            recipient: recipient.into(),
            email,
        }
    }

    pub fn to_json(&self) -> NotificationResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(body: &[u8]) -> NotificationResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}
