use crate::codec::MessageCodec;
use crate::types::QueueMessage;
use crate::{QueueError, QueueResult};

/// JSON codec; timestamps are RFC 3339 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &QueueMessage) -> QueueResult<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| {
            QueueError::Serialization(format!("row {}: {}", message.row_id(), e))
        })
    }

    fn decode(&self, body: &[u8]) -> QueueResult<QueueMessage> {
        serde_json::from_slice(body).map_err(|e| QueueError::MalformedMessage(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
