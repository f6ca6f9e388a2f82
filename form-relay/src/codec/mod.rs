pub mod json;

use crate::types::QueueMessage;
use crate::QueueResult;

/// Wire codec for queue messages
pub trait MessageCodec: Send + Sync {
    /// Encode a message into a broker body
    fn encode(&self, message: &QueueMessage) -> QueueResult<Vec<u8>>;

    /// Decode a broker body. Bodies that cannot be decoded yield
    /// `QueueError::MalformedMessage`.
    fn decode(&self, body: &[u8]) -> QueueResult<QueueMessage>;

    /// MIME type advertised in the publish properties
    fn content_type(&self) -> &'static str;
}
