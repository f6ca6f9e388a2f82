pub mod ids;
pub mod message;
pub mod record;
pub mod payload;
pub mod priority;
pub mod events;

pub use ids::{JobId, MessageId, DeliveryTag};
pub use message::QueueMessage;
pub use record::{JobRecord, JobStatus};
pub use payload::{Payload, FieldValue};
pub use priority::JobPriority;
pub use events::JobEvent;
