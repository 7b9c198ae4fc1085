//! Domain types shared by the engine and its collaborators.

pub mod destination;
pub mod record;
pub mod stream;

pub use destination::{Destination, DestinationQuery};
pub use record::{MessageRef, NotificationRecord, RecordKey, RecordState};
pub use stream::StreamEvent;
