use async_trait::async_trait;
use common_store::events::Event;

use crate::api::IngestError;

pub mod kafka;
pub mod print;

#[async_trait]
pub trait EventSink {
    async fn send(&self, event: Event) -> Result<(), IngestError>;

    /// One outcome per event, in submission order. A failed publish never
    /// hides the neighbours that went through.
    async fn send_batch(&self, events: Vec<Event>) -> Vec<Result<(), IngestError>>;
}
