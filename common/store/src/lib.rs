pub mod error;
pub mod events;
pub mod summaries;

pub use error::StoreError;
