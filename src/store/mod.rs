pub mod content;
pub mod metadata;

pub use content::{ContentFormat, ContentMetadata, ContentPayload, ContentStore};
pub use metadata::{DocumentTxnOutcome, MetadataStore, NewChunk};
