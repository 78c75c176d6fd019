pub mod decoder;
pub mod models;

pub use decoder::{DecodeError, DecodeResult, EventStream, StreamDecoder};
pub use models::{FieldValue, LogsEvent};
