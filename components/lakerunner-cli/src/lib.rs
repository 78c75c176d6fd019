pub mod cli;
pub mod client;
pub mod helpers;
pub mod instrumentation;
pub mod query;
pub mod render;
pub mod runtime;
pub mod stream;
