pub mod render;

pub use render::{DistinctValues, LogLine, parse_columns, render_columns};
