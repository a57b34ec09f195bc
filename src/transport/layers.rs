mod compression;
mod json;

pub use compression::{CompressionLayer, CompressionService};
pub use json::{JsonLayer, JsonService};
