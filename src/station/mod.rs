pub mod client;
pub mod decoder;

pub use client::{HttpTransport, Transport};
pub use decoder::decode;
