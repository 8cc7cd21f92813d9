pub mod checksum;
pub mod client;
pub mod format;
pub mod parse;
pub mod sanitize;
pub mod timestamp;
pub mod types;

pub use client::SipClient;
pub use format::{HoldMode, InfoSummary, SecurityMarker};
pub use types::Response;
