mod client;
mod error;
mod transport;
mod types;

pub use client::{CdpClient, CdpConfig};
pub use error::{CdpError, ErrorContext};
pub use transport::{RawEvent, TransportHandle};
pub use types::{CdpEvent, CdpResponse};
