//! Transport-wide congestion control feedback.
//!
//! <https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01>
//!
//! The sending side numbers every outgoing RTP packet of the session with one
//! shared counter, carried in the transport-cc header extension. The receiving
//! side notes when each number arrived and periodically answers with
//! `TransportLayerCc` packets, from which the sender estimates bandwidth.
//!
//! - [`sender::TwccSenderInterceptor`]: stamps the header extension.
//! - [`receiver::TwccReceiverInterceptor`]: records arrivals, writes feedback.
//!
//! # Example
//!
//! ```ignore
//! use rtc_feedback::{Registry, TwccReceiverBuilder, TwccSenderBuilder};
//! use std::time::Duration;
//!
//! let registry = Registry::new()
//!     .with(Box::new(TwccSenderBuilder::new()))
//!     .with(Box::new(
//!         TwccReceiverBuilder::new().with_interval(Duration::from_millis(100)),
//!     ));
//! ```

use crate::stream_info::StreamInfo;

pub(crate) mod arrival_time_map;
pub mod receiver;
pub(crate) mod recorder;
pub mod sender;

/// The URI for the transport-wide CC RTP header extension.
pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Negotiated header extension id of the transport-wide CC extension.
pub(crate) fn stream_supports_twcc(info: &StreamInfo) -> Option<u8> {
    info.header_extension_id(TRANSPORT_CC_URI)
}
