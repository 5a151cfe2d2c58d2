//! Generic NACK loss recovery (RFC 4585, RFC 4588).
//!
//! The receiving side keeps a [`receive_log`] bitmap per remote SSRC and
//! periodically asks for the holes in it with a `TransportLayerNack`. The
//! sending side keeps the last packets of every local stream in a
//! [`send_buffer`] ring and writes them out again when asked.
//!
//! - [`generator::NackGeneratorInterceptor`]: remote streams, emits NACKs.
//! - [`responder::NackResponderInterceptor`]: local streams, answers NACKs,
//!   wrapped in RTX packets when the stream carries `ssrc_rtx` and
//!   `payload_type_rtx`.
//!
//! Only streams that negotiated `a=rtcp-fb:<pt> nack` take part, everything
//! else passes through.
//!
//! # Example
//!
//! ```ignore
//! use rtc_feedback::{NackGeneratorBuilder, NackResponderBuilder, Registry};
//!
//! let registry = Registry::new()
//!     .with(Box::new(NackGeneratorBuilder::new().with_skip_last_n(2)))
//!     .with(Box::new(NackResponderBuilder::new().with_size(1024)));
//! let chain = registry.build("pc-1")?;
//! ```

pub mod generator;
pub(crate) mod receive_log;
pub mod responder;
pub(crate) mod send_buffer;

use crate::stream_info::StreamInfo;

/// Sizes accepted by the receive log.
pub(crate) fn is_valid_size(size: u16) -> bool {
    size.is_power_of_two() && (64..=32768).contains(&size)
}

/// Generic NACK, as opposed to `nack pli`.
pub(crate) fn stream_supports_nack(info: &StreamInfo) -> bool {
    info.has_feedback("nack", "")
}
