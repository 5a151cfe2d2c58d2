//! Congestion Control Feedback (RFC 8888)
//!
//! <https://datatracker.ietf.org/doc/html/rfc8888>
//!
//! The receiver logs arrival time and ECN marking of every RTP packet of
//! streams that negotiated `a=rtcp-fb:<pt> ack ccfb` and periodically
//! reports them to the sender:
//!
//! - [`interceptor::CcfbReceiverInterceptor`]: records arrivals and writes
//!   [`report::CcFeedbackReport`] packets.
//!
//! # Example
//!
//! ```ignore
//! use rtc_feedback::{CcfbReceiverBuilder, Registry};
//!
//! let registry = Registry::new().with(Box::new(CcfbReceiverBuilder::new()));
//! ```

use crate::stream_info::StreamInfo;

pub mod interceptor;
pub(crate) mod recorder;
pub mod report;
pub(crate) mod stream_log;

/// Reports whether the remote peer negotiated congestion control feedback.
pub(crate) fn stream_supports_ccfb(info: &StreamInfo) -> bool {
    info.has_feedback("ack", "ccfb")
}
