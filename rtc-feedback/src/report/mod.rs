//! RTCP Report Interceptors
//!
//! This module provides interceptors for handling RTCP reports:
//!
//! - [`receiver::ReceiverReportInterceptor`]: Generates RTCP Receiver Reports
//!   based on incoming RTP packet statistics.
//! - [`sender::SenderReportInterceptor`]: Generates RTCP Sender Reports for
//!   outgoing streams.
//!
//! Both need the clock rate of a stream. It is looked up in the optional
//! [`MediaDescriptionRegistry`] first, then taken from
//! [`StreamInfo::clock_rate`]. Streams with neither are not reported on.
//!
//! # Example
//!
//! ```ignore
//! use rtc_feedback::{Registry, ReceiverReportBuilder, SenderReportBuilder};
//!
//! let registry = Registry::new()
//!     .with(Box::new(SenderReportBuilder::new()))
//!     .with(Box::new(ReceiverReportBuilder::new()));
//! ```

use crate::media_description::MediaDescriptionRegistry;
use crate::stream_info::StreamInfo;

pub mod receiver;
pub(crate) mod receiver_stream;
pub mod sender;
pub(crate) mod sender_stream;

fn clock_rate(registry: Option<&MediaDescriptionRegistry>, info: &StreamInfo) -> u32 {
    registry
        .and_then(|r| r.clock_rate(info.ssrc, info.payload_type))
        .unwrap_or(info.clock_rate)
}
