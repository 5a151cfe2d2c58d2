use crate::attributes::Attributes;

/// RTP header extension as negotiated via SDP (RFC 5285).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTPHeaderExtension {
    /// URI identifying the extension type (e.g., "urn:ietf:params:rtp-hdrext:ssrc-audio-level")
    pub uri: String,
    /// Local identifier (1-14) used in RTP packets to reference this extension
    pub id: u16,
}

/// Association between an auxiliary stream (RTX, FEC, ...) and its primary stream.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct AssociatedStreamInfo {
    pub ssrc: u32,
    pub payload_type: u8,
}

/// RTCP feedback mechanism negotiated for the stream.
///
/// See: <https://draft.ortc.org/#dom-rtcrtcpfeedback>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCPFeedback {
    /// Type of feedback mechanism.
    ///
    /// Valid values: "ack", "ccm", "nack", "goog-remb", "transport-cc"
    pub typ: String,

    /// Parameter value that depends on the feedback type.
    ///
    /// For example, `typ="nack"` with `parameter="pli"` enables Picture Loss Indicator packets,
    /// `typ="ack"` with `parameter="ccfb"` enables RFC 8888 congestion control feedback.
    pub parameter: String,
}

/// Stream context passed to interceptor bind/unbind callbacks.
///
/// Immutable for the lifetime of the binding: created when a stream is bound
/// and dropped when it is unbound.
#[derive(Default, Debug, Clone)]
pub struct StreamInfo {
    /// Unique identifier for the stream
    pub id: String,
    /// Arbitrary metadata attached by the application
    pub attributes: Attributes,
    /// Synchronization Source identifier (SSRC) of the stream
    pub ssrc: u32,
    /// SSRC used for RFC 4588 retransmissions, if negotiated
    pub ssrc_rtx: Option<u32>,
    /// RTP payload type (e.g., 96 for VP8, 111 for Opus)
    pub payload_type: u8,
    /// Payload type used for RFC 4588 retransmissions, if negotiated
    pub payload_type_rtx: Option<u8>,
    /// Negotiated RTP header extensions for this stream
    pub rtp_header_extensions: Vec<RTPHeaderExtension>,
    /// MIME type of the codec (e.g., "video/VP8", "audio/opus")
    pub mime_type: String,
    /// Clock rate in Hz (e.g., 90000 for video, 48000 for audio), 0 if unknown
    pub clock_rate: u32,
    /// Number of audio channels (0 for video)
    pub channels: u16,
    /// Format-specific parameters from SDP (fmtp line)
    pub sdp_fmtp_line: String,
    /// RTCP feedback mechanisms negotiated for this stream
    pub rtcp_feedback: Vec<RTCPFeedback>,
    pub associated_stream: Option<AssociatedStreamInfo>,
}

impl StreamInfo {
    /// Reports whether the remote peer negotiated feedback `typ` with `parameter`.
    pub fn has_feedback(&self, typ: &str, parameter: &str) -> bool {
        self.rtcp_feedback
            .iter()
            .any(|fb| fb.typ == typ && fb.parameter == parameter)
    }

    /// Local id of the header extension with the given URI.
    pub fn header_extension_id(&self, uri: &str) -> Option<u8> {
        self.rtp_header_extensions
            .iter()
            .find(|ext| ext.uri == uri)
            .and_then(|ext| u8::try_from(ext.id).ok())
    }
}
