//! SSRC to codec clock-rate lookup fed from SDP.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use sdp::description::media::MediaDescription;
use sdp::description::session::SessionDescription;

use crate::error::{Error, Result};

const ATTR_KEY_SSRC: &str = "ssrc";
const ATTR_KEY_RTPMAP: &str = "rtpmap";

/// Codec clock rates of the media section an SSRC was announced in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct MediaEntry {
    kind: String,
    clock_rates: HashMap<u8, u32>,
}

/// MediaDescriptionRegistry maps SSRCs to the media description they were
/// announced in, so report generators can find the clock rate of a
/// (SSRC, payload type) pair.
///
/// Lookups take a shared lock, SDP updates an exclusive one.
#[derive(Debug, Default)]
pub struct MediaDescriptionRegistry {
    entries: RwLock<HashMap<u32, MediaEntry>>,
}

impl MediaDescriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `sdp_text` and records the SSRCs of every active media section.
    ///
    /// Sections with port 0 are skipped. An active audio or video section
    /// without an `a=ssrc` line fails with [`Error::MissingSsrc`] and leaves
    /// the registry untouched.
    pub fn update(&self, sdp_text: &str) -> Result<()> {
        let mut reader = Cursor::new(sdp_text.as_bytes());
        let session = SessionDescription::unmarshal(&mut reader)?;

        let mut parsed = Vec::new();
        for media in &session.media_descriptions {
            if media.media_name.port.value == 0 {
                continue;
            }
            let kind = media.media_name.media.as_str();
            if kind != "audio" && kind != "video" {
                continue;
            }

            let ssrcs = ssrcs_of(media);
            if ssrcs.is_empty() {
                return Err(Error::MissingSsrc);
            }
            let entry = MediaEntry {
                kind: kind.to_owned(),
                clock_rates: clock_rates_of(media),
            };
            parsed.extend(ssrcs.into_iter().map(|ssrc| (ssrc, entry.clone())));
        }

        let mut entries = self.write();
        for (ssrc, entry) in parsed {
            debug!(
                "media description: ssrc={ssrc} {} rates={:?}",
                entry.kind, entry.clock_rates
            );
            entries.insert(ssrc, entry);
        }
        Ok(())
    }

    /// Records a single clock rate without going through SDP.
    pub fn insert(&self, ssrc: u32, payload_type: u8, clock_rate: u32) {
        self.write()
            .entry(ssrc)
            .or_default()
            .clock_rates
            .insert(payload_type, clock_rate);
    }

    /// Clock rate of `payload_type` in the media section that announced `ssrc`.
    pub fn clock_rate(&self, ssrc: u32, payload_type: u8) -> Option<u32> {
        self.read()
            .get(&ssrc)
            .and_then(|entry| entry.clock_rates.get(&payload_type).copied())
    }

    /// Media kind ("audio" or "video") `ssrc` was announced with.
    pub fn kind(&self, ssrc: u32) -> Option<String> {
        self.read()
            .get(&ssrc)
            .map(|entry| entry.kind.clone())
            .filter(|kind| !kind.is_empty())
    }

    pub fn remove(&self, ssrc: u32) {
        self.write().remove(&ssrc);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u32, MediaEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u32, MediaEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// `a=ssrc:<ssrc> <attribute>` lines, deduplicated in order of appearance.
fn ssrcs_of(media: &MediaDescription) -> Vec<u32> {
    let mut ssrcs = Vec::new();
    for attr in &media.attributes {
        if attr.key != ATTR_KEY_SSRC {
            continue;
        }
        let Some(ssrc) = attr
            .value
            .as_deref()
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse::<u32>().ok())
        else {
            continue;
        };
        if !ssrcs.contains(&ssrc) {
            ssrcs.push(ssrc);
        }
    }
    ssrcs
}

/// `a=rtpmap:<pt> <encoding>/<clock rate>[/<channels>]` lines.
fn clock_rates_of(media: &MediaDescription) -> HashMap<u8, u32> {
    let mut rates = HashMap::new();
    for attr in &media.attributes {
        if attr.key != ATTR_KEY_RTPMAP {
            continue;
        }
        let Some(value) = attr.value.as_deref() else {
            continue;
        };
        let mut fields = value.split_whitespace();
        let (Some(pt), Some(encoding)) = (fields.next(), fields.next()) else {
            continue;
        };
        let (Ok(pt), Some(Ok(rate))) = (
            pt.parse::<u8>(),
            encoding.split('/').nth(1).map(str::parse::<u32>),
        ) else {
            continue;
        };
        rates.insert(pt, rate);
    }
    rates
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4596489990601351948 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=ssrc:1111 cname:abc\r\n\
a=ssrc:1111 msid:s v\r\n\
a=ssrc:2222 cname:abc\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=ssrc:3333 cname:abc\r\n";

    #[test]
    fn test_media_description_update_and_lookup() {
        let registry = MediaDescriptionRegistry::new();
        registry.update(OFFER).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.clock_rate(1111, 96), Some(90000));
        assert_eq!(registry.clock_rate(2222, 97), Some(90000));
        assert_eq!(registry.clock_rate(3333, 111), Some(48000));
        assert_eq!(registry.kind(3333).as_deref(), Some("audio"));

        // payload type of another section
        assert_eq!(registry.clock_rate(3333, 96), None);
        assert_eq!(registry.clock_rate(4444, 96), None);

        registry.remove(1111);
        assert_eq!(registry.clock_rate(1111, 96), None);
        assert_eq!(registry.clock_rate(2222, 96), Some(90000));
    }

    #[test]
    fn test_media_description_missing_ssrc() {
        let sdp = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

        let registry = MediaDescriptionRegistry::new();
        assert_eq!(registry.update(sdp), Err(Error::MissingSsrc));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_media_description_rejected_section_skipped() {
        let sdp = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 0 UDP/TLS/RTP/SAVPF 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

        let registry = MediaDescriptionRegistry::new();
        registry.update(sdp).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_media_description_malformed_sdp() {
        let registry = MediaDescriptionRegistry::new();
        assert!(matches!(
            registry.update("not an sdp"),
            Err(Error::Sdp(_))
        ));
    }

    #[test]
    fn test_media_description_insert() {
        let registry = MediaDescriptionRegistry::new();
        registry.insert(5, 96, 90000);
        assert_eq!(registry.clock_rate(5, 96), Some(90000));
        assert_eq!(registry.kind(5), None);
    }
}
