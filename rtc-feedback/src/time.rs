//! NTP timestamp helpers used by sender/receiver reports and CCFB.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Offset in seconds between the unix epoch and the ntp epoch (1900-01-01).
const NTP_EPOCH_OFFSET: u64 = 0x83AA7E80;

/// Converts a duration since the unix epoch into a 64-bit NTP timestamp.
///
/// The upper 32 bits carry seconds since 1900, the lower 32 bits the
/// fractional second as a fixed point value.
pub fn unix2ntp(duration_since_unix_epoch: Duration) -> u64 {
    let u = duration_since_unix_epoch.as_nanos() as u64;

    let mut s = u / 1_000_000_000;
    s += NTP_EPOCH_OFFSET;
    let mut f = u % 1_000_000_000;
    f <<= 32;
    f /= 1_000_000_000;
    s <<= 32;

    s | f
}

/// Converts a 64-bit NTP timestamp back into a duration since the unix epoch.
///
/// Timestamps earlier than the unix epoch saturate to zero.
pub fn ntp2unix(ntp: u64) -> Duration {
    let s = (ntp >> 32).saturating_sub(NTP_EPOCH_OFFSET);
    let mut f = ntp & 0xFFFF_FFFF;
    f *= 1_000_000_000;
    f >>= 32;

    Duration::new(s, f as u32)
}

/// NTP timestamp of a wall-clock instant.
pub fn ntp_time(t: SystemTime) -> u64 {
    unix2ntp(
        t.duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0)),
    )
}

/// Middle 32 bits of an NTP timestamp: low 16 bits of the seconds and high 16
/// bits of the fraction. This is the compact form used by `LSR` fields and
/// CCFB report timestamps.
pub fn ntp_middle32(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// Converts a duration to the 1/65536 second units of the RR `DLSR` field.
pub(crate) fn duration_to_q16(d: Duration) -> u32 {
    ((d.as_nanos() << 16) / 1_000_000_000) as u32
}
