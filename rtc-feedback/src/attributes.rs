//! Per-packet side channel passed alongside every packet through a chain.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Buf;
use util::marshal::Unmarshal;

use crate::error::{Error, Result};

/// Key under which a parsed RTP header is memoized.
pub const ATTR_RTP_HEADER_KEY: usize = usize::MAX;
/// Key under which a parsed RTCP header is memoized.
pub const ATTR_RTCP_HEADER_KEY: usize = usize::MAX - 1;
/// Key under which the transport stores the ECN bits of a datagram.
pub const ATTR_ECN_KEY: usize = usize::MAX - 2;

/// Explicit Congestion Notification code point from the IP header.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Ecn {
    #[default]
    NotEct = 0b00,
    Ect1 = 0b01,
    Ect0 = 0b10,
    Ce = 0b11,
}

impl From<u8> for Ecn {
    fn from(v: u8) -> Self {
        match v & 0b11 {
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            0b11 => Ecn::Ce,
            _ => Ecn::NotEct,
        }
    }
}

/// Attributes are a generic key/value store used by interceptors.
///
/// Values are type-erased. The same packet traversal may reuse a value
/// stored by an earlier stage, e.g. a header parsed once by the first stage
/// that needed it.
#[derive(Default, Clone)]
pub struct Attributes {
    values: HashMap<usize, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&usize> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Attributes").field("keys", &keys).finish()
    }
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: usize, value: T) {
        self.values.insert(key, Arc::new(value));
    }

    /// Returns the value stored under `key` if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: usize) -> Option<Arc<T>> {
        self.values
            .get(&key)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    pub fn contains_key(&self, key: usize) -> bool {
        self.values.contains_key(&key)
    }

    pub fn remove(&mut self, key: usize) -> bool {
        self.values.remove(&key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns the RTP header of `raw`, parsing it on first use.
    ///
    /// Fails with [`Error::InvalidHeaderType`] when the header slot already
    /// holds a value of another type.
    pub fn get_rtp_header(&mut self, raw: &[u8]) -> Result<Arc<rtp::header::Header>> {
        self.memoized(ATTR_RTP_HEADER_KEY, raw, |buf| {
            Ok(rtp::header::Header::unmarshal(buf)?)
        })
    }

    /// Returns the RTCP header of `raw`, parsing it on first use.
    pub fn get_rtcp_header(&mut self, raw: &[u8]) -> Result<Arc<rtcp::header::Header>> {
        self.memoized(ATTR_RTCP_HEADER_KEY, raw, |buf| {
            Ok(rtcp::header::Header::unmarshal(buf)?)
        })
    }

    pub fn set_ecn(&mut self, ecn: Ecn) {
        self.insert(ATTR_ECN_KEY, ecn);
    }

    /// ECN code point recorded by the transport for this packet.
    pub fn get_ecn(&self) -> Result<Ecn> {
        self.get::<Ecn>(ATTR_ECN_KEY)
            .map(|ecn| *ecn)
            .ok_or(Error::NoEcn)
    }

    fn memoized<T, F>(&mut self, key: usize, raw: &[u8], parse: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&mut &[u8]) -> Result<T>,
    {
        if let Some(v) = self.values.get(&key) {
            return Arc::clone(v)
                .downcast::<T>()
                .map_err(|_| Error::InvalidHeaderType);
        }

        let mut buf = raw;
        if !buf.has_remaining() {
            return Err(Error::ErrShortBuffer);
        }
        let parsed = Arc::new(parse(&mut buf)?);
        self.values
            .insert(key, Arc::clone(&parsed) as Arc<dyn Any + Send + Sync>);
        Ok(parsed)
    }
}
