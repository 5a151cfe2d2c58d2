use std::fmt;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Buffer size is not one of the supported powers of two.
    #[error("invalid size")]
    InvalidSize,
    /// An attribute slot already holds a value of a different type.
    #[error("invalid header type")]
    InvalidHeaderType,
    #[error("sdp media description is missing the ssrc attribute")]
    MissingSsrc,
    #[error("no ecn control message")]
    NoEcn,
    #[error("clock rate must be greater than zero")]
    ErrInvalidClockRate,
    #[error("io: read/write on closed pipe")]
    ErrClosedPipe,
    #[error("buffer: short")]
    ErrShortBuffer,
    #[error("packet status chunk must be 2 bytes")]
    ErrPacketStatusChunkLength,
    #[error("wrong packet type")]
    ErrWrongType,
    #[error("packet too short")]
    ErrPacketTooShort,

    #[error("{0}")]
    Io(#[source] IoError),
    #[error("rtp: {0}")]
    Rtp(String),
    #[error("rtcp: {0}")]
    Rtcp(String),
    #[error("util: {0}")]
    Util(String),
    #[error("sdp: {0}")]
    Sdp(String),
    #[error("{0}")]
    Multi(MultiError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<rtp::Error> for Error {
    fn from(e: rtp::Error) -> Self {
        Error::Rtp(e.to_string())
    }
}

impl From<rtcp::Error> for Error {
    fn from(e: rtcp::Error) -> Self {
        Error::Rtcp(e.to_string())
    }
}

impl From<util::Error> for Error {
    fn from(e: util::Error) -> Self {
        Error::Util(e.to_string())
    }
}

impl From<sdp::Error> for Error {
    fn from(e: sdp::Error) -> Self {
        Error::Sdp(e.to_string())
    }
}

impl From<Error> for util::Error {
    fn from(e: Error) -> Self {
        util::Error::Other(e.to_string())
    }
}

/// An ordered, flat collection of errors.
///
/// Nested multi-errors are flattened on construction, so membership checks
/// with [`MultiError::contains`] see every leaf error.
#[derive(Debug, Default, PartialEq)]
pub struct MultiError(Vec<Error>);

impl MultiError {
    pub fn new(errs: Vec<Error>) -> Self {
        let mut flat = Vec::with_capacity(errs.len());
        for err in errs {
            match err {
                Error::Multi(MultiError(inner)) => flat.extend(MultiError::new(inner).0),
                e => flat.push(e),
            }
        }
        MultiError(flat)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// Reports whether `err` is one of the flattened errors.
    pub fn contains(&self, err: &Error) -> bool {
        self.0.iter().any(|e| e == err)
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// flatten_errs flattens multiple results into one, skipping `Ok` entries.
pub fn flatten_errs(results: Vec<Result<()>>) -> Result<()> {
    let errs: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    if errs.is_empty() {
        return Ok(());
    }

    let multi = MultiError::new(errs);
    if multi.is_empty() {
        Ok(())
    } else {
        Err(Error::Multi(multi))
    }
}
