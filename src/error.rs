use core::fmt;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned by all fallible codec operations.
///
/// Use [`Error::kind`] to tell the broad categories apart; the `Display`
/// impl carries the detailed message.
pub struct Error {
    repr: Repr,
}

pub(crate) enum Repr {
    /// Malformed marker segment: declared-length mismatch, unknown process
    /// tag, out-of-range table key, and similar.
    Header(String),
    /// Huffman table construction failure (over-subscribed code space or a
    /// structurally empty table).
    Table(String),
    /// Scan-assembly protocol violation: unknown component reference,
    /// restart-phase mismatch, out-of-order refinement pass.
    Protocol(String),
    /// The byte source ran out of data permanently.
    UnexpectedEnd,
    Other(String),
}

/// Broad error category. Truncation of a streamed source is not an error
/// at the lexer layer (see `Truncation`); it only surfaces as
/// [`ErrorKind::UnexpectedEnd`] once the source is exhausted for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    Header,
    Table,
    Protocol,
    UnexpectedEnd,
    Other,
}

impl From<String> for Repr {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}
impl<'a> From<&'a str> for Repr {
    fn from(value: &'a str) -> Self {
        Self::Other(value.into())
    }
}

impl Error {
    pub(crate) fn from(e: impl Into<Repr>) -> Self {
        Self { repr: e.into() }
    }

    pub(crate) fn header(msg: impl Into<String>) -> Self {
        Self {
            repr: Repr::Header(msg.into()),
        }
    }

    pub(crate) fn table(msg: impl Into<String>) -> Self {
        Self {
            repr: Repr::Table(msg.into()),
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self {
            repr: Repr::Protocol(msg.into()),
        }
    }

    pub(crate) fn unexpected_end() -> Self {
        Self {
            repr: Repr::UnexpectedEnd,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            Repr::Header(_) => ErrorKind::Header,
            Repr::Table(_) => ErrorKind::Table,
            Repr::Protocol(_) => ErrorKind::Protocol,
            Repr::UnexpectedEnd => ErrorKind::UnexpectedEnd,
            Repr::Other(_) => ErrorKind::Other,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Header(s) | Repr::Table(s) | Repr::Protocol(s) | Repr::Other(s) => s.fmt(f),
            Repr::UnexpectedEnd => f.write_str("reached end of data while decoding JPEG stream"),
        }
    }
}

impl std::error::Error for Error {}
