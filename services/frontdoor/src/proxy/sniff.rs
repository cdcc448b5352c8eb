//! Protocol detection from the first bytes of a connection.
//!
//! A TLS connection always starts with a record header whose content type is
//! `0x16` (handshake). Anything else is treated as plaintext HTTP.
//!
//! The sniffer is a small state machine over the bytes seen so far. Today it
//! decides after one byte; new protocols only need new states, the peeking
//! wrapper replays whatever was examined regardless of its length.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// TLS record content type for handshake messages.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Upper bound on bytes the sniffer may examine before it must decide.
pub const MAX_SNIFF_BYTES: usize = 1;

/// How an accepted connection is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Raw HTTP/1.x.
    Plaintext,
    /// TLS, terminated locally.
    Tls,
}

impl Classification {
    /// Classify from the first byte of the stream.
    pub fn from_first_byte(byte: u8) -> Self {
        if byte == TLS_HANDSHAKE_RECORD {
            Self::Tls
        } else {
            Self::Plaintext
        }
    }

    /// URI scheme to present downstream.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Plaintext => "http",
            Self::Tls => "https",
        }
    }

    /// Inverse of [`Classification::scheme`].
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Plaintext),
            "https" => Some(Self::Tls),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Sniffer progress after feeding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffState {
    /// More bytes are needed.
    NeedMore,
    /// Classification is final.
    Done(Classification),
}

/// Incremental protocol sniffer.
#[derive(Debug, Default, Clone)]
pub struct ProtocolSniffer {
    examined: usize,
    tentative: Option<Classification>,
}

impl ProtocolSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes examined so far.
    pub fn examined(&self) -> usize {
        self.examined
    }

    /// Current state without feeding anything.
    pub fn state(&self) -> SniffState {
        match self.tentative {
            Some(classification) if self.examined >= MAX_SNIFF_BYTES => {
                SniffState::Done(classification)
            }
            _ => SniffState::NeedMore,
        }
    }

    /// Feed the next bytes of the stream.
    ///
    /// Bytes past the point of decision are not examined; the caller only
    /// needs to have read `examined()` bytes.
    pub fn feed(&mut self, bytes: &[u8]) -> SniffState {
        for &byte in bytes {
            if let SniffState::Done(_) = self.state() {
                break;
            }
            if self.examined == 0 {
                self.tentative = Some(Classification::from_first_byte(byte));
            }
            self.examined += 1;
        }
        self.state()
    }
}

/// Errors from parsing a synthetic local address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// No scheme separator at a plausible offset.
    #[error("local address format error: {0}")]
    Malformed(String),

    /// Separator found but the prefix is not a known scheme.
    #[error("unknown scheme in local address: {0}")]
    UnknownScheme(String),
}

/// Minimum index of the scheme separator (`http` is four bytes).
const MIN_SCHEME_LEN: usize = 4;

/// The "local address" reported for a classified connection:
/// `<scheme>:<bind path>`, e.g. `https:/tmp/frontdoor.sock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyntheticAddress {
    classification: Classification,
    bind_path: PathBuf,
}

impl SyntheticAddress {
    pub fn new(classification: Classification, bind_path: impl AsRef<Path>) -> Self {
        Self {
            classification,
            bind_path: bind_path.as_ref().to_path_buf(),
        }
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn bind_path(&self) -> &Path {
        &self.bind_path
    }
}

impl fmt::Display for SyntheticAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.classification.scheme(),
            self.bind_path.display()
        )
    }
}

impl FromStr for SyntheticAddress {
    type Err = AddressError;

    /// Split at the first colon; the prefix is the scheme.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let index = match s.find(':') {
            Some(index) if index >= MIN_SCHEME_LEN => index,
            _ => return Err(AddressError::Malformed(s.to_string())),
        };

        let classification = Classification::from_scheme(&s[..index])
            .ok_or_else(|| AddressError::UnknownScheme(s.to_string()))?;

        Ok(Self::new(classification, &s[index + 1..]))
    }
}
