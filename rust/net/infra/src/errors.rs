//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt::Display;

use crate::dns::DnsError;

pub trait LogSafeDisplay: Display {
    /// Assert that this type implements `LogSafeDisplay`
    fn log_safe_display(&self) -> &Self
    where
        Self: Sized,
    {
        self
    }
}

/// Vacuous implementation since you can't actually [`Display::fmt`] a
/// [`std::convert::Infallible`].
impl LogSafeDisplay for std::convert::Infallible {}

/// Reason a TLS handshake did not complete.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum TlsFailure {
    /// the peer rejected the handshake
    Rejected,
    /// no mutually supported protocol version
    ProtocolVersion,
    /// the peer certificate chain could not be verified
    Certificate,
    /// I/O error during the handshake: {0:?}
    Io(std::io::ErrorKind),
}

impl TlsFailure {
    /// Whether trying again with a different [`ConnectionSpec`] could succeed.
    ///
    /// [`ConnectionSpec`]: crate::tls::ConnectionSpec
    pub fn allows_spec_fallback(&self) -> bool {
        match self {
            TlsFailure::Rejected | TlsFailure::ProtocolVersion => true,
            TlsFailure::Io(kind) => matches!(
                kind,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof
            ),
            TlsFailure::Certificate => false,
        }
    }
}

impl LogSafeDisplay for TlsFailure {}

/// Errors that can occur during transport-level connection establishment.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum TransportConnectError {
    /// Failed to establish TCP connection: {0:?}
    TcpConnectionFailed(std::io::ErrorKind),
    /// TLS handshake failed: {0}
    TlsHandshakeFailed(TlsFailure),
    /// Certificate pinning failure
    CertificatePinningFailure,
    /// Peer certificate is not valid for the requested host
    HostnameMismatch,
    /// Invalid configuration for this connection: {0}
    InvalidConfiguration(&'static str),
    /// DNS failure: {0}
    Dns(DnsError),
    /// No routes left to try
    NoRoutes,
    /// Connection attempt was cancelled
    Cancelled,
    /// Connection attempt timed out
    TimedOut,
}
impl LogSafeDisplay for TransportConnectError {}

impl From<DnsError> for TransportConnectError {
    fn from(value: DnsError) -> Self {
        Self::Dns(value)
    }
}

impl TransportConnectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a different route to the same address might succeed.
    ///
    /// Certificate problems and configuration errors will recur on every
    /// route, so there's no point in trying more of them.
    pub fn is_route_specific(&self) -> bool {
        match self {
            Self::TcpConnectionFailed(_)
            | Self::Dns(_)
            | Self::TimedOut
            | Self::TlsHandshakeFailed(TlsFailure::Rejected | TlsFailure::Io(_))
            | Self::TlsHandshakeFailed(TlsFailure::ProtocolVersion) => true,
            Self::TlsHandshakeFailed(TlsFailure::Certificate)
            | Self::CertificatePinningFailure
            | Self::HostnameMismatch
            | Self::InvalidConfiguration(_)
            | Self::NoRoutes
            | Self::Cancelled => false,
        }
    }
}

/// The failure of a whole connection search.
///
/// `error` is the most recent failure; failures of candidates tried before it
/// are kept, oldest first, in `suppressed`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub struct ConnectError {
    pub error: TransportConnectError,
    pub suppressed: Vec<TransportConnectError>,
}

impl ConnectError {
    pub fn new(error: TransportConnectError) -> Self {
        Self {
            error,
            suppressed: Vec::new(),
        }
    }

    /// Folds `error` into an existing aggregate, making it the surfaced one.
    pub fn record(previous: Option<Self>, error: TransportConnectError) -> Self {
        match previous {
            None => Self::new(error),
            Some(Self {
                error: prior,
                mut suppressed,
            }) => {
                suppressed.push(prior);
                Self { error, suppressed }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }
}

impl From<TransportConnectError> for ConnectError {
    fn from(value: TransportConnectError) -> Self {
        Self::new(value)
    }
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)?;
        match self.suppressed.len() {
            0 => Ok(()),
            1 => write!(f, " (after 1 earlier failure)"),
            n => write!(f, " (after {n} earlier failures)"),
        }
    }
}
impl LogSafeDisplay for ConnectError {}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn record_keeps_latest_and_suppresses_earlier() {
        let refused = TransportConnectError::TcpConnectionFailed(std::io::ErrorKind::ConnectionRefused);
        let error = ConnectError::record(None, refused.clone());
        let error = ConnectError::record(Some(error), TransportConnectError::TimedOut);

        assert_eq!(
            error,
            ConnectError {
                error: TransportConnectError::TimedOut,
                suppressed: vec![refused],
            }
        );
        assert_eq!(
            error.to_string(),
            "Connection attempt timed out (after 1 earlier failure)"
        );
    }

    #[test]
    fn only_tls_negotiation_failures_allow_spec_fallback() {
        assert!(TlsFailure::Rejected.allows_spec_fallback());
        assert!(TlsFailure::Io(std::io::ErrorKind::UnexpectedEof).allows_spec_fallback());
        assert!(!TlsFailure::Certificate.allows_spec_fallback());
        assert!(!TlsFailure::Io(std::io::ErrorKind::TimedOut).allows_spec_fallback());
    }
}
