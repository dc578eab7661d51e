use std::fmt;
use std::io;

use thiserror::Error;

/// Extended `x.y.z` delivery status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode(pub u8, pub u8, pub u8);

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// An SMTP rejection as it will be shown to the client. A `code` of 0 means
/// the code is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpError {
    pub code: u16,
    pub enhanced_code: Option<EnhancedCode>,
    pub message: String,
}

impl SmtpError {
    pub fn new(code: u16, enhanced_code: Option<EnhancedCode>, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code,
            message: message.into(),
        }
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.enhanced_code {
            Some(enh) => write!(f, "{} {} {}", self.code, enh, self.message),
            None => write!(f, "{} {}", self.code, self.message),
        }
    }
}

impl std::error::Error for SmtpError {}

/// Failure reported by the upstream client. The variant says how much
/// structure the client could recover from the failure.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The client already built a structured reply.
    #[error(transparent)]
    Structured(SmtpError),

    /// A plain text-protocol reply: three digit code and free text.
    #[error("{code} {message}")]
    Legacy { code: u16, message: String },

    /// Anything else (I/O, TLS, malformed replies).
    #[error(transparent)]
    Opaque(#[from] io::Error),
}

/// Splits a leading `d.d.d ` enhanced status code from `message`.
///
/// When the separators match, the six characters are removed from the
/// message. If any of the three digits fails to parse, the code is dropped as
/// a whole.
pub fn split_enhanced_code(message: &str) -> (Option<EnhancedCode>, &str) {
    let bytes = message.as_bytes();
    if bytes.len() < 6 || bytes[1] != b'.' || bytes[3] != b'.' || bytes[5] != b' ' {
        return (None, message);
    }

    let digit = |b: u8| (b as char).to_digit(10).map(|d| d as u8);
    let code = match (digit(bytes[0]), digit(bytes[2]), digit(bytes[4])) {
        (Some(d0), Some(d1), Some(d2)) => Some(EnhancedCode(d0, d1, d2)),
        _ => None,
    };
    (code, &message[6..])
}

/// Normalizes any upstream failure into an [`SmtpError`].
pub fn translate(err: UpstreamError) -> SmtpError {
    match err {
        UpstreamError::Structured(err) => err,
        UpstreamError::Legacy { code, message } => {
            let (enhanced_code, message) = split_enhanced_code(&message);
            SmtpError::new(code, enhanced_code, message)
        }
        UpstreamError::Opaque(err) => SmtpError::new(0, None, err.to_string()),
    }
}

impl From<UpstreamError> for SmtpError {
    fn from(err: UpstreamError) -> Self {
        translate(err)
    }
}

/// What the backend and sessions hand back to the protocol engine.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("please authenticate first")]
    AuthRequired,

    /// An SMTP-level rejection from upstream, already translated.
    #[error(transparent)]
    Rejected(#[from] SmtpError),

    /// Relay infrastructure failure, passed on untranslated.
    #[error("upstream transport: {0}")]
    Transport(#[source] UpstreamError),

    #[error("session is closed")]
    Closed,
}

impl RelayError {
    pub fn rejected(err: UpstreamError) -> Self {
        Self::Rejected(translate(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn structured_errors_pass_through() {
        let err = SmtpError::new(550, Some(EnhancedCode(5, 1, 1)), "5.1.1 stays verbatim");
        assert_eq!(translate(UpstreamError::Structured(err.clone())), err);
    }

    #[test]
    fn legacy_enhanced_code_is_extracted() {
        let err = UpstreamError::Legacy {
            code: 535,
            message: "5.7.8 Authentication failed".into(),
        };
        assert_eq!(
            translate(err),
            SmtpError::new(535, Some(EnhancedCode(5, 7, 8)), "Authentication failed")
        );
    }

    #[test]
    fn legacy_without_enhanced_code_is_untouched() {
        for message in ["Authentication failed", "5.7.8", "5.7.8-no", "57.8 x", ""] {
            let err = UpstreamError::Legacy {
                code: 535,
                message: message.into(),
            };
            assert_eq!(translate(err), SmtpError::new(535, None, message));
        }
    }

    #[test]
    fn bad_digit_drops_whole_code() {
        let err = UpstreamError::Legacy {
            code: 451,
            message: "4.x.1 try later".into(),
        };
        assert_eq!(translate(err), SmtpError::new(451, None, "try later"));
    }

    #[test]
    fn opaque_errors_have_unknown_code() {
        let err = UpstreamError::Opaque(io::Error::new(io::ErrorKind::Other, "connection reset"));
        assert_eq!(translate(err), SmtpError::new(0, None, "connection reset"));
    }

    #[test]
    fn display_includes_enhanced_code() {
        let err = SmtpError::new(535, Some(EnhancedCode(5, 7, 8)), "Authentication failed");
        assert_eq!(err.to_string(), "535 5.7.8 Authentication failed");
        assert_eq!(SmtpError::new(421, None, "bye").to_string(), "421 bye");
    }
}
