//! Server side SASL mechanisms offered to relay clients.

use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    /// Needed by clients such as Windows `Send-MailMessage`.
    Login,
}

impl Mechanism {
    pub const ADVERTISED: &'static str = "PLAIN LOGIN";
}

impl FromStr for Mechanism {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("PLAIN") {
            Ok(Self::Plain)
        } else if s.eq_ignore_ascii_case("LOGIN") {
            Ok(Self::Login)
        } else {
            Err(AuthError::UnsupportedMechanism)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unsupported authentication mechanism")]
    UnsupportedMechanism,
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("invalid base64 response")]
    InvalidEncoding,
    #[error("malformed credentials")]
    Malformed,
    #[error("authorization identities are not supported")]
    IdentityNotSupported,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Where an AUTH exchange currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    Plain,
    LoginUsername,
    LoginPassword { username: String },
}

/// Result of feeding one client response into an [`Exchange`].
#[derive(PartialEq, Eq)]
pub enum Step {
    /// Send `334 <challenge>` and wait for the next response.
    Challenge(Exchange, &'static str),
    Done(Credentials),
}

const USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
const PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

fn decode(response: &str) -> Result<String, AuthError> {
    if response == "*" {
        return Err(AuthError::Cancelled);
    }
    let bytes = STANDARD.decode(response.trim()).map_err(|_| AuthError::InvalidEncoding)?;
    String::from_utf8(bytes).map_err(|_| AuthError::Malformed)
}

fn plain_credentials(decoded: &str) -> Result<Credentials, AuthError> {
    let mut parts = decoded.split('\0');
    let (Some(identity), Some(username), Some(password), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Malformed);
    };
    if !identity.is_empty() && identity != username {
        return Err(AuthError::IdentityNotSupported);
    }
    Ok(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

impl Exchange {
    /// Starts an exchange for `AUTH <mechanism> [initial-response]`.
    pub fn start(mechanism: Mechanism, initial: Option<&str>) -> Result<Step, AuthError> {
        match (mechanism, initial) {
            (Mechanism::Plain, None) => Ok(Step::Challenge(Exchange::Plain, "")),
            (Mechanism::Plain, Some(initial)) => Exchange::Plain.step(initial),
            (Mechanism::Login, None) => Ok(Step::Challenge(Exchange::LoginUsername, USERNAME_CHALLENGE)),
            (Mechanism::Login, Some(initial)) => Exchange::LoginUsername.step(initial),
        }
    }

    pub fn step(self, response: &str) -> Result<Step, AuthError> {
        let decoded = decode(response)?;
        match self {
            Exchange::Plain => plain_credentials(&decoded).map(Step::Done),
            Exchange::LoginUsername => Ok(Step::Challenge(
                Exchange::LoginPassword { username: decoded },
                PASSWORD_CHALLENGE,
            )),
            Exchange::LoginPassword { username } => Ok(Step::Done(Credentials {
                username,
                password: decoded,
            })),
        }
    }
}
