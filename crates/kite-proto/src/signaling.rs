//! Signaling line vocabulary
//!
//! The flock speaks numeric-coded, newline-terminated text lines; some codes
//! announce a following opaque payload frame. Outbound lines (appliance name,
//! persona id, credential, SDP answer, candidates) are plain text with no
//! numeric prefix.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Inbound signaling line codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCode {
    /// 105: persona enumeration begins.
    PersonasBegin,
    /// 150: offer payload follows, more candidates pending.
    OfferFollows,
    /// 151: candidate exchange complete.
    CandidatesDone,
    /// 200: proceed to transport negotiation.
    Proceed,
    /// 403: persona challenge required (end of persona list).
    ChallengeRequired,
    /// 404: appliance unknown to this flock.
    ApplianceUnknown,
    /// Any code outside the vocabulary.
    Other(u16),
}

impl LineCode {
    pub fn from_code(code: u16) -> Self {
        match code {
            105 => LineCode::PersonasBegin,
            150 => LineCode::OfferFollows,
            151 => LineCode::CandidatesDone,
            200 => LineCode::Proceed,
            403 => LineCode::ChallengeRequired,
            404 => LineCode::ApplianceUnknown,
            other => LineCode::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            LineCode::PersonasBegin => 105,
            LineCode::OfferFollows => 150,
            LineCode::CandidatesDone => 151,
            LineCode::Proceed => 200,
            LineCode::ChallengeRequired => 403,
            LineCode::ApplianceUnknown => 404,
            LineCode::Other(code) => *code,
        }
    }
}

/// Malformed signaling line (no leading decimal code).
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed signaling line: {0:?}")]
pub struct LineError(pub String);

/// Parse the leading decimal code of an inbound line. Trailing text after
/// the code is advisory and ignored.
pub fn parse_line(line: &str) -> Result<LineCode, LineError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let token = trimmed
        .split_whitespace()
        .next()
        .ok_or_else(|| LineError(line.to_owned()))?;
    let code: u16 = token.parse().map_err(|_| LineError(line.to_owned()))?;
    Ok(LineCode::from_code(code))
}

/// Credential scheme accepted by the login exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScheme {
    Pwd,
    Token,
}

impl CredentialScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialScheme::Pwd => "pwd",
            CredentialScheme::Token => "token",
        }
    }
}

/// Login credential, `scheme:material` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub scheme: CredentialScheme,
    pub material: String,
}

impl Credential {
    pub fn password(material: impl Into<String>) -> Self {
        Self {
            scheme: CredentialScheme::Pwd,
            material: material.into(),
        }
    }

    pub fn token(material: impl Into<String>) -> Self {
        Self {
            scheme: CredentialScheme::Token,
            material: material.into(),
        }
    }
}

/// Unknown credential scheme, caught before any I/O happens.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid credential: {0:?}")]
pub struct CredentialError(pub String);

impl FromStr for Credential {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, material) = s.split_once(':').ok_or_else(|| CredentialError(s.into()))?;
        let scheme = match scheme {
            "pwd" => CredentialScheme::Pwd,
            "token" => CredentialScheme::Token,
            _ => return Err(CredentialError(s.into())),
        };
        Ok(Credential {
            scheme,
            material: material.to_owned(),
        })
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme.as_str(), self.material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_parse() {
        assert_eq!(parse_line("105\n").unwrap(), LineCode::PersonasBegin);
        assert_eq!(parse_line("150 offer incoming").unwrap(), LineCode::OfferFollows);
        assert_eq!(parse_line("151").unwrap(), LineCode::CandidatesDone);
        assert_eq!(parse_line("200\r\n").unwrap(), LineCode::Proceed);
        assert_eq!(parse_line("403").unwrap(), LineCode::ChallengeRequired);
        assert_eq!(parse_line("404 no such appliance").unwrap(), LineCode::ApplianceUnknown);
    }

    #[test]
    fn unknown_code_is_other() {
        assert_eq!(parse_line("599").unwrap(), LineCode::Other(599));
        assert_eq!(LineCode::Other(599).code(), 599);
    }

    #[test]
    fn garbage_lines_are_rejected() {
        assert!(parse_line("").is_err());
        assert!(parse_line("\n").is_err());
        assert!(parse_line("hello").is_err());
        assert!(parse_line("-5").is_err());
        assert!(parse_line("99999").is_err());
    }

    #[test]
    fn code_round_trips() {
        for code in [105u16, 150, 151, 200, 403, 404, 42] {
            assert_eq!(LineCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn credential_parse_and_display() {
        let c: Credential = "pwd:hunter2".parse().unwrap();
        assert_eq!(c.scheme, CredentialScheme::Pwd);
        assert_eq!(c.material, "hunter2");
        assert_eq!(c.to_string(), "pwd:hunter2");

        let c: Credential = "token:abc:def".parse().unwrap();
        assert_eq!(c.scheme, CredentialScheme::Token);
        // Only the first colon separates scheme from material
        assert_eq!(c.material, "abc:def");
    }

    #[test]
    fn bad_credentials_rejected() {
        assert!("hunter2".parse::<Credential>().is_err());
        assert!("basic:xyz".parse::<Credential>().is_err());
    }
}
