//! Expiry decoding for bearer credentials.
//!
//! Credentials are expected to be compact JWTs (`header.payload.signature`).
//! Only the payload's `exp` claim is read; the signature is the server's
//! business. Anything that doesn't look like a JWT is a normal, expected case
//! and simply disables proactive renewal for that credential.

use std::time::Duration;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::Credential;
use crate::error::DecodeError;

/// Lead time before expiry at which proactive renewal fires.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Issuers differ on whether they pad the payload segment.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<serde_json::Number>,
}

/// Result of reading a credential's expiry.
#[derive(Debug)]
pub enum Expiry {
    /// The payload carried an `exp` claim.
    Decoded(DateTime<Utc>),
    /// The payload decoded but has no `exp` claim.
    NoExpiry,
    /// The credential is not a decodable JWT.
    Undecodable(DecodeError),
}

impl Expiry {
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::Decoded(at) => Some(*at),
            Expiry::NoExpiry | Expiry::Undecodable(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialClock {
    safety_margin: Duration,
}

impl Default for CredentialClock {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_MARGIN)
    }
}

impl CredentialClock {
    pub fn new(safety_margin: Duration) -> Self {
        Self { safety_margin }
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Decode the expiry embedded in `credential`. Never fails.
    pub fn expiry_of(&self, credential: &Credential) -> Expiry {
        match Self::decode_exp(credential.expose()) {
            Ok(Some(at)) => Expiry::Decoded(at),
            Ok(None) => Expiry::NoExpiry,
            Err(err) => Expiry::Undecodable(err),
        }
    }

    /// How long to wait from `now` before renewing a credential that expires
    /// at `expiry`: `max(0, expiry - now - margin)`.
    pub fn renew_in(&self, expiry: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let margin = chrono::Duration::from_std(self.safety_margin).unwrap_or(chrono::Duration::zero());
        (expiry - now - margin).to_std().unwrap_or(Duration::ZERO)
    }

    fn decode_exp(raw: &str) -> Result<Option<DateTime<Utc>>, DecodeError> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(DecodeError::NotCompact {
                segments: segments.len(),
            });
        }

        let payload = PAYLOAD_ENGINE.decode(segments[1])?;
        let claims: Claims = serde_json::from_slice(&payload)?;

        let Some(exp) = claims.exp else {
            return Ok(None);
        };

        // Fractional seconds are allowed by the JWT NumericDate definition
        let secs = match exp.as_i64() {
            Some(secs) => secs,
            None => exp.as_f64().map(|f| f.floor() as i64).unwrap_or(i64::MAX),
        };

        DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or(DecodeError::ExpiryOutOfRange(secs))
    }
}
