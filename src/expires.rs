//! Message expiration value preserved in its wire-compatible text form.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ABSOLUTE_PREFIX: &str = "at";
const RELATIVE_PREFIX: &str = "in";
const ABSOLUTE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse failure for the [`Expires`] grammar.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ExpiresParseError {
    /// The expression shape is wrong: not two tokens, or an unknown prefix.
    #[error("malformed expires expression: {0}")]
    Argument(String),
    /// The value token does not parse for its variant.
    #[error("malformed expires value: {0}")]
    Format(String),
}

/// Message expiration, either at an absolute instant or after a relative period.
///
/// The serialized grammar is two whitespace-separated tokens:
/// `at <ISO-8601 local datetime, seconds precision>` (serialized in UTC with
/// a `T` separator and no offset) or `in <non-negative integer seconds>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expires {
    /// Expire at an absolute UTC instant.
    At(DateTime<Utc>),
    /// Expire after the given number of seconds.
    In(u64),
}

impl Expires {
    /// Expiration at the given instant.
    pub fn at(instant: DateTime<Utc>) -> Self {
        Expires::At(instant)
    }

    /// Expiration after `seconds` seconds.
    pub fn in_seconds(seconds: u64) -> Self {
        Expires::In(seconds)
    }
}

impl fmt::Display for Expires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expires::At(instant) => {
                write!(f, "{} {}", ABSOLUTE_PREFIX, instant.format(ABSOLUTE_FORMAT))
            }
            Expires::In(seconds) => write!(f, "{RELATIVE_PREFIX} {seconds}"),
        }
    }
}

impl FromStr for Expires {
    type Err = ExpiresParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let (prefix, value) = match tokens.as_slice() {
            [prefix, value] => (*prefix, *value),
            _ => {
                return Err(ExpiresParseError::Argument(format!(
                    "expected two tokens, got {} in `{s}`",
                    tokens.len()
                )))
            }
        };

        match prefix {
            ABSOLUTE_PREFIX => NaiveDateTime::parse_from_str(value, ABSOLUTE_FORMAT)
                .map(|naive| Expires::At(naive.and_utc()))
                .map_err(|err| ExpiresParseError::Format(format!("`{value}`: {err}"))),
            RELATIVE_PREFIX => value
                .parse::<u64>()
                .map(Expires::In)
                .map_err(|err| ExpiresParseError::Format(format!("`{value}`: {err}"))),
            other => Err(ExpiresParseError::Argument(format!(
                "unknown prefix `{other}` in `{s}`"
            ))),
        }
    }
}
