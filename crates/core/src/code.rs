//! Session codes
//!
//! A session code is six decimal digits, displayed as `DDD-DDD`. It is the
//! only thing the two devices share and the namespace key in the rendezvous
//! store. Codes are short so they can be read aloud; they are not secrets in
//! any cryptographic sense.

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DIGITS: usize = 6;

/// A six digit session code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode {
    digits: String,
}

impl SessionCode {
    /// Generate a random code in `100-000..=999-999`
    pub fn generate() -> Self {
        let n: u32 = rand::thread_rng().gen_range(100_000..=999_999);
        Self {
            digits: n.to_string(),
        }
    }

    /// Parse a human-typed code
    ///
    /// Accepts `482913`, `482-913` and any whitespace around or between the
    /// groups. Anything other than exactly six digits is rejected.
    pub fn parse(input: &str) -> Result<Self> {
        let digits: String = input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();

        if digits.len() != DIGITS || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidCode(format!(
                "expected six digits, got {:?}",
                input
            )));
        }

        Ok(Self { digits })
    }

    /// The six digits without separator
    pub fn as_digits(&self) -> &str {
        &self.digits
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", &self.digits[..3], &self.digits[3..])
    }
}

impl FromStr for SessionCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.to_string()
    }
}
