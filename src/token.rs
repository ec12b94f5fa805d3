//! Control-plane bearer token.
//!
//! The token is a Home Assistant long-lived access token. It is read from
//! the environment or from a small TOML secrets file:
//!
//! ```toml
//! token = "eyJhbGciOi..."
//! ```

use std::{fs, ops::Deref, path::Path, str::FromStr};

use veil::Redact;

use crate::error::{Error, Result};

/// Bearer token for the control-plane REST API.
///
/// Redacted in `Debug` output so that it never ends up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Redact)]
#[redact(all)]
pub struct Token(String);

impl Token {
    /// Largest secrets file that will be read.
    const MAX_FILE_SIZE: u64 = 4096;

    /// Loads the token from the `token` key of a TOML secrets file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, too large, not valid TOML or
    /// does not contain a usable token.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: secrets file should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let value = contents.parse::<toml::Table>()?;
        match value.get("token").and_then(toml::Value::as_str) {
            Some(token) => token.parse(),
            None => Err(Error::not_found(format!(
                "{} does not contain a token",
                path.display()
            ))),
        }
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim();
        if token.is_empty() {
            return Err(Error::invalid_argument("token is empty"));
        }

        // Must fit in an `Authorization` header.
        if token.chars().any(|chr| chr.is_whitespace() || chr.is_control()) {
            return Err(Error::invalid_argument("token contains illegal characters"));
        }

        Ok(Self(token.to_owned()))
    }
}

impl Deref for Token {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
