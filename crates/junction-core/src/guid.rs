//! Bus GUIDs.
//!
//! Every daemon has a 128-bit GUID. Unique names handed out by a daemon
//! are prefixed with the short form: `:<short>.<n>`.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Hex characters in the short form of a GUID.
pub const SHORT_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Guid128([u8; 16]);

impl Guid128 {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short form used in unique names.
    pub fn short(&self) -> String {
        let mut s = hex::encode(self.0);
        s.truncate(SHORT_SIZE);
        s
    }

    /// Prefix shared by every unique name this GUID's daemon assigns.
    pub fn unique_prefix(&self) -> String {
        format!(":{}.", self.short())
    }
}

impl fmt::Display for Guid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Guid128 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| format!("bad guid {s:?}: {e}"))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| format!("guid {s:?} is not 16 bytes"))?;
        Ok(Self(bytes))
    }
}

impl From<Guid128> for String {
    fn from(g: Guid128) -> Self {
        g.to_string()
    }
}

impl TryFrom<String> for Guid128 {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
