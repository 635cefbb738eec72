use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

const BASE62_CHARS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Opaque job identifier: a UUIDv7 rendered as 22 base62 characters, so ids
/// sort roughly by creation time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(base62(Uuid::now_v7().as_u128(), 22))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Parses ids given on the command line. Only base62 text is accepted, so an
/// id is always safe to embed in a file name.
impl FromStr for JobId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            anyhow::bail!("invalid job id: {s:?}");
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short random suffix for worker ids and lock tokens.
pub fn short_token() -> String {
    base62(Uuid::new_v4().as_u128(), 6)
}

fn base62(mut n: u128, width: usize) -> String {
    let mut chars = vec![b'0'; width];
    for c in chars.iter_mut().rev() {
        *c = BASE62_CHARS[(n % 62) as usize];
        n /= 62;
    }
    chars.into_iter().map(char::from).collect()
}
