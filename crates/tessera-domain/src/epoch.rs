//! Millisecond epochs doubling as modification times and version numbers.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub i64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(t: DateTime<Utc>) -> Self {
        Self(t.timestamp_millis())
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Epochs below 1 carry no version information.
    pub fn is_zero(self) -> bool {
        self.0 < 1
    }

    /// Returns this candidate, or `previous + 1` if the candidate does not
    /// move strictly past `previous`.
    pub fn after(self, previous: Epoch) -> Epoch {
        if previous >= self {
            Epoch(previous.0 + 1)
        } else {
            self
        }
    }

    /// Quoted form used in `ETag` headers.
    pub fn etag(self) -> String {
        format!("\"{}\"", self.0)
    }

    /// IMF-fixdate form used in `Last-Modified` headers.
    pub fn http_date(self) -> String {
        self.to_datetime().format(HTTP_DATE_FORMAT).to_string()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Epoch {
    fn from(ms: i64) -> Self {
        Self(ms)
    }
}
