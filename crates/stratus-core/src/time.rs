use chrono::{SecondsFormat, Utc};

/// Current wall-clock time as an RFC 3339 UTC string with second
/// precision and a `Z` suffix. Every persisted timestamp goes through
/// here so snapshot rows sort lexicographically.
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
