// SPDX-License-Identifier: Apache-2.0 OR MIT
// ISO-8601 timestamps for capture into messages

use chrono::{DateTime, SecondsFormat, Utc};

/// A point in time fixed at capture.
///
/// Serializes as ISO-8601 in UTC with millisecond-resolved fractional
/// seconds, e.g. `2024-01-02T03:04:05.678Z`. Capture one into a
/// message to record when the call site fired rather than when the
/// sink rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// The current time.
    pub fn now() -> Self {
        Timestamp(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Timestamp(at)
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Timestamp(at)
    }
}

/// A timestamp taken when serialized, not when captured.
///
/// Useful with deferred sinks when the render time is the interesting
/// one; with the async dispatcher that is the drain time, which may
/// lag capture by up to the configured latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LazyTimestamp;

impl std::fmt::Display for LazyTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&Timestamp::now(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_iso8601_millis_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::milliseconds(678);
        assert_eq!(
            Timestamp::from_datetime(at).to_string(),
            "2024-01-02T03:04:05.678Z"
        );
    }

    #[test]
    fn test_millis_are_zero_padded() {
        let at = Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 59).unwrap()
            + chrono::Duration::milliseconds(7);
        assert_eq!(
            Timestamp::from_datetime(at).to_string(),
            "2024-06-30T23:59:59.007Z"
        );
    }

    #[test]
    fn test_timestamps_are_capturable() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let message = crate::message::Message::capture(("at ", Timestamp::from_datetime(at)));
        assert_eq!(message.to_string(), "at 2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_lazy_renders_current_time() {
        let text = LazyTimestamp.to_string();
        assert!(text.ends_with('Z'));
        assert_eq!(text.len(), "2024-01-02T03:04:05.678Z".len());
    }
}
