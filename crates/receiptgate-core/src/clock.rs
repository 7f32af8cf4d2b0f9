use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::error::ReceiptGateError;

/// Fixed-width timestamp layout used for every `created_at` column. Six
/// subsecond digits keep the text lexicographically ordered, which the keyset
/// cursors rely on in both backends.
const DB_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Current UTC time truncated to the storage precision, so a freshly
/// committed receipt compares equal to its re-read row.
#[must_use]
pub fn now_db_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    let micros = now.nanosecond() / 1_000 * 1_000;
    now.replace_nanosecond(micros).unwrap_or(now)
}

/// Formats a timestamp for storage.
///
/// # Errors
/// Returns [`ReceiptGateError::Internal`] if formatting fails.
pub fn format_db_timestamp(value: OffsetDateTime) -> Result<String, ReceiptGateError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(DB_TIMESTAMP)
        .map_err(|err| ReceiptGateError::Internal(format!("timestamp format failed: {err}")))
}

/// Parses a stored timestamp back to UTC.
///
/// # Errors
/// Returns [`ReceiptGateError::Backend`] when a stored value is not valid
/// RFC3339, which indicates row corruption.
pub fn parse_db_timestamp(raw: &str) -> Result<OffsetDateTime, ReceiptGateError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map(|value| value.to_offset(UtcOffset::UTC))
        .map_err(|err| ReceiptGateError::Backend(format!("invalid stored timestamp {raw:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn db_timestamp_is_fixed_width_utc() {
        let formatted = format_db_timestamp(datetime!(2026-03-01 09:30:00.5 UTC)).unwrap();
        assert_eq!(formatted, "2026-03-01T09:30:00.500000Z");
        assert_eq!(formatted.len(), 27);
    }

    #[test]
    fn offsets_are_normalized_before_formatting() {
        let formatted = format_db_timestamp(datetime!(2026-03-01 10:30:00 +01:00)).unwrap();
        assert_eq!(formatted, "2026-03-01T09:30:00.000000Z");
    }

    #[test]
    fn formatted_timestamps_parse_back() {
        let original = datetime!(2026-03-01 09:30:00.123456 UTC);
        let parsed = parse_db_timestamp(&format_db_timestamp(original).unwrap()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn lexicographic_order_matches_chronological_order() {
        let earlier = format_db_timestamp(datetime!(2026-03-01 09:30:00.000001 UTC)).unwrap();
        let later = format_db_timestamp(datetime!(2026-03-01 09:30:00.100000 UTC)).unwrap();
        assert!(earlier < later);
    }
}
