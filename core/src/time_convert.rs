use chrono::{DateTime, FixedOffset, TimeZone, Utc};

use crate::error::{EtlError, Result};

/// Queensland does not observe daylight saving, so Brisbane time is a fixed
/// UTC+10 offset year round.
const BRISBANE_UTC_OFFSET_SECONDS: i32 = 10 * 3600;

/// The timestamp format used for snapshot metadata and object keys,
/// e.g. `2025-05-28T09:30:00+1000`.
pub const METADATA_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

pub fn brisbane_offset() -> FixedOffset {
    FixedOffset::east_opt(BRISBANE_UTC_OFFSET_SECONDS).expect("Brisbane offset is in range")
}

/// Convert UTC time to Brisbane time.
pub fn utc_to_brisbane_time(utc_datetime: DateTime<Utc>) -> DateTime<FixedOffset> {
    utc_datetime.with_timezone(&brisbane_offset())
}

pub fn metadata_timestamp(utc_datetime: DateTime<Utc>) -> String {
    utc_to_brisbane_time(utc_datetime)
        .format(METADATA_TIMESTAMP_FORMAT)
        .to_string()
}

pub fn parse_metadata_timestamp(raw: &str) -> Result<DateTime<FixedOffset>> {
    Ok(DateTime::parse_from_str(raw, METADATA_TIMESTAMP_FORMAT)?)
}

/// Convert milliseconds since epoch, as feature services report edit dates,
/// to a UTC datetime.
pub fn milliseconds_to_utc(milliseconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(milliseconds)
        .single()
        .ok_or_else(|| EtlError::SerDe(format!("{milliseconds} is not a valid epoch millisecond value")))
}

/// Renders a watermark for `last_edited_date` comparisons, in UTC as the
/// feature service stores edit dates.
pub fn esri_watermark(datetime: DateTime<FixedOffset>) -> String {
    datetime.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S").to_string()
}
