//! Table-level access. Every method takes the caller's `&Connection` so it
//! joins whatever transaction the caller is running.

mod calendar;
mod checkin;
mod job;
mod lock;
mod paused;
mod trigger;

pub use calendar::CalendarDao;
pub use checkin::CheckinDao;
pub use job::JobDao;
pub use lock::LockDao;
pub use paused::PausedGroupDao;
pub use trigger::TriggerDao;

use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Row};

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {ms} out of range").into(),
        )
    })
}

pub(crate) fn opt_millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        None => Ok(None),
        Some(_) => millis_at(row, idx).map(Some),
    }
}

pub(crate) fn parse_column<T: std::str::FromStr<Err = String>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}
