//! SQLite connection setup shared by the credential and state stores.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// How long a writer waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a database connection configured for several processes sharing one file.
pub fn open_connection<P: AsRef<Path>>(path: P) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Formats a timestamp so that lexical order matches chronological order.
pub fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp written by [`to_db_time`].
pub fn from_db_time(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_db_time_sorts_chronologically() {
        let base = Utc::now();
        let earlier = to_db_time(base);
        let later = to_db_time(base + ChronoDuration::milliseconds(1));
        let much_later = to_db_time(base + ChronoDuration::seconds(10));

        assert!(earlier < later);
        assert!(later < much_later);
    }

    #[test]
    fn test_db_time_roundtrip_keeps_microseconds() {
        let now = Utc::now();
        let parsed = from_db_time(&to_db_time(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
