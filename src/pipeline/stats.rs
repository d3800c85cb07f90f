//! Read path: range request validation and response shape
//!
//! Reads are served from the durable store only; pending in-memory counts are
//! never visible here.

use super::db::{StatsReader, StoreError};
use super::types::{truncate_to_minute, StatPoint};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw range request, as received from a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stats: Vec<StatPoint>,
}

#[derive(Debug)]
pub enum StatsError {
    InvalidBannerId(i64),
    InvalidFrom(String),
    InvalidTo(String),
    EmptyRange,
    RangeTooLarge { max_days: u32 },
    Store(StoreError),
}

impl From<StoreError> for StatsError {
    fn from(err: StoreError) -> Self {
        StatsError::Store(err)
    }
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::InvalidBannerId(id) => write!(f, "invalid banner id: {}", id),
            StatsError::InvalidFrom(raw) => write!(f, "invalid from: {:?}", raw),
            StatsError::InvalidTo(raw) => write!(f, "invalid to: {:?}", raw),
            StatsError::EmptyRange => write!(f, "to must be after from"),
            StatsError::RangeTooLarge { max_days } => {
                write!(f, "range too large (max {} days)", max_days)
            }
            StatsError::Store(e) => write!(f, "query failed: {}", e),
        }
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatsError::Store(e) => Some(e),
            _ => None,
        }
    }
}

/// Validated, minute-aligned half-open range `[from, to)` for one banner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeQuery {
    pub banner_id: i64,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl RangeQuery {
    /// Validate a request
    ///
    /// `max_range_days == 0` disables the range limit. The limit and the
    /// ordering check apply to the bounds as given; both bounds are then
    /// truncated to the minute.
    pub fn new(banner_id: i64, request: &StatsRequest, max_range_days: u32) -> Result<Self, StatsError> {
        if banner_id <= 0 {
            return Err(StatsError::InvalidBannerId(banner_id));
        }

        let from = parse_timestamp(&request.from)
            .ok_or_else(|| StatsError::InvalidFrom(request.from.clone()))?;
        let to = parse_timestamp(&request.to)
            .ok_or_else(|| StatsError::InvalidTo(request.to.clone()))?;

        if to <= from {
            return Err(StatsError::EmptyRange);
        }

        if max_range_days > 0 && to - from > chrono::Duration::days(i64::from(max_range_days)) {
            return Err(StatsError::RangeTooLarge {
                max_days: max_range_days,
            });
        }

        Ok(Self {
            banner_id,
            from: truncate_to_minute(&from),
            to: truncate_to_minute(&to),
        })
    }

    /// Run the query against a reader
    pub async fn execute<R: StatsReader + ?Sized>(&self, reader: &R) -> Result<StatsResponse, StatsError> {
        let stats = reader.query_range(self.banner_id, self.from, self.to).await?;
        Ok(StatsResponse { stats })
    }
}

/// Parse RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS` taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(from: &str, to: &str) -> StatsRequest {
        StatsRequest {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 10, 19, 0, 29, 42).unwrap();

        assert_eq!(parse_timestamp("2025-10-19T00:29:42Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-10-19T03:29:42+03:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-10-19T00:29:42"), Some(expected));
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_valid_range_is_truncated() {
        let query = RangeQuery::new(
            1,
            &request("2025-10-19T00:29:42Z", "2025-10-19T01:15:59Z"),
            90,
        )
        .unwrap();

        assert_eq!(query.from, Utc.with_ymd_and_hms(2025, 10, 19, 0, 29, 0).unwrap());
        assert_eq!(query.to, Utc.with_ymd_and_hms(2025, 10, 19, 1, 15, 0).unwrap());
    }

    #[test]
    fn test_rejections() {
        let ok = request("2025-10-19T00:00:00Z", "2025-10-20T00:00:00Z");

        assert!(matches!(RangeQuery::new(0, &ok, 90), Err(StatsError::InvalidBannerId(0))));
        assert!(matches!(
            RangeQuery::new(1, &request("", "2025-10-20T00:00:00Z"), 90),
            Err(StatsError::InvalidFrom(_))
        ));
        assert!(matches!(
            RangeQuery::new(1, &request("2025-10-19T00:00:00Z", "bad"), 90),
            Err(StatsError::InvalidTo(_))
        ));
        assert!(matches!(
            RangeQuery::new(1, &request("2025-10-20T00:00:00Z", "2025-10-19T00:00:00Z"), 90),
            Err(StatsError::EmptyRange)
        ));
        assert!(matches!(
            RangeQuery::new(1, &request("2025-01-01T00:00:00Z", "2025-10-19T00:00:00Z"), 90),
            Err(StatsError::RangeTooLarge { max_days: 90 })
        ));
    }

    #[test]
    fn test_zero_max_days_is_unlimited() {
        let query = RangeQuery::new(1, &request("2000-01-01T00:00:00Z", "2025-01-01T00:00:00Z"), 0);
        assert!(query.is_ok());
    }

    #[test]
    fn test_request_rejects_unknown_fields() {
        let parsed: Result<StatsRequest, _> =
            serde_json::from_str(r#"{"from":"a","to":"b","extra":1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_response_json_shape() {
        let response = StatsResponse {
            stats: vec![StatPoint {
                ts: Utc.with_ymd_and_hms(2025, 10, 19, 0, 29, 0).unwrap(),
                v: 2,
            }],
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["stats"][0]["ts"], "2025-10-19T00:29:00Z");
        assert_eq!(json["stats"][0]["v"], 2);
    }
}
