//! Row validation: seven string cells in, a [`CallRecord`] or a [`Rejection`] out.

use std::fmt;

use thiserror::Error;

use crate::models::CallRecord;

/// Columns in sheet order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Msdin,
    ImeiFrom,
    Latitude,
    Longitude,
    Duration,
    ImeiTo,
    CallTime,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Msdin,
        Field::ImeiFrom,
        Field::Latitude,
        Field::Longitude,
        Field::Duration,
        Field::ImeiTo,
        Field::CallTime,
    ];

    pub const fn column(self) -> usize {
        match self {
            Field::Msdin => 0,
            Field::ImeiFrom => 1,
            Field::Latitude => 2,
            Field::Longitude => 3,
            Field::Duration => 4,
            Field::ImeiTo => 5,
            Field::CallTime => 6,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Field::Msdin => "MSDIN",
            Field::ImeiFrom => "IMEI_FROM",
            Field::Latitude => "latitude",
            Field::Longitude => "longitude",
            Field::Duration => "duration",
            Field::ImeiTo => "IMEI_TO",
            Field::CallTime => "call_time",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("missing column")]
    MissingColumn,
    #[error("the string is empty")]
    Empty,
    #[error("not a base-10 integer: {0}")]
    NotAnInteger(String),
    #[error("not a number: {0}")]
    NotAFloat(String),
    #[error("float number is negative: {0}")]
    Negative(f64),
    #[error("float number is NaN")]
    NotANumber,
    #[error("float number is infinite")]
    NotFinite,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {field}: {value:?}, {reason}")]
pub struct Rejection {
    pub field: Field,
    pub value: String,
    pub reason: RejectReason,
}

fn cell<S: AsRef<str>>(row: &[S], field: Field) -> Result<&str, Rejection> {
    row.get(field.column())
        .map(AsRef::as_ref)
        .ok_or(Rejection {
            field,
            value: String::new(),
            reason: RejectReason::MissingColumn,
        })
}

fn reject(field: Field, value: &str, reason: RejectReason) -> Rejection {
    Rejection {
        field,
        value: value.to_string(),
        reason,
    }
}

fn digits<S: AsRef<str>>(row: &[S], field: Field) -> Result<String, Rejection> {
    let value = cell(row, field)?;
    if value.is_empty() {
        return Err(reject(field, value, RejectReason::Empty));
    }
    value
        .parse::<i64>()
        .map_err(|err| reject(field, value, RejectReason::NotAnInteger(err.to_string())))?;
    Ok(value.to_string())
}

fn float<S: AsRef<str>>(row: &[S], field: Field) -> Result<f64, Rejection> {
    let value = cell(row, field)?;
    let parsed = value
        .parse::<f64>()
        .map_err(|err| reject(field, value, RejectReason::NotAFloat(err.to_string())))?;
    if parsed.is_nan() {
        return Err(reject(field, value, RejectReason::NotANumber));
    }
    if parsed.is_infinite() {
        return Err(reject(field, value, RejectReason::NotFinite));
    }
    Ok(parsed)
}

fn unsigned_float<S: AsRef<str>>(row: &[S], field: Field) -> Result<f64, Rejection> {
    let parsed = float(row, field)?;
    let value = cell(row, field)?;
    if parsed < 0.0 {
        return Err(reject(field, value, RejectReason::Negative(parsed)));
    }
    Ok(parsed)
}

/// Checks one row, stopping at the first field (in column order) that fails.
pub fn validate_row<S: AsRef<str>>(row: &[S]) -> Result<CallRecord, Rejection> {
    let msdin = digits(row, Field::Msdin)?;
    let imei_from = digits(row, Field::ImeiFrom)?;
    let latitude = float(row, Field::Latitude)?;
    let longitude = float(row, Field::Longitude)?;
    let duration = unsigned_float(row, Field::Duration)?;
    let imei_to = digits(row, Field::ImeiTo)?;
    // The sheet reader drops trailing empty cells, so a blank call time
    // arrives as a six-cell row.
    let call_time = row
        .get(Field::CallTime.column())
        .map(|value| value.as_ref().to_string())
        .unwrap_or_default();

    Ok(CallRecord {
        msdin,
        imei_from,
        imei_to,
        latitude,
        longitude,
        duration,
        call_time,
    })
}

/// Validates every row after the header, logging and dropping rejected ones.
pub fn validate_rows<R, S>(rows: &[R]) -> Vec<CallRecord>
where
    R: AsRef<[S]>,
    S: AsRef<str>,
{
    let mut records = Vec::with_capacity(rows.len().saturating_sub(1));
    let mut rejected = 0usize;
    for (index, row) in rows.iter().enumerate().skip(1) {
        match validate_row(row.as_ref()) {
            Ok(record) => records.push(record),
            Err(rejection) => {
                rejected += 1;
                tracing::warn!(
                    row = index,
                    field = %rejection.field,
                    value = %rejection.value,
                    reason = %rejection.reason,
                    "row rejected"
                );
            }
        }
    }

    tracing::info!(
        rows = rows.len().saturating_sub(1),
        accepted = records.len(),
        rejected,
        "rows validated"
    );
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: [&str; 7] = [
        "5550001",
        "490154203237518",
        "37.77",
        "-122.41",
        "42.5",
        "490154203237519",
        "2024-01-01T10:00:00Z",
    ];

    fn with(column: usize, value: &'static str) -> Vec<&'static str> {
        let mut row = VALID.to_vec();
        row[column] = value;
        row
    }

    #[test]
    fn valid_row_maps_one_to_one() {
        let record = validate_row(&VALID).unwrap();
        assert_eq!(
            record,
            CallRecord {
                msdin: "5550001".to_string(),
                imei_from: "490154203237518".to_string(),
                imei_to: "490154203237519".to_string(),
                latitude: 37.77,
                longitude: -122.41,
                duration: 42.5,
                call_time: "2024-01-01T10:00:00Z".to_string(),
            }
        );
    }

    #[test]
    fn non_numeric_subscriber_is_rejected() {
        let rejection = validate_row(&with(0, "55a0001")).unwrap_err();
        assert_eq!(rejection.field, Field::Msdin);
        assert!(matches!(rejection.reason, RejectReason::NotAnInteger(_)));
    }

    #[test]
    fn negative_duration_is_rejected() {
        let rejection = validate_row(&with(4, "-1")).unwrap_err();
        assert_eq!(rejection.field, Field::Duration);
        assert_eq!(rejection.reason, RejectReason::Negative(-1.0));
        assert_eq!(
            rejection.to_string(),
            "invalid duration: \"-1\", float number is negative: -1"
        );
    }

    #[test]
    fn zero_duration_is_accepted_and_nan_is_not() {
        assert_eq!(validate_row(&with(4, "0")).unwrap().duration, 0.0);
        let rejection = validate_row(&with(4, "NaN")).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::NotANumber);
    }

    #[test]
    fn first_failing_column_wins() {
        let mut row = with(1, "");
        row[5] = "x";
        let rejection = validate_row(&row).unwrap_err();
        assert_eq!(rejection.field, Field::ImeiFrom);
        assert_eq!(rejection.reason, RejectReason::Empty);
    }

    #[test]
    fn coordinates_have_no_range_check() {
        let record = validate_row(&with(2, "123.5")).unwrap();
        assert_eq!(record.latitude, 123.5);
        let rejection = validate_row(&with(3, "west")).unwrap_err();
        assert_eq!(rejection.field, Field::Longitude);
    }

    #[test]
    fn call_time_is_passed_through() {
        let record = validate_row(&with(6, "yesterday")).unwrap();
        assert_eq!(record.call_time, "yesterday");
    }

    #[test]
    fn short_row_is_rejected() {
        let rejection = validate_row(&VALID[..5]).unwrap_err();
        assert_eq!(rejection.field, Field::ImeiTo);
        assert_eq!(rejection.reason, RejectReason::MissingColumn);
    }

    #[test]
    fn absent_call_time_passes_through_as_empty() {
        let record = validate_row(&VALID[..6]).unwrap();
        assert_eq!(record.call_time, "");
        assert_eq!(validate_row(&with(6, "")).unwrap().call_time, "");
    }

    #[test]
    fn infinite_coordinates_and_durations_are_rejected() {
        for (column, field) in [(2, Field::Latitude), (3, Field::Longitude), (4, Field::Duration)] {
            for value in ["inf", "-infinity", "NaN"] {
                let rejection = validate_row(&with(column, value)).unwrap_err();
                assert_eq!(rejection.field, field);
                if value == "NaN" {
                    assert_eq!(rejection.reason, RejectReason::NotANumber);
                } else {
                    assert_eq!(rejection.reason, RejectReason::NotFinite);
                }
            }
        }
        assert!(validate_row(&with(2, "1e308")).is_ok());
    }

    #[test]
    fn header_is_skipped_and_order_preserved() {
        let rows = vec![
            vec!["MSDIN", "IMEI_FROM", "lat", "lng", "duration", "IMEI_TO", "call_time"],
            with(0, "1"),
            with(0, "bad"),
            with(0, "3"),
            with(4, "-1"),
            with(0, "5"),
        ];
        let records = validate_rows(&rows);
        let msdins = records.iter().map(|r| r.msdin.as_str()).collect::<Vec<_>>();
        assert_eq!(msdins, ["1", "3", "5"]);
    }

    #[test]
    fn empty_sheet_yields_nothing() {
        let rows: Vec<Vec<String>> = Vec::new();
        assert!(validate_rows(&rows).is_empty());
    }
}
