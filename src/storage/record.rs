//! Pipe-delimited rows exchanged between ingest, detector and aggregator.
//!
//! Input:  `gateway|timestamp|service|v1|...|vn`
//! Result: `gateway|timestamp|service|v1|...|vn|score|label`
//!         `gateway|timestamp|service|v1|...|vn|score|Anomaly|start|end|pct`

use std::fmt;

use thiserror::Error;

use crate::detect::{DataPoint, EntityKey, Verdict};

pub const DELIMITER: char = '|';

#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("row has {got} fields, need at least {need}")]
    TooFewFields { got: usize, need: usize },

    #[error("field {index} is not a finite number: {value:?}")]
    BadNumber { index: usize, value: String },

    #[error("unknown verdict label {0:?}")]
    UnknownLabel(String),

    #[error("empty {0} field")]
    EmptyField(&'static str),
}

fn number(fields: &[&str], index: usize) -> Result<f64, RowError> {
    let raw = fields[index].trim();
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(RowError::BadNumber {
            index,
            value: raw.to_string(),
        }),
    }
}

fn numbers(fields: &[&str], range: std::ops::Range<usize>) -> Result<Vec<f64>, RowError> {
    range.map(|i| number(fields, i)).collect()
}

fn key_fields(fields: &[&str]) -> Result<(EntityKey, String), RowError> {
    let gateway = fields[0].trim();
    let timestamp = fields[1].trim();
    let service = fields[2].trim();
    if gateway.is_empty() {
        return Err(RowError::EmptyField("gateway"));
    }
    if timestamp.is_empty() {
        return Err(RowError::EmptyField("timestamp"));
    }
    if service.is_empty() {
        return Err(RowError::EmptyField("service"));
    }
    Ok((EntityKey::new(gateway, service), timestamp.to_string()))
}

/// One raw measurement for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRow {
    pub entity: EntityKey,
    pub point: DataPoint,
}

impl InputRow {
    pub fn parse(line: &str) -> Result<Self, RowError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(DELIMITER).collect();
        if fields.len() < 4 {
            return Err(RowError::TooFewFields {
                got: fields.len(),
                need: 4,
            });
        }
        let (entity, timestamp) = key_fields(&fields)?;
        let values = numbers(&fields, 3..fields.len())?;
        Ok(Self {
            entity,
            point: DataPoint::new(timestamp, values),
        })
    }
}

impl fmt::Display for InputRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.entity.gateway, self.point.timestamp, self.entity.service
        )?;
        for v in &self.point.values {
            write!(f, "|{}", v)?;
        }
        Ok(())
    }
}

/// Outcome of one scored detection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub entity: EntityKey,
    pub timestamp: String,
    pub values: Vec<f64>,
    pub score: f64,
    pub verdict: Verdict,
}

impl ResultRecord {
    /// Serialize as one row, without trailing newline.
    pub fn to_row(&self) -> String {
        self.to_string()
    }

    /// Parse a row written by [`ResultRecord::to_row`].
    ///
    /// The trailing fields are decoded from the end, so any number of input
    /// values is accepted.
    pub fn parse_row(line: &str) -> Result<Self, RowError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(DELIMITER).collect();
        let n = fields.len();
        if n < 6 {
            return Err(RowError::TooFewFields { got: n, need: 6 });
        }
        let (entity, timestamp) = key_fields(&fields)?;

        let closed = n >= 9 && fields[n - 4].trim() == "Anomaly";
        let (verdict, score_at) = if closed {
            let verdict = Verdict::Anomaly {
                window_start: fields[n - 3].trim().to_string(),
                window_end: fields[n - 2].trim().to_string(),
                percentage: number(&fields, n - 1)?,
            };
            (verdict, n - 5)
        } else {
            let verdict = match fields[n - 1].trim() {
                "Normal" => Verdict::Normal,
                "observing" => Verdict::Observing,
                other => return Err(RowError::UnknownLabel(other.to_string())),
            };
            (verdict, n - 2)
        };

        Ok(Self {
            entity,
            timestamp,
            values: numbers(&fields, 3..score_at)?,
            score: number(&fields, score_at)?,
            verdict,
        })
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.entity.gateway, self.timestamp, self.entity.service
        )?;
        for v in &self.values {
            write!(f, "|{}", v)?;
        }
        write!(f, "|{}|{}", self.score, self.verdict.label())?;
        if let Verdict::Anomaly {
            window_start,
            window_end,
            percentage,
        } = &self.verdict
        {
            write!(f, "|{}|{}|{}", window_start, window_end, percentage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(verdict: Verdict) -> ResultRecord {
        ResultRecord {
            entity: EntityKey::new("10.0.0.1", "web"),
            timestamp: "202401010005".to_string(),
            values: vec![120.0, 3.5],
            score: 1.25,
            verdict,
        }
    }

    #[test]
    fn test_input_row_parses_values() {
        let row = InputRow::parse("10.0.0.1|202401010000|web|120|3.5\n").unwrap();
        assert_eq!(row.entity, EntityKey::new("10.0.0.1", "web"));
        assert_eq!(row.point.timestamp, "202401010000");
        assert_eq!(row.point.values, vec![120.0, 3.5]);
        assert_eq!(row.to_string(), "10.0.0.1|202401010000|web|120|3.5");
    }

    #[test]
    fn test_input_row_errors() {
        assert_eq!(
            InputRow::parse("10.0.0.1|202401010000|web"),
            Err(RowError::TooFewFields { got: 3, need: 4 })
        );
        assert_eq!(
            InputRow::parse("10.0.0.1|202401010000|web|x"),
            Err(RowError::BadNumber {
                index: 3,
                value: "x".to_string()
            })
        );
        assert_eq!(
            InputRow::parse("|202401010000|web|1"),
            Err(RowError::EmptyField("gateway"))
        );
    }

    #[test]
    fn test_result_row_layout() {
        assert_eq!(
            record(Verdict::Normal).to_row(),
            "10.0.0.1|202401010005|web|120|3.5|1.25|Normal"
        );
        assert_eq!(
            record(Verdict::Observing).to_row(),
            "10.0.0.1|202401010005|web|120|3.5|1.25|observing"
        );
        assert_eq!(
            record(Verdict::Anomaly {
                window_start: "202401010002".to_string(),
                window_end: "202401010005".to_string(),
                percentage: 0.5,
            })
            .to_row(),
            "10.0.0.1|202401010005|web|120|3.5|1.25|Anomaly|202401010002|202401010005|0.5"
        );
    }

    #[test]
    fn test_result_rows_parse_back() {
        for verdict in [
            Verdict::Normal,
            Verdict::Observing,
            Verdict::Anomaly {
                window_start: "a".to_string(),
                window_end: "b".to_string(),
                percentage: 0.333,
            },
        ] {
            let original = record(verdict);
            assert_eq!(ResultRecord::parse_row(&original.to_row()).unwrap(), original);
        }
    }

    #[test]
    fn test_result_row_rejects_unknown_label() {
        assert_eq!(
            ResultRecord::parse_row("g|t|s|1|2|3|Weird"),
            Err(RowError::UnknownLabel("Weird".to_string()))
        );
    }

    #[test]
    fn test_result_row_with_garbage_tail_is_rejected() {
        assert!(matches!(
            ResultRecord::parse_row("g|t|s|Anomaly|1|2|3|4|5"),
            Err(_)
        ));
    }
}
