//! The frozen table schema descriptor stored at `<root>/metadata`.
//!
//! The first replica writes it; every replica validates its local schema
//! against it on open. Nine labeled lines in fixed order, columns last.

use std::fmt::Write as _;

use crate::error::ReplicationError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub date_column: String,
    /// Formatted sampling expression, empty when the table has none.
    pub sampling_expression: String,
    pub index_granularity: u64,
    pub mode: i32,
    pub sign_column: String,
    /// Formatted primary key expression, empty when the table has none.
    pub primary_key: String,
    /// Column name/type pairs in declaration order.
    pub columns: Vec<(String, String)>,
}

impl TableSchema {
    /// Render the metadata node value.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "metadata format version: 1");
        let _ = writeln!(out, "date column: {}", self.date_column);
        let _ = writeln!(out, "sampling expression: {}", self.sampling_expression);
        let _ = writeln!(out, "index granularity: {}", self.index_granularity);
        let _ = writeln!(out, "mode: {}", self.mode);
        let _ = writeln!(out, "sign column: {}", self.sign_column);
        let _ = writeln!(out, "primary key: {}", self.primary_key);
        let _ = writeln!(out, "columns:");
        for (name, type_name) in &self.columns {
            let _ = writeln!(out, "`{name}` {type_name}");
        }
        out
    }

    /// Validate the coordinator's metadata against this local schema,
    /// reporting the first mismatching field.
    pub fn check_matches(&self, text: &str) -> Result<(), ReplicationError> {
        let mut lines = text.lines();

        let mut field = |name: &'static str, prefix: &str, local: &str| {
            let line = lines.next().unwrap_or_default();
            let found = line.strip_prefix(prefix).unwrap_or(line);
            if found == local {
                Ok(())
            } else {
                Err(ReplicationError::MetadataMismatch {
                    field: name,
                    expected: found.to_string(),
                    found: local.to_string(),
                })
            }
        };

        field("format version", "metadata format version: ", "1")?;
        field("date column", "date column: ", &self.date_column)?;
        field("sampling expression", "sampling expression: ", &self.sampling_expression)?;
        field("index granularity", "index granularity: ", &self.index_granularity.to_string())?;
        field("mode", "mode: ", &self.mode.to_string())?;
        field("sign column", "sign column: ", &self.sign_column)?;
        field("primary key", "primary key: ", &self.primary_key)?;
        field("columns header", "columns:", "")?;

        for (name, type_name) in &self.columns {
            let line = lines.next().unwrap_or_default();
            let (found_name, found_type) = parse_column_line(line);
            if found_name != *name {
                return Err(ReplicationError::UnknownColumn {
                    expected: name.clone(),
                    found: found_name,
                });
            }
            if found_type != *type_name {
                return Err(ReplicationError::MetadataMismatch {
                    field: "column type",
                    expected: found_type,
                    found: type_name.clone(),
                });
            }
        }
        if let Some(extra) = lines.next() {
            return Err(ReplicationError::MetadataMismatch {
                field: "columns",
                expected: extra.to_string(),
                found: String::new(),
            });
        }
        Ok(())
    }
}

fn parse_column_line(line: &str) -> (String, String) {
    let rest = line.strip_prefix('`').unwrap_or(line);
    match rest.split_once("` ") {
        Some((name, type_name)) => (name.to_string(), type_name.to_string()),
        None => (rest.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema {
            date_column: "EventDate".into(),
            sampling_expression: "intHash32(UserID)".into(),
            index_granularity: 8192,
            mode: 0,
            sign_column: String::new(),
            primary_key: "(CounterID, EventDate)".into(),
            columns: vec![
                ("EventDate".into(), "Date".into()),
                ("CounterID".into(), "UInt32".into()),
            ],
        }
    }

    #[test]
    fn renders_nine_labeled_lines() {
        let text = schema().to_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "metadata format version: 1");
        assert_eq!(lines[3], "index granularity: 8192");
        assert_eq!(lines[7], "columns:");
        assert_eq!(lines[8], "`EventDate` Date");
        assert_eq!(lines[9], "`CounterID` UInt32");
    }

    #[test]
    fn own_rendering_always_matches() {
        let s = schema();
        s.check_matches(&s.to_text()).unwrap();
    }

    #[test]
    fn granularity_mismatch_names_the_field() {
        let mut other = schema();
        other.index_granularity = 1024;
        let err = other.check_matches(&schema().to_text()).unwrap_err();
        match err {
            ReplicationError::MetadataMismatch { field, .. } => {
                assert_eq!(field, "index granularity")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn column_name_mismatch_is_unknown_identifier() {
        let mut other = schema();
        other.columns[1].0 = "SiteID".into();
        let err = other.check_matches(&schema().to_text()).unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownColumn { .. }));
    }

    #[test]
    fn extra_remote_column_is_a_mismatch() {
        let mut other = schema();
        other.columns.pop();
        let err = other.check_matches(&schema().to_text()).unwrap_err();
        assert!(matches!(err, ReplicationError::MetadataMismatch { .. }));
    }
}
