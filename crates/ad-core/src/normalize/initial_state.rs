//! Seed rows fed to a normalizer helper run.

use crate::codec::LengthEncodedWriter;
use std::io::{self, Write};

/// Column written for raw score states.
pub const SCORE_COLUMN: &str = "anomalyScore";
/// Columns written for probability states.
pub const PROBABILITY_COLUMNS: [&str; 2] = ["probability", "distinguisher"];

/// An ordered, immutable batch of rows plus its header.
///
/// The header is written first, then one record per row, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialState {
    header: Vec<String>,
    epochs: Vec<i64>,
    rows: Vec<Vec<String>>,
}

impl InitialState {
    /// Build a state from `(epoch, score)` pairs, ordered by epoch.
    pub fn from_scores<I>(scores: I) -> Self
    where
        I: IntoIterator<Item = (i64, f64)>,
    {
        let mut scores: Vec<(i64, f64)> = scores.into_iter().collect();
        scores.sort_by_key(|(epoch, _)| *epoch);
        let (epochs, rows) = scores
            .into_iter()
            .map(|(epoch, score)| (epoch, vec![format_decimal(score)]))
            .unzip();
        Self {
            header: vec![SCORE_COLUMN.to_string()],
            epochs,
            rows,
        }
    }

    /// Build a state from `(epoch, probability, distinguisher)` rows,
    /// ordered by epoch.
    pub fn from_probabilities<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (i64, f64, String)>,
    {
        let mut rows: Vec<(i64, f64, String)> = rows.into_iter().collect();
        rows.sort_by_key(|(epoch, _, _)| *epoch);
        let (epochs, rows) = rows
            .into_iter()
            .map(|(epoch, probability, distinguisher)| {
                (epoch, vec![format_decimal(probability), distinguisher])
            })
            .unzip();
        Self {
            header: PROBABILITY_COLUMNS.iter().map(|c| c.to_string()).collect(),
            epochs,
            rows,
        }
    }

    /// Build a state from pre-formatted rows in caller order.
    pub fn from_rows<S: AsRef<str>>(header: &[S], rows: Vec<Vec<String>>) -> Self {
        Self {
            header: header.iter().map(|h| h.as_ref().to_string()).collect(),
            epochs: Vec::new(),
            rows,
        }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Epochs of each row, when the state was built from timed rows.
    pub fn epochs(&self) -> &[i64] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the header and every row, then flush.
    pub fn write_to<W: Write>(&self, writer: &mut LengthEncodedWriter<W>) -> io::Result<()> {
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()
    }
}

/// Shortest decimal text that round-trips the value.
pub fn format_decimal(value: f64) -> String {
    format!("{}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthEncodedReader;

    #[test]
    fn test_scores_sorted_by_epoch() {
        let state = InitialState::from_scores(vec![(300, 3.0), (100, 1.5), (200, 0.0)]);
        assert_eq!(state.header(), &["anomalyScore".to_string()]);
        assert_eq!(state.epochs(), &[100, 200, 300]);
        assert_eq!(
            state.rows(),
            &[vec!["1.5".to_string()], vec!["0".to_string()], vec!["3".to_string()]]
        );
    }

    #[test]
    fn test_probability_rows_carry_distinguisher() {
        let state = InitialState::from_probabilities(vec![(10, 0.25, "airline=AAL".to_string())]);
        assert_eq!(state.header().len(), 2);
        assert_eq!(state.rows()[0], vec!["0.25".to_string(), "airline=AAL".to_string()]);
    }

    #[test]
    fn test_write_to_emits_header_then_rows() {
        let state = InitialState::from_scores(vec![(1, 42.0), (2, 88.0)]);
        let mut writer = LengthEncodedWriter::new(Vec::new());
        state.write_to(&mut writer).unwrap();
        let bytes = writer.into_inner().unwrap();

        let records: Vec<Vec<String>> = LengthEncodedReader::new(bytes.as_slice())
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(
            records,
            vec![
                vec!["anomalyScore".to_string()],
                vec!["42".to_string()],
                vec!["88".to_string()],
            ]
        );
    }

    #[test]
    fn test_empty_state() {
        let state = InitialState::from_scores(Vec::new());
        assert!(state.is_empty());
        assert_eq!(state.len(), 0);
    }
}
