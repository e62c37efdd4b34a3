//! Minimal in-memory table for post-processing backend output.
//!
//! Backends print CSV with a header row; queries then project, sort, or
//! group it before it is written to the per-query result file.

use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::io::Write;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Frame {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Parse CSV with a header row
    pub fn from_csv(data: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(data);

        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    /// One-row table holding a scalar count
    pub fn scalar_count(count: u64) -> Self {
        Self {
            headers: vec!["count".to_string()],
            rows: vec![vec![count.to_string()]],
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, column: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| anyhow!("column `{}` not found in {:?}", column, self.headers))
    }

    /// Keep only the given columns, in the given order. Empty keeps all.
    pub fn project(self, columns: &[String]) -> Result<Self> {
        if columns.is_empty() {
            return Ok(self);
        }

        let indices = columns
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>>>()?;

        let rows = self
            .rows
            .into_iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();

        Ok(Self {
            headers: columns.to_vec(),
            rows,
        })
    }

    /// Stable ascending sort by one column
    pub fn sort_by(mut self, column: &str) -> Result<Self> {
        let idx = self.column_index(column)?;
        self.rows.sort_by(|a, b| a[idx].cmp(&b[idx]));
        Ok(self)
    }

    /// Count rows per distinct combination of `group_by` values.
    ///
    /// The result has the grouping columns followed by `count_column`, ordered
    /// by count descending; ties keep first-seen group order.
    pub fn group_count(self, group_by: &[String], count_column: &str) -> Result<Self> {
        if group_by.is_empty() {
            return Err(anyhow!("aggregation needs at least one grouping column"));
        }

        let indices = group_by
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>>>()?;

        let mut order: Vec<Vec<String>> = Vec::new();
        let mut counts: HashMap<Vec<String>, u64> = HashMap::new();
        for row in &self.rows {
            let key: Vec<String> = indices.iter().map(|&i| row[i].clone()).collect();
            let count = counts.entry(key.clone()).or_insert(0);
            if *count == 0 {
                order.push(key);
            }
            *count += 1;
        }

        let mut grouped: Vec<(Vec<String>, u64)> = order
            .into_iter()
            .map(|key| {
                let count = counts[&key];
                (key, count)
            })
            .collect();
        grouped.sort_by(|a, b| b.1.cmp(&a.1));

        let mut headers = group_by.to_vec();
        headers.push(count_column.to_string());
        let rows = grouped
            .into_iter()
            .map(|(mut key, count)| {
                key.push(count.to_string());
                key
            })
            .collect();

        Ok(Self { headers, rows })
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Extract a count from tool output.
///
/// Accepts a plain number, a CSV with a `count` column, or falls back to the
/// last numeric line.
pub fn extract_count_from_output(output: &str) -> Option<u64> {
    let trimmed = output.trim();

    // Plain numeric output, possibly quoted
    if let Ok(count) = trimmed.trim_matches('"').parse() {
        return Some(count);
    }

    // CSV with a count column
    if let Ok(frame) = Frame::from_csv(trimmed.as_bytes()) {
        if let Ok(idx) = frame.column_index("count") {
            if let Some(count) = frame.rows.first().and_then(|row| row[idx].trim().parse().ok()) {
                return Some(count);
            }
        }
    }

    // Last numeric line
    trimmed
        .lines()
        .filter_map(|line| line.trim().trim_matches('"').parse().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::from_csv(
            b"patient_id,code,display\n\
              p3,718-7,Hemoglobin\n\
              p1,4548-4,HbA1c\n\
              p2,718-7,Hemoglobin\n",
        )
        .unwrap()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_project_and_sort() {
        let frame = sample()
            .project(&strings(&["code", "patient_id"]))
            .unwrap()
            .sort_by("patient_id")
            .unwrap();

        assert_eq!(frame.headers(), &strings(&["code", "patient_id"])[..]);
        assert_eq!(frame.rows()[0], strings(&["4548-4", "p1"]));
        assert_eq!(frame.rows()[2], strings(&["718-7", "p3"]));
    }

    #[test]
    fn test_project_missing_column() {
        assert!(sample().project(&strings(&["nope"])).is_err());
    }

    #[test]
    fn test_group_count_sorted_descending() {
        let frame = sample()
            .group_count(&strings(&["code", "display"]), "num_observations")
            .unwrap();

        assert_eq!(
            frame.headers(),
            &strings(&["code", "display", "num_observations"])[..]
        );
        assert_eq!(frame.rows()[0], strings(&["718-7", "Hemoglobin", "2"]));
        assert_eq!(frame.rows()[1], strings(&["4548-4", "HbA1c", "1"]));
    }

    #[test]
    fn test_group_count_requires_columns() {
        assert!(sample().group_count(&[], "n").is_err());
    }

    #[test]
    fn test_extract_count() {
        assert_eq!(extract_count_from_output("42\n"), Some(42));
        assert_eq!(extract_count_from_output("\"17\""), Some(17));
        assert_eq!(extract_count_from_output("count\n1234\n"), Some(1234));
        assert_eq!(
            extract_count_from_output("warning: slow query\n99\n"),
            Some(99)
        );
        assert_eq!(extract_count_from_output("no numbers here"), None);
    }

    #[test]
    fn test_write_csv() {
        let mut buf = Vec::new();
        Frame::scalar_count(7).write_csv(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "count\n7\n");
    }
}
