//! Input CSV loading.
//!
//! One CSV per pipeline carrying at least the entity's id column; any other
//! columns pass through the run untouched.

use std::path::Path;

use crate::frame::{Frame, Scalar};

use super::PipelineError;

fn parse_cell(text: &str) -> Scalar {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Scalar::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Scalar::Int(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Scalar::Float(f);
    }
    Scalar::String(trimmed.to_string())
}

pub fn read_input_csv(path: &Path) -> Result<Frame, PipelineError> {
    let input_error = |message: String| PipelineError::Input {
        path: path.display().to_string(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| input_error(e.to_string()))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| input_error(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Err(input_error("input CSV has no header row".to_string()));
    }

    let mut frame = Frame::new(headers.clone());
    for record in reader.records() {
        let record = record.map_err(|e| input_error(e.to_string()))?;
        let mut row: Vec<Scalar> = record.iter().map(parse_cell).collect();
        row.resize(headers.len(), Scalar::Null);
        frame.push_row(row);
    }
    Ok(frame)
}

/// Distinct non-null values of one column, as strings, in first-seen order.
pub fn column_values(frame: &Frame, column: &str) -> Vec<String> {
    let Some(idx) = frame.column_index(column) else {
        return Vec::new();
    };
    let mut seen: Vec<String> = Vec::new();
    for row in frame.rows() {
        let value = &row[idx];
        if value.is_null() {
            continue;
        }
        let text = value.key_repr();
        if !seen.contains(&text) {
            seen.push(text);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reads_typed_columns_and_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "activity_id,note").unwrap();
        writeln!(file, "123,keep me").unwrap();
        writeln!(file, "456,").unwrap();
        drop(file);

        let frame = read_input_csv(&path).unwrap();
        assert_eq!(frame.columns(), &["activity_id", "note"]);
        assert_eq!(frame.get(0, "activity_id"), Some(&Scalar::Int(123)));
        assert_eq!(
            frame.get(0, "note"),
            Some(&Scalar::String("keep me".to_string()))
        );
        assert_eq!(frame.get(1, "note"), Some(&Scalar::Null));

        assert_eq!(
            column_values(&frame, "activity_id"),
            vec!["123".to_string(), "456".to_string()]
        );
    }

    #[test]
    fn test_missing_file_is_input_error() {
        let result = read_input_csv(Path::new("/nonexistent/input.csv"));
        assert!(matches!(result, Err(PipelineError::Input { .. })));
    }
}
