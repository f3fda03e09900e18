//! Optional numeric reports emitted beside the dataset.

use crate::frame::{Frame, Scalar};

fn numeric_columns(frame: &Frame) -> Vec<(String, Vec<Option<f64>>)> {
    let mut out = Vec::new();
    for (idx, column) in frame.columns().iter().enumerate() {
        let mut values: Vec<Option<f64>> = Vec::with_capacity(frame.len());
        let mut any_numeric = false;
        for row in frame.rows() {
            let value = match &row[idx] {
                Scalar::Int(i) => {
                    any_numeric = true;
                    Some(*i as f64)
                }
                Scalar::Float(f) if f.is_finite() => {
                    any_numeric = true;
                    Some(*f)
                }
                _ => None,
            };
            values.push(value);
        }
        if any_numeric {
            out.push((column.clone(), values));
        }
    }
    out
}

fn pearson(xs: &[Option<f64>], ys: &[Option<f64>]) -> Option<(f64, usize)> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    let n = pairs.len();
    if n < 2 {
        return None;
    }
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n as f64;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in &pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt()), n))
}

/// Pairwise Pearson correlations over the numeric columns.
pub fn correlation_frame(dataset: &Frame) -> Frame {
    let mut frame = Frame::new(vec![
        "column_a".to_string(),
        "column_b".to_string(),
        "pearson_r".to_string(),
        "n".to_string(),
    ]);
    let numeric = numeric_columns(dataset);
    for i in 0..numeric.len() {
        for j in (i + 1)..numeric.len() {
            if let Some((r, n)) = pearson(&numeric[i].1, &numeric[j].1) {
                frame.push_row(vec![
                    Scalar::String(numeric[i].0.clone()),
                    Scalar::String(numeric[j].0.clone()),
                    Scalar::Float(r),
                    Scalar::Int(n as i64),
                ]);
            }
        }
    }
    frame
}

/// Count, mean, std, min, max per numeric column.
pub fn summary_frame(dataset: &Frame) -> Frame {
    let mut frame = Frame::new(vec![
        "column".to_string(),
        "count".to_string(),
        "mean".to_string(),
        "std".to_string(),
        "min".to_string(),
        "max".to_string(),
    ]);
    for (column, values) in numeric_columns(dataset) {
        let present: Vec<f64> = values.into_iter().flatten().collect();
        if present.is_empty() {
            continue;
        }
        let n = present.len();
        let mean = present.iter().sum::<f64>() / n as f64;
        let variance = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let min = present.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = present.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        frame.push_row(vec![
            Scalar::String(column),
            Scalar::Int(n as i64),
            Scalar::Float(mean),
            Scalar::Float(variance.sqrt()),
            Scalar::Float(min),
            Scalar::Float(max),
        ]);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Frame {
        let mut frame = Frame::new(vec![
            "x".to_string(),
            "y".to_string(),
            "label".to_string(),
        ]);
        for i in 0..5 {
            frame.push_row(vec![
                Scalar::Float(i as f64),
                Scalar::Float(2.0 * i as f64 + 1.0),
                Scalar::String("row".to_string()),
            ]);
        }
        frame
    }

    #[test]
    fn test_correlation_perfect_linear() {
        let report = correlation_frame(&dataset());
        assert_eq!(report.len(), 1);
        match report.get(0, "pearson_r") {
            Some(Scalar::Float(r)) => assert!((r - 1.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(report.get(0, "n"), Some(&Scalar::Int(5)));
    }

    #[test]
    fn test_summary_stats() {
        let report = summary_frame(&dataset());
        assert_eq!(report.len(), 2);
        assert_eq!(report.get(0, "column"), Some(&Scalar::String("x".to_string())));
        assert_eq!(report.get(0, "count"), Some(&Scalar::Int(5)));
        match report.get(0, "mean") {
            Some(Scalar::Float(mean)) => assert!((mean - 2.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
    }
}
