// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, TensorError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Linearly interpolated percentile over `values`, `q` in [0, 100].
pub fn percentile(values: &[f32], q: f32) -> PureResult<f32> {
    if values.is_empty() {
        return Err(TensorError::EmptyInput("percentile"));
    }
    if !(0.0..=100.0).contains(&q) {
        return Err(TensorError::InvalidValue { label: "percentile_rank" });
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let rank = q / 100.0 * (sorted.len() - 1) as f32;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    let fraction = rank - low as f32;
    Ok(sorted[low] + fraction * (sorted[high] - sorted[low]))
}

/// Normal/anomalous cut-off: the 90th percentile of the training scores.
pub fn decision_threshold(train_scores: &[f32]) -> PureResult<f32> {
    percentile(train_scores, 90.0)
}

fn split_category(category: &str) -> PureResult<(&str, &str)> {
    category
        .rsplit_once('_')
        .ok_or(TensorError::InvalidValue { label: "category" })
}

fn base_name(file: &str) -> &str {
    Path::new(file)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(file)
}

/// Writes the two per-section challenge CSVs: raw anomaly scores and binary
/// decisions. Both are headerless with the recording base name in the first
/// column.
#[derive(Debug)]
pub struct SubmissionWriter {
    output_dir: PathBuf,
}

impl SubmissionWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn write_rows(&self, file_name: String, rows: Vec<String>) -> PureResult<PathBuf> {
        fs::create_dir_all(&self.output_dir).map_err(|err| TensorError::IoError {
            message: format!("{}: {err}", self.output_dir.display()),
        })?;
        let path = self.output_dir.join(file_name);
        let mut content = rows.join("\n");
        content.push('\n');
        fs::write(&path, content).map_err(|err| TensorError::IoError {
            message: format!("{}: {err}", path.display()),
        })?;
        info!(path = %path.display(), "wrote submission file");
        Ok(path)
    }

    /// `category` is `<machine>_<section>`; one score row per test recording.
    pub fn write_anomaly_scores(
        &self,
        category: &str,
        files: &[String],
        scores: &[f32],
    ) -> PureResult<PathBuf> {
        if files.len() != scores.len() {
            return Err(TensorError::DataLength {
                expected: files.len(),
                got: scores.len(),
            });
        }
        let (machine, section) = split_category(category)?;
        let rows = files
            .iter()
            .zip(scores.iter())
            .map(|(file, score)| format!("{},{score}", base_name(file)))
            .collect();
        self.write_rows(
            format!("anomaly_score_{machine}_section_{section}_test.csv"),
            rows,
        )
    }

    /// Binary rows: `1` when the score exceeds the threshold.
    pub fn write_decisions(
        &self,
        category: &str,
        files: &[String],
        scores: &[f32],
        threshold: f32,
    ) -> PureResult<PathBuf> {
        if files.len() != scores.len() {
            return Err(TensorError::DataLength {
                expected: files.len(),
                got: scores.len(),
            });
        }
        let (machine, section) = split_category(category)?;
        let rows = files
            .iter()
            .zip(scores.iter())
            .map(|(file, score)| {
                let decision = if *score > threshold { 1 } else { 0 };
                format!("{},{decision}", base_name(file))
            })
            .collect();
        self.write_rows(
            format!("decision_result_{machine}_section_{section}_test.csv"),
            rows,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_linearly() {
        let scores: Vec<f32> = (1..=10).map(|i| i as f32 / 10.0).collect();
        let threshold = decision_threshold(&scores).unwrap();
        assert!((threshold - 0.91).abs() < 1e-6);
        assert_eq!(percentile(&[2.0, 1.0, 3.0], 0.0).unwrap(), 1.0);
        assert_eq!(percentile(&[2.0, 1.0, 3.0], 100.0).unwrap(), 3.0);
        assert_eq!(percentile(&[2.0, 1.0, 3.0], 50.0).unwrap(), 2.0);
    }

    #[test]
    fn percentile_rejects_bad_inputs() {
        assert!(percentile(&[], 90.0).is_err());
        assert!(percentile(&[1.0], 101.0).is_err());
    }

    #[test]
    fn score_file_uses_base_names_and_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SubmissionWriter::new(dir.path());
        let files = vec![
            "data/fan/test/section_00_0001.wav".to_string(),
            "data/fan/test/section_00_0002.wav".to_string(),
        ];
        let path = writer
            .write_anomaly_scores("fan_00", &files, &[0.25, 1.5])
            .unwrap();
        assert!(path.ends_with("anomaly_score_fan_section_00_test.csv"));
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "section_00_0001.wav,0.25");
        assert_eq!(lines[1], "section_00_0002.wav,1.5");
    }

    #[test]
    fn decisions_compare_strictly_against_the_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SubmissionWriter::new(dir.path());
        let files = vec!["a.wav".to_string(), "b.wav".to_string(), "c.wav".to_string()];
        let path = writer
            .write_decisions("valve_02", &files, &[0.5, 0.91, 0.95], 0.91)
            .unwrap();
        assert!(path.ends_with("decision_result_valve_section_02_test.csv"));
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "a.wav,0\nb.wav,0\nc.wav,1\n");
    }

    #[test]
    fn category_without_section_suffix_is_rejected() {
        let writer = SubmissionWriter::new(".");
        assert!(writer
            .write_anomaly_scores("fan", &["a.wav".to_string()], &[0.1])
            .is_err());
    }
}
