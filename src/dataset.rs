// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Recording provenance. Source recordings are abundant and carry the
/// supervised training signal; target recordings are rare domain-shifted
/// references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    Source,
    Target,
}

impl Domain {
    pub fn parse(token: &str) -> PureResult<Self> {
        match token {
            "source" => Ok(Self::Source),
            "target" => Ok(Self::Target),
            other => Err(TensorError::UnknownLabel {
                label: other.to_string(),
            }),
        }
    }

    pub fn is_source(self) -> bool {
        self == Self::Source
    }
}

/// Immutable bundle of aligned per-recording arrays for one split.
///
/// Waveform row `i` belongs to `section_ids[i]`, `files[i]`, `attributes[i]`
/// and `domains[i]`; every accessor returns views, and subsetting produces a
/// fresh bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipSet {
    waveforms: Tensor,
    section_ids: Vec<String>,
    files: Vec<String>,
    attributes: Vec<String>,
    domains: Vec<Domain>,
}

impl ClipSet {
    pub fn new(
        waveforms: Tensor,
        section_ids: Vec<String>,
        files: Vec<String>,
        attributes: Vec<String>,
        domains: Vec<Domain>,
    ) -> PureResult<Self> {
        let n = waveforms.shape().0;
        for length in [
            section_ids.len(),
            files.len(),
            attributes.len(),
            domains.len(),
        ] {
            if length != n {
                return Err(TensorError::DataLength {
                    expected: n,
                    got: length,
                });
            }
        }
        Ok(Self {
            waveforms,
            section_ids,
            files,
            attributes,
            domains,
        })
    }

    pub fn len(&self) -> usize {
        self.waveforms.shape().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn waveforms(&self) -> &Tensor {
        &self.waveforms
    }

    pub fn section_ids(&self) -> &[String] {
        &self.section_ids
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn source_mask(&self) -> Vec<bool> {
        self.domains.iter().map(|d| d.is_source()).collect()
    }

    /// Composite keys for the fine-grained training label space: one class
    /// per distinct (section, attribute, is-source) triple.
    pub fn training_keys(&self) -> Vec<String> {
        (0..self.len())
            .map(|i| {
                format!(
                    "{}###{}###{}",
                    self.section_ids[i],
                    self.attributes[i],
                    self.domains[i].is_source()
                )
            })
            .collect()
    }

    pub fn select(&self, indices: &[usize]) -> PureResult<Self> {
        let waveforms = self.waveforms.select_rows(indices)?;
        let mut section_ids = Vec::with_capacity(indices.len());
        let mut files = Vec::with_capacity(indices.len());
        let mut attributes = Vec::with_capacity(indices.len());
        let mut domains = Vec::with_capacity(indices.len());
        for &index in indices {
            if index >= self.len() {
                return Err(TensorError::InvalidDimensions {
                    rows: index,
                    cols: self.len(),
                });
            }
            section_ids.push(self.section_ids[index].clone());
            files.push(self.files[index].clone());
            attributes.push(self.attributes[index].clone());
            domains.push(self.domains[index]);
        }
        Self::new(waveforms, section_ids, files, attributes, domains)
    }

    pub fn select_mask(&self, mask: &[bool]) -> PureResult<Self> {
        if mask.len() != self.len() {
            return Err(TensorError::DataLength {
                expected: self.len(),
                got: mask.len(),
            });
        }
        let indices: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        self.select(&indices)
    }

    /// Splits into (`mask == true`, `mask == false`) bundles.
    pub fn partition(&self, mask: &[bool]) -> PureResult<(Self, Self)> {
        let kept = self.select_mask(mask)?;
        let inverted: Vec<bool> = mask.iter().map(|b| !b).collect();
        let dropped = self.select_mask(&inverted)?;
        Ok((kept, dropped))
    }

    fn cache_file(dir: &Path, sample_rate: u32, split: &str) -> PathBuf {
        dir.join(format!("{sample_rate}_{split}_raw.bin"))
    }

    /// Loads the cached split if one exists for this sample rate.
    pub fn load_cached(
        dir: impl AsRef<Path>,
        sample_rate: u32,
        split: &str,
    ) -> PureResult<Option<Self>> {
        let path = Self::cache_file(dir.as_ref(), sample_rate, split);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|err| TensorError::IoError {
            message: err.to_string(),
        })?;
        let set = bincode::deserialize(&bytes).map_err(|err| TensorError::SerializationError {
            message: err.to_string(),
        })?;
        Ok(Some(set))
    }

    pub fn save_cache(
        &self,
        dir: impl AsRef<Path>,
        sample_rate: u32,
        split: &str,
    ) -> PureResult<()> {
        let encoded = bincode::serialize(self).map_err(|err| TensorError::SerializationError {
            message: err.to_string(),
        })?;
        fs::write(Self::cache_file(dir.as_ref(), sample_rate, split), encoded).map_err(|err| {
            TensorError::IoError {
                message: err.to_string(),
            }
        })
    }
}

/// Maps string labels to dense indices, sorted for reproducibility.
#[derive(Debug, Clone, Default)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unique: BTreeSet<String> = labels
            .into_iter()
            .map(|label| label.as_ref().to_string())
            .collect();
        Self {
            classes: unique.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn transform(&self, label: &str) -> PureResult<usize> {
        self.classes
            .binary_search_by(|probe| probe.as_str().cmp(label))
            .map_err(|_| TensorError::UnknownLabel {
                label: label.to_string(),
            })
    }

    pub fn transform_all(&self, labels: &[String]) -> PureResult<Vec<usize>> {
        labels.iter().map(|label| self.transform(label)).collect()
    }

    pub fn inverse(&self, index: usize) -> PureResult<&str> {
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or(TensorError::UnknownLabel {
                label: index.to_string(),
            })
    }
}

/// Dense one-hot rows for integer class labels.
pub fn one_hot(labels: &[usize], num_classes: usize) -> PureResult<Tensor> {
    let mut out = Tensor::zeros(labels.len(), num_classes)?;
    {
        let data = out.data_mut();
        for (row, &label) in labels.iter().enumerate() {
            if label >= num_classes {
                return Err(TensorError::InvalidDimensions {
                    rows: label,
                    cols: num_classes,
                });
            }
            data[row * num_classes + label] = 1.0;
        }
    }
    Ok(out)
}

/// Per-sample weights that balance fine-grained class representation within
/// each section.
///
/// A fine-grained class first receives the count of source samples outside
/// it, then weights are normalised to sum to one within each (section,
/// source) group, and finally rescaled so the mean source weight is one.
/// Target-domain samples keep weight one through the first two passes and
/// share only the final rescale.
pub fn sample_weights(
    training_keys: &[String],
    section_labels: &[usize],
    source: &[bool],
) -> PureResult<Vec<f32>> {
    let n = training_keys.len();
    if section_labels.len() != n || source.len() != n {
        return Err(TensorError::DataLength {
            expected: n,
            got: section_labels.len().min(source.len()),
        });
    }
    if n == 0 {
        return Err(TensorError::EmptyInput("sample_weights"));
    }

    let mut weights = vec![1.0f32; n];
    let source_keys: BTreeSet<&String> = training_keys
        .iter()
        .zip(source.iter())
        .filter_map(|(key, &is_source)| is_source.then_some(key))
        .collect();
    for key in source_keys {
        let outside = (0..n)
            .filter(|&k| source[k] && training_keys[k] != **key)
            .count() as f32;
        for k in 0..n {
            if training_keys[k] == **key {
                weights[k] = outside;
            }
        }
    }

    let sections: BTreeSet<usize> = section_labels.iter().copied().collect();
    for section in sections {
        let total: f32 = (0..n)
            .filter(|&k| section_labels[k] == section && source[k])
            .map(|k| weights[k])
            .sum();
        if total > 0.0 {
            for k in 0..n {
                if section_labels[k] == section && source[k] {
                    weights[k] /= total;
                }
            }
        }
    }

    let source_count = source.iter().filter(|&&s| s).count();
    if source_count == 0 {
        return Err(TensorError::EmptyInput("sample_weights_source"));
    }
    let mean: f32 = (0..n)
        .filter(|&k| source[k])
        .map(|k| weights[k])
        .sum::<f32>()
        / source_count as f32;
    for weight in weights.iter_mut() {
        *weight /= mean;
    }
    Ok(weights)
}

/// Shuffled index batches for one epoch.
pub fn batch_indices(samples: usize, batch_size: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..samples).collect();
    order.shuffle(rng);
    order
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toy_clipset() -> ClipSet {
        let waveforms = Tensor::from_fn(4, 8, |r, c| (r * 8 + c) as f32).unwrap();
        ClipSet::new(
            waveforms,
            vec![
                "bearing_00".into(),
                "bearing_00".into(),
                "fan_01".into(),
                "fan_01".into(),
            ],
            vec!["a.wav".into(), "b.wav".into(), "c.wav".into(), "d.wav".into()],
            vec!["v1".into(), "v2".into(), "v1".into(), "v1".into()],
            vec![
                Domain::Source,
                Domain::Target,
                Domain::Source,
                Domain::Source,
            ],
        )
        .unwrap()
    }

    #[test]
    fn clipset_rejects_ragged_arrays() {
        let waveforms = Tensor::zeros(2, 4).unwrap();
        let result = ClipSet::new(
            waveforms,
            vec!["x".into()],
            vec!["a".into(), "b".into()],
            vec!["".into(), "".into()],
            vec![Domain::Source, Domain::Source],
        );
        assert!(result.is_err());
    }

    #[test]
    fn partition_splits_by_mask() {
        let set = toy_clipset();
        let (source, target) = set.partition(&set.source_mask()).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(target.len(), 1);
        assert_eq!(target.files(), &["b.wav".to_string()]);
    }

    #[test]
    fn training_keys_encode_the_triple() {
        let set = toy_clipset();
        assert_eq!(set.training_keys()[0], "bearing_00###v1###true");
        assert_eq!(set.training_keys()[1], "bearing_00###v2###false");
    }

    #[test]
    fn label_encoder_round_trips_and_rejects_unknowns() {
        let encoder = LabelEncoder::fit(["fan_01", "bearing_00", "fan_01"]);
        assert_eq!(encoder.len(), 2);
        let index = encoder.transform("fan_01").unwrap();
        assert_eq!(encoder.inverse(index).unwrap(), "fan_01");
        assert!(matches!(
            encoder.transform("gearbox_02"),
            Err(TensorError::UnknownLabel { .. })
        ));
    }

    #[test]
    fn one_hot_places_unit_mass() {
        let labels = vec![2usize, 0];
        let encoded = one_hot(&labels, 3).unwrap();
        assert_eq!(encoded.row(0).unwrap(), &[0.0, 0.0, 1.0]);
        assert_eq!(encoded.row(1).unwrap(), &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn sample_weights_balance_within_sections() {
        // Section 0 holds two source classes with 1 and 3 samples; the small
        // class must end up with the larger per-sample weight.
        let keys: Vec<String> = ["a", "b", "b", "b"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        let sections = vec![0usize, 0, 0, 0];
        let source = vec![true, true, true, true];
        let weights = sample_weights(&keys, &sections, &source).unwrap();
        assert!(weights[0] > weights[1]);
        assert!((weights[1] - weights[2]).abs() < 1e-6);
        let mean: f32 = weights.iter().sum::<f32>() / weights.len() as f32;
        assert!((mean - 1.0).abs() < 1e-5);
    }

    #[test]
    fn batch_indices_cover_every_sample_once() {
        let mut rng = StdRng::seed_from_u64(0);
        let batches = batch_indices(10, 3, &mut rng);
        assert_eq!(batches.len(), 4);
        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn cache_round_trip_preserves_the_split() {
        let set = toy_clipset();
        let dir = tempfile::tempdir().unwrap();
        set.save_cache(dir.path(), 16_000, "train").unwrap();
        let restored = ClipSet::load_cached(dir.path(), 16_000, "train")
            .unwrap()
            .unwrap();
        assert_eq!(restored.len(), set.len());
        assert_eq!(restored.files(), set.files());
        assert!(ClipSet::load_cached(dir.path(), 22_050, "train")
            .unwrap()
            .is_none());
    }
}
