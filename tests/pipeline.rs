// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use machine_listener::dataset::LabelEncoder;
use machine_listener::ensemble::{Ensemble, EnsembleConfig, ScoredSplit, TrainingSplit};
use machine_listener::metrics::{evaluate_sections, summarize};
use machine_listener::model::EmbeddingNetConfig;
use machine_listener::scoring::{length_norm, Branch, ClusterScorer, ScoreTensor, SplitView};
use machine_listener::submission::{decision_threshold, SubmissionWriter};
use machine_listener::trainer::{FitData, TrainerConfig};
use machine_listener::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;

/// Unit vectors clustered around a direction in 4-D, with seeded jitter.
fn jittered_rows(direction: [f32; 4], count: usize, rng: &mut StdRng) -> Vec<f32> {
    let mut values = Vec::with_capacity(count * 4);
    for _ in 0..count {
        for v in direction {
            values.push(v + rng.gen::<f32>() * 0.05);
        }
    }
    values
}

struct SyntheticSplits {
    train: Tensor,
    train_labels: Vec<usize>,
    train_source: Vec<bool>,
    eval: Tensor,
    eval_labels: Vec<usize>,
    eval_source: Vec<bool>,
    unknown: Tensor,
    unknown_labels: Vec<usize>,
    unknown_source: Vec<bool>,
}

/// Two sections with cleanly separated normal and anomalous directions.
/// Every split carries both domains so the per-domain metrics are defined.
fn synthetic_splits() -> SyntheticSplits {
    let mut rng = StdRng::seed_from_u64(11);
    let normal_0 = [1.0, 0.0, 0.0, 0.0];
    let normal_1 = [0.0, 1.0, 0.0, 0.0];
    let anomaly_0 = [0.0, 0.0, 1.0, 0.0];
    let anomaly_1 = [0.0, 0.0, 0.0, 1.0];

    let mut train_values = jittered_rows(normal_0, 6, &mut rng);
    train_values.extend(jittered_rows(normal_1, 6, &mut rng));
    let train = length_norm(&Tensor::from_vec(12, 4, train_values).unwrap()).unwrap();
    let train_labels = vec![0; 6].into_iter().chain(vec![1; 6]).collect();
    // Last row of each class block is the lone target-domain sample.
    let train_source = vec![
        true, true, true, true, true, false, true, true, true, true, true, false,
    ];

    let mut eval_values = jittered_rows(normal_0, 4, &mut rng);
    eval_values.extend(jittered_rows(normal_1, 4, &mut rng));
    let eval = length_norm(&Tensor::from_vec(8, 4, eval_values).unwrap()).unwrap();
    let eval_labels = vec![0, 0, 0, 0, 1, 1, 1, 1];
    let eval_source = vec![true, true, false, false, true, true, false, false];

    let mut unknown_values = jittered_rows(anomaly_0, 4, &mut rng);
    unknown_values.extend(jittered_rows(anomaly_1, 4, &mut rng));
    let unknown = length_norm(&Tensor::from_vec(8, 4, unknown_values).unwrap()).unwrap();
    let unknown_labels = vec![0, 0, 0, 0, 1, 1, 1, 1];
    let unknown_source = vec![true, true, false, false, true, true, false, false];

    SyntheticSplits {
        train,
        train_labels,
        train_source,
        eval,
        eval_labels,
        eval_source,
        unknown,
        unknown_labels,
        unknown_source,
    }
}

fn score_synthetic(data: &SyntheticSplits) -> (ScoreTensor, ScoreTensor) {
    let mut eval_scores = ScoreTensor::new(8, 2);
    let mut unknown_scores = ScoreTensor::new(8, 2);
    let scorer = ClusterScorer::new(2, 0, false).unwrap();
    let train_view = SplitView::new(&data.train, &data.train_labels).unwrap();
    let eval_view = SplitView::new(&data.eval, &data.eval_labels).unwrap();
    let unknown_view = SplitView::new(&data.unknown, &data.unknown_labels).unwrap();
    scorer
        .score_splits(
            train_view,
            &data.train_source,
            &mut [
                (eval_view, &mut eval_scores),
                (unknown_view, &mut unknown_scores),
            ],
            2,
        )
        .unwrap();
    (eval_scores, unknown_scores)
}

#[test]
fn clustering_and_scoring_are_deterministic_under_a_fixed_seed() {
    let data = synthetic_splits();
    let (eval_a, unknown_a) = score_synthetic(&data);
    let (eval_b, unknown_b) = score_synthetic(&data);
    for sample in 0..8 {
        for class in 0..2 {
            for branch in [Branch::Target, Branch::Source] {
                assert_eq!(
                    eval_a.get(sample, class, branch).unwrap(),
                    eval_b.get(sample, class, branch).unwrap()
                );
                assert_eq!(
                    unknown_a.get(sample, class, branch).unwrap(),
                    unknown_b.get(sample, class, branch).unwrap()
                );
            }
        }
    }
}

#[test]
fn separable_sections_evaluate_to_perfect_detection() {
    let data = synthetic_splits();
    let (eval_scores, unknown_scores) = score_synthetic(&data);
    let encoder = LabelEncoder::fit(["fan_00".to_string(), "fan_02".to_string()]);

    let metrics = evaluate_sections(
        &eval_scores,
        &data.eval_labels,
        &data.eval_source,
        &unknown_scores,
        &data.unknown_labels,
        &data.unknown_source,
        &encoder,
    )
    .unwrap();
    assert_eq!(metrics.len(), 2);
    for section in &metrics {
        assert!((section.auc - 1.0).abs() < 1e-6, "{:?}", section);
        assert!((section.p_auc - 1.0).abs() < 1e-6);
        assert!((section.auc_source - 1.0).abs() < 1e-6);
        assert!((section.auc_target - 1.0).abs() < 1e-6);
    }
    assert_eq!(metrics[0].category, "fan_00");
    assert_eq!(metrics[1].category, "fan_02");

    let summary = summarize(&metrics).unwrap();
    assert!((summary.auc - 1.0).abs() < 1e-6);
    assert!((summary.p_auc - 1.0).abs() < 1e-6);
}

#[test]
fn submission_files_follow_the_challenge_layout() {
    let dir = tempfile::tempdir().unwrap();
    let writer = SubmissionWriter::new(dir.path());

    let train_scores: Vec<f32> = (1..=10).map(|i| i as f32 / 10.0).collect();
    let threshold = decision_threshold(&train_scores).unwrap();
    assert!((threshold - 0.91).abs() < 1e-6);

    let files: Vec<String> = (1..=5)
        .map(|i| format!("data/fan/test/section_00_{i:04}.wav"))
        .collect();
    let scores = vec![0.5, 0.95, 0.2, 0.92, 0.91];

    let score_path = writer
        .write_anomaly_scores("fan_00", &files, &scores)
        .unwrap();
    let decision_path = writer
        .write_decisions("fan_00", &files, &scores, threshold)
        .unwrap();

    let score_rows: Vec<String> = fs::read_to_string(&score_path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(score_rows.len(), 5);
    assert_eq!(score_rows[0], "section_00_0001.wav,0.5");

    let decision_rows: Vec<String> = fs::read_to_string(&decision_path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    // Strict comparison: 0.91 ties the threshold and stays normal.
    assert_eq!(
        decision_rows,
        vec![
            "section_00_0001.wav,0",
            "section_00_0002.wav,1",
            "section_00_0003.wav,0",
            "section_00_0004.wav,1",
            "section_00_0005.wav,0",
        ]
    );
}

#[test]
fn tiny_model_runs_the_full_train_score_submit_loop() {
    let checkpoints = tempfile::tempdir().unwrap();
    let submissions = tempfile::tempdir().unwrap();

    let model_config = EmbeddingNetConfig {
        waveform_len: 1_024,
        fft_bins: 256,
        fft_size: 64,
        hop_size: 32,
        fft_conv_channels: 2,
        fft_dense_units: 4,
        stem_channels: 2,
        branch_dim: 4,
        num_classes: 2,
        subclusters: 2,
        mixup_prob: 0.5,
        augment_prob: 0.5,
    };

    let mut rng = StdRng::seed_from_u64(3);
    let waveforms = Tensor::from_fn(6, 1_024, |r, c| {
        let tone = if r % 2 == 0 { 0.05 } else { 0.11 };
        (c as f32 * tone).sin() + rng.gen::<f32>() * 0.01
    })
    .unwrap();
    let class_labels = vec![0usize, 1, 0, 1, 0, 1];
    let labels = Tensor::from_fn(6, 2, |r, c| {
        if class_labels[r] == c {
            1.0
        } else {
            0.0
        }
    })
    .unwrap();
    let weights = vec![1.0f32; 6];
    let source = vec![true, true, true, true, false, false];

    let mut trainer_config = TrainerConfig::new(checkpoints.path());
    trainer_config.epochs = 1;
    trainer_config.batch_size = 3;
    let mut ensemble_config = EnsembleConfig::new(trainer_config);
    ensemble_config.size = 1;

    let fit = FitData::new(&waveforms, &labels, &weights).unwrap();
    let train = TrainingSplit::new(fit, &class_labels, &source).unwrap();
    let test_split = ScoredSplit {
        waveforms: &waveforms,
        class_labels: &class_labels,
    };

    let ensemble = Ensemble::new(ensemble_config).unwrap();
    let scores = ensemble
        .run(&model_config, train, fit, &[test_split])
        .unwrap();

    let section_rows: Vec<usize> = class_labels
        .iter()
        .enumerate()
        .filter_map(|(i, &label)| (label == 0).then_some(i))
        .collect();
    let section_scores: Vec<f32> = section_rows
        .iter()
        .map(|&i| scores[0].score_for(i, 0).unwrap())
        .collect();
    assert!(section_scores.iter().all(|s| s.is_finite() && *s >= 0.0));

    let threshold = decision_threshold(&section_scores).unwrap();
    let files: Vec<String> = section_rows
        .iter()
        .map(|i| format!("section_00_{i:04}.wav"))
        .collect();
    let writer = SubmissionWriter::new(submissions.path());
    let path = writer
        .write_decisions("fan_00", &files, &section_scores, threshold)
        .unwrap();
    let rows = fs::read_to_string(path).unwrap();
    assert_eq!(rows.lines().count(), section_rows.len());
}
