// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs;

use approx::assert_relative_eq;
use geneval::{
    compare_caches, evaluate_distance, frechet_distance, load_backbone, DirectorySource,
    EvaluationConfig, FeatureCache, FeatureMatrix, FeatureRecord, FrechetConfig, InMemorySource,
    Modality, PatchEmbedding, RunConfig, Sample, SampleSource, Sex, SliceBackbone, StorageFormat,
};
use ndarray::{array, Array2, Array4, Axis};
use tempfile::tempdir;

fn slice_network() -> PatchEmbedding {
    PatchEmbedding::new(
        2,
        2,
        array![[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        array![0.0f32, 0.0, 0.0],
    )
    .unwrap()
}

fn constant_cohort(value: f32, count: usize) -> InMemorySource {
    (0..count)
        .map(|i| Sample::constant((1, 4, 8, 8), value, 50.0 + i as f64, Sex::Unknown).unwrap())
        .collect()
}

fn textured(index: usize) -> Sample {
    let volume = Array4::from_shape_fn((1, 3, 8, 8), |(_, d, h, w)| {
        ((h * 3 + w * 5 + d + index * 7) % 13) as f32 / 13.0
    });
    Sample::new(volume, 45.0, Sex::Female).unwrap()
}

#[test]
fn all_ones_against_all_zeros_beats_real_against_itself() {
    let dir = tempdir().unwrap();
    let backbone = SliceBackbone::new("identity-2d", slice_network());
    let config = EvaluationConfig::new(Modality::Slice2d);
    let real = constant_cohort(1.0, 50);
    let fake = constant_cohort(0.0, 50);
    let real_copy = constant_cohort(1.0, 50);

    let apart = evaluate_distance(
        &real,
        &fake,
        dir.path().join("real"),
        dir.path().join("fake"),
        &backbone,
        &config,
    )
    .unwrap();
    let together = evaluate_distance(
        &real,
        &real_copy,
        dir.path().join("real-a"),
        dir.path().join("real-b"),
        &backbone,
        &config,
    )
    .unwrap();

    assert!(apart.distance.is_finite() && apart.distance >= 0.0);
    assert!(together.distance >= 0.0);
    assert!(apart.distance > together.distance);
    // Constant inputs give zero covariance, which must be regularised.
    assert!(apart.conditioning.regularization.is_some());
    assert_eq!(apart.real_samples, 50);
    // Three channels pooled from 8x8 to 4x4.
    assert_eq!(apart.feature_dim, 48);
}

#[test]
fn cached_matrix_against_itself_is_zero() {
    let dir = tempdir().unwrap();
    let cache = FeatureCache::create(dir.path(), StorageFormat::Json).unwrap();
    for index in 0..12 {
        let feature = (0..3)
            .map(|k| ((index * 7 + k * 3) % 10) as f32 / 10.0 + k as f32)
            .collect();
        cache
            .write(&FeatureRecord {
                feature,
                age: 30.0,
                sex: Sex::Male,
                source_index: index,
            })
            .unwrap();
    }
    let matrix = FeatureMatrix::load(&cache).unwrap();
    let report = frechet_distance(
        matrix.features(),
        matrix.features(),
        &FrechetConfig::default(),
    )
    .unwrap();
    assert!(report.distance.abs() < 1e-8, "distance {}", report.distance);
}

#[test]
fn distance_ignores_row_order() {
    let real = Array2::from_shape_fn((20, 3), |(i, j)| ((i * 5 + j * 11) % 17) as f64 / 17.0);
    let fake = Array2::from_shape_fn((25, 3), |(i, j)| ((i * 3 + j * 7) % 19) as f64 / 10.0);
    let mut shuffled = Array2::<f64>::zeros(fake.raw_dim());
    for (target, source) in (0..25).map(|i| (i, (i * 7) % 25)) {
        shuffled.row_mut(target).assign(&fake.row(source));
    }
    let config = FrechetConfig::default();
    let a = frechet_distance(real.view(), fake.view(), &config).unwrap();
    let b = frechet_distance(real.view(), shuffled.view(), &config).unwrap();
    assert_relative_eq!(a.distance, b.distance, epsilon = 1e-10, max_relative = 1e-10);
    let mut reversed = real.clone();
    reversed.invert_axis(Axis(0));
    let c = frechet_distance(reversed.view(), fake.view(), &config).unwrap();
    assert_relative_eq!(a.distance, c.distance, epsilon = 1e-10, max_relative = 1e-10);
}

#[test]
fn compare_caches_reproduces_the_evaluated_distance() {
    let dir = tempdir().unwrap();
    let backbone = SliceBackbone::new("identity-2d", slice_network());
    let mut config = EvaluationConfig::new(Modality::Slice2d);
    config.record_format = StorageFormat::Bincode;
    let real: InMemorySource = (0..8).map(textured).collect();
    let fake: InMemorySource = (8..14).map(textured).collect();
    let evaluated = evaluate_distance(
        &real,
        &fake,
        dir.path().join("real"),
        dir.path().join("fake"),
        &backbone,
        &config,
    )
    .unwrap();
    let compared = compare_caches(
        dir.path().join("real"),
        dir.path().join("fake"),
        &FrechetConfig::default(),
    )
    .unwrap();
    assert_relative_eq!(evaluated.distance, compared.distance, epsilon = 1e-12);
    assert_eq!(compared.backbone.as_deref(), Some("identity-2d"));
    assert_eq!(compared.fake_samples, 6);
}

#[test]
fn run_file_drives_a_full_evaluation() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let real: Vec<Sample> = (0..6).map(textured).collect();
    let fake: Vec<Sample> = (6..12).map(textured).collect();
    DirectorySource::write_all(root.join("real"), &real, StorageFormat::Json).unwrap();
    DirectorySource::write_all(root.join("fake"), &fake, StorageFormat::Bincode).unwrap();
    slice_network()
        .to_checkpoint()
        .save(root.join("weights.json"))
        .unwrap();
    fs::write(
        root.join("run.json"),
        r#"{
            "modality": "2d-slice",
            "weights": "weights.json",
            "real": { "samples": "real", "cache": "cache/real" },
            "fake": { "samples": "fake", "cache": "cache/fake" },
            "skip_existing": true,
            "output": "report.json"
        }"#,
    )
    .unwrap();

    let config = RunConfig::from_path(root.join("run.json")).unwrap();
    let report = config.execute().unwrap();
    assert!(report.distance.is_finite());
    assert_eq!(report.real_samples, 6);

    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(root.join("report.json")).unwrap()).unwrap();
    assert_eq!(written["modality"], "2d-slice");
    assert_relative_eq!(written["distance"].as_f64().unwrap(), report.distance);

    // Second pass resumes from the caches without recomputing.
    let again = config.execute().unwrap();
    assert_eq!(again.real_extraction.unwrap().skipped, 6);
    assert_relative_eq!(again.distance, report.distance, epsilon = 1e-12);

    let backbone = load_backbone(Modality::Slice2d, &root.join("weights.json")).unwrap();
    assert_eq!(backbone.name(), "patch-embed-3x3");
    let source = DirectorySource::open(root.join("fake")).unwrap();
    assert_eq!(source.len_hint(), Some(6));
}
