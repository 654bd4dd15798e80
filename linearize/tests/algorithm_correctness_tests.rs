//! Algorithm correctness tests
//!
//! End-to-end checks of calibration and correction on data with a known
//! ground truth, plus the small worked scenarios the algorithms are built
//! around.

use approx::assert_relative_eq;
use ndarray::Array4;
use pmt_linearize::{
    ChannelPair, EstimationStage, ImageStack, LinearizeConfig, LinearizeError, PmtResponse,
    UnmixingRatio, build_curve, estimate_ratio,
};
use std::collections::BTreeMap;

/// True photon counts on a fine grid, so every detected level is hit many times
fn fine_truth(max: f64) -> Vec<f64> {
    (0..(max * 4.0) as usize).map(|k| k as f64 * 0.25).collect()
}

/// Mean true count behind every detected level of the bright channel
fn mean_truth_per_level(pair: &ChannelPair, truth: &[f64]) -> BTreeMap<u64, (f64, f64)> {
    let mut sums: BTreeMap<u64, (f64, f64)> = BTreeMap::new();
    for (&x, &t) in pair.xs().iter().zip(truth) {
        let entry = sums.entry(x as u64).or_insert((0.0, 0.0));
        entry.0 += t;
        entry.1 += 1.0;
    }
    sums
}

/// Linear data through a saturating detector, calibrated and corrected,
/// comes back close to the truth
#[test]
fn test_round_trip_recovers_linear_values() {
    let pmt = PmtResponse::default();
    let truth = fine_truth(200.0);
    let pair = pmt
        .simulate_pair(&truth, UnmixingRatio::new(2.0).unwrap())
        .unwrap();
    let config = LinearizeConfig::default();

    let estimate = estimate_ratio(&pair, &config).unwrap();
    assert_relative_eq!(estimate.xs_per_y.value(), 2.0, epsilon = 0.02);

    let build = build_curve(&pair, estimate.xs_per_y, &config).unwrap();
    assert!(!build.swapped);
    assert!(build.skipped.is_empty(), "skipped: {:?}", build.skipped);

    let curve = &build.curve;
    for (level, (sum, count)) in mean_truth_per_level(&pair, &truth) {
        let expected = sum / count;
        let corrected = curve.correct(level as f64, false).unwrap();
        assert!(
            (corrected - expected).abs() <= 0.05 * expected + 2.0,
            "level {level}: corrected {corrected:.2}, true mean {expected:.2}"
        );
    }

    // The raw detector under-reports at the top; the curve undoes most of it
    let top = curve.max_detected();
    assert!(curve.correct(top, false).unwrap() > top * 1.5);
}

#[test]
fn test_identity_below_half_ceiling() {
    let pmt = PmtResponse::default();
    let truth = fine_truth(120.0);
    let pair = pmt
        .simulate_pair(&truth, UnmixingRatio::new(2.0).unwrap())
        .unwrap();
    let config = LinearizeConfig::default();
    let estimate = estimate_ratio(&pair, &config).unwrap();
    let curve = build_curve(&pair, estimate.xs_per_y, &config).unwrap().curve;

    for x in 0..13 {
        let x = x as f64;
        assert_eq!(curve.correct(x, false).unwrap(), x);
    }
}

#[test]
fn test_identical_channels_ratio_is_one() {
    let readings: Vec<f64> = (0..60).flat_map(|v| [v as f64, v as f64]).collect();
    let pair = ChannelPair::new(readings.clone(), readings).unwrap();
    let estimate = estimate_ratio(&pair, &LinearizeConfig::default()).unwrap();
    assert_eq!(estimate.stage, EstimationStage::Bounded);
    assert_relative_eq!(estimate.xs_per_y.value(), 1.0, epsilon = 1e-12);
}

/// X stays linear, Y flattens out above 15
#[test]
fn test_saturating_channel_default_settings() {
    let chan_x = vec![0.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0];
    let chan_y = vec![0.0, 5.0, 10.0, 15.0, 19.0, 22.0, 24.0];
    let pair = ChannelPair::new(chan_x.clone(), chan_y.clone()).unwrap();

    // X levels 15 and 20 lie in (10, 25), the swapped pass adds Y level 22
    match estimate_ratio(&pair, &LinearizeConfig::default()) {
        Err(LinearizeError::InsufficientData { needed, found, .. }) => {
            assert_eq!((needed, found), (5, 3));
        }
        other => panic!("expected InsufficientData, got {other:?}"),
    }

    let estimate = estimate_ratio(
        &pair,
        &LinearizeConfig {
            min_points: 2,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(estimate.stage, EstimationStage::Bounded);
    let ratio = estimate.xs_per_y.value();
    assert_relative_eq!(ratio, 1.026, epsilon = 1e-3);

    // Both medians are 15, so X stays primary and the saturating channel is
    // the reference. No level reads above the primary or above max_lin_val.
    let build = build_curve(&pair, estimate.xs_per_y, &LinearizeConfig::default()).unwrap();
    assert!(!build.swapped);
    assert!(build.skipped.is_empty());
    assert!(build.non_monotone_levels.is_empty());

    // below max_lin_val / 2 the curve is the identity
    assert_relative_eq!(build.curve.correct(5.0, false).unwrap(), 5.0, epsilon = 1e-12);
    assert_relative_eq!(build.curve.correct(10.0, false).unwrap(), 10.0, epsilon = 1e-12);
    for (&x, &y) in chan_x.iter().zip(&chan_y).skip(3) {
        assert_relative_eq!(build.curve.correct(x, false).unwrap(), ratio * y, epsilon = 1e-9);
    }
}

/// Same readings, curve built from the saturating channel's side
#[test]
fn test_saturating_channel_corrected_toward_linear_one() {
    let chan_x = vec![0.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0];
    let chan_y = vec![0.0, 5.0, 10.0, 15.0, 19.0, 22.0, 24.0];
    let pair = ChannelPair::new(chan_x.clone(), chan_y.clone()).unwrap();

    // Seven readings leave at most three levels inside the default band
    let ratio_config = LinearizeConfig {
        min_points: 1,
        ..Default::default()
    };
    let estimate = estimate_ratio(&pair, &ratio_config).unwrap();
    assert_relative_eq!(estimate.xs_per_y.value(), 1.0, epsilon = 0.05);

    // The median rule keeps the linear X primary (see the test above), so
    // the saturating channel is put first by hand and its ratio inverted.
    // max_lin_val 31 trusts the linear reference up to 30, which skips the
    // prefix correction and scales its readings straight into true values.
    let build_config = LinearizeConfig {
        max_lin_val: 31.0,
        ..Default::default()
    };
    let saturating_first = pair.swapped();
    let build = build_curve(&saturating_first, estimate.xs_per_y.inverse(), &build_config).unwrap();
    assert!(!build.swapped);
    assert_eq!(build.non_monotone_levels, vec![19.0, 22.0, 24.0]);

    for (&raw, &linear) in chan_y.iter().zip(&chan_x).skip(4) {
        let corrected = build.curve.correct(raw, false).unwrap();
        assert!(corrected > raw, "{raw} was not pushed up ({corrected})");
        assert!(
            (corrected - linear).abs() <= 0.05 * linear,
            "{raw} corrected to {corrected}, expected about {linear}"
        );
    }
}

#[test]
fn test_correction_boundary() {
    let pmt = PmtResponse::default();
    let truth = fine_truth(80.0);
    let pair = pmt
        .simulate_pair(&truth, UnmixingRatio::new(2.0).unwrap())
        .unwrap();
    let config = LinearizeConfig::default();
    let estimate = estimate_ratio(&pair, &config).unwrap();
    let curve = build_curve(&pair, estimate.xs_per_y, &config).unwrap().curve;

    let max = curve.max_detected();
    assert!(curve.correct(max, false).is_ok());
    assert!(matches!(
        curve.correct(max + 1.0, false),
        Err(LinearizeError::Range { .. })
    ));
    assert_eq!(curve.correct(max + 1.0, true).unwrap(), f64::INFINITY);
}

#[test]
fn test_stack_correction_keeps_shape_and_channels() {
    let curve = pmt_linearize::CorrectionCurve::new(
        vec![0.0, 10.0, 20.0, 30.0],
        vec![0.0, 10.0, 25.0, 45.0],
    )
    .unwrap();
    // Z=2, Y=2, X=2, C=2
    let data = Array4::from_shape_fn((2, 2, 2, 2), |(z, y, x, c)| (z * 8 + y * 4 + x * 2 + c) as u16 * 2);
    let stack = ImageStack::new(data);

    let corrected = curve.correct_stack(&stack, false).unwrap();
    assert_eq!(corrected.dim(), (2, 2, 2, 2));
    assert_relative_eq!(corrected[[0, 0, 0, 0]], 0.0);
    // 30 is the top knot
    assert_relative_eq!(corrected[[1, 1, 1, 1]], 45.0);
    // 14 lies between 10 and 20: 10 + 0.4 * 15
    assert_relative_eq!(corrected[[0, 1, 1, 1]], 16.0);
}

#[test]
fn test_insufficient_data_reports_partial_points() {
    let pair = ChannelPair::new(vec![0.0, 12.0, 200.0], vec![0.0, 12.0, 150.0]).unwrap();
    match estimate_ratio(&pair, &LinearizeConfig::default()) {
        Err(LinearizeError::InsufficientData { found, partial, .. }) => {
            assert_eq!(found, 1);
            assert_eq!(partial.len(), 1);
        }
        other => panic!("expected InsufficientData, got {other:?}"),
    }
}
