use anyhow::{Error, Result};
use ndarray::{array, Array1, Array2, ArrayD};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use vessel_roi_heads::{
    BoxFeatureExtractor, DetectionHead, FeatureMaps, LengthRegressionHead, Linear, Mode,
    PredictorHead, RoiHeadError, RoiHeads, RoiHeadsConfig, RoiLosses, Target,
};

/// Uses the raw proposal coordinates as pooled features.
struct CoordinateFeatures;

impl BoxFeatureExtractor for CoordinateFeatures {
    fn extract(
        &self,
        _features: &FeatureMaps,
        proposals: &[Array2<f32>],
        _image_shapes: &[(usize, usize)],
    ) -> Result<ArrayD<f32>, Error> {
        let rows: Vec<f32> = proposals.iter().flat_map(|p| p.iter().copied()).collect();
        let n = rows.len() / 4;
        Ok(Array2::from_shape_vec((n, 4), rows)?.into_shape((n, 4, 1, 1))?.into_dyn())
    }
}

/// Always favours class 1, keeps proposals as boxes and predicts the box width as length.
fn width_predictor() -> PredictorHead {
    PredictorHead::new(
        Linear::new(Array2::zeros((4, 4)), array![0.0, 3.0, 0.0, 0.0]).unwrap(),
        Linear::new(Array2::zeros((16, 4)), Array1::zeros(16)).unwrap(),
        Linear::new(array![[-1.0, 0.0, 1.0, 0.0]], array![0.0]).unwrap(),
    )
    .unwrap()
}

fn roi_heads(predictor: PredictorHead, seed: u64) -> RoiHeads<CoordinateFeatures> {
    let head = LengthRegressionHead::new(&RoiHeadsConfig::default(), predictor).unwrap();
    RoiHeads::new(CoordinateFeatures, Box::new(head), Some(seed))
}

#[test]
fn inference_returns_detections_per_image() {
    let mut heads = roi_heads(width_predictor(), 0);
    let proposals = vec![
        array![[10.0, 10.0, 40.0, 20.0], [100.0, 100.0, 112.0, 130.0]],
        array![[0.0, 0.0, 8.0, 8.0]],
    ];

    let result = heads
        .forward(&FeatureMaps::new(), &proposals, &[(200, 200), (50, 50)], Mode::Inference)
        .unwrap()
        .into_inference()
        .unwrap();

    assert_eq!(result.detections.len(), 2);
    let first = &result.detections[0];
    assert_eq!(first.len(), 2);
    assert!(first.labels.iter().all(|&l| l == 1));
    let mut lengths = first.lengths.to_vec();
    lengths.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(lengths, vec![12.0, 30.0]);
    let only = result.detections[1].iter().next().unwrap();
    assert_eq!(only.bbox, [0.0, 0.0, 8.0, 8.0]);
    assert_eq!(only.length, 8.0);
}

#[test]
fn training_reports_three_named_losses() {
    let mut heads = roi_heads(width_predictor(), 42);
    let proposals = vec![array![
        [10.0, 10.0, 40.0, 20.0],
        [60.0, 60.0, 90.0, 80.0],
        [150.0, 0.0, 160.0, 10.0]
    ]];
    let targets =
        vec![Target::new(array![[10.0, 10.0, 40.0, 20.0]], array![1], Some(array![25.0])).unwrap()];

    let result = heads
        .forward(&FeatureMaps::new(), &proposals, &[(200, 200)], Mode::Training(&targets))
        .unwrap()
        .into_training()
        .unwrap();

    let losses = result.losses.to_map();
    assert_eq!(
        losses.keys().copied().collect::<Vec<_>>(),
        vec!["loss_box_reg", "loss_classifier", "loss_vessel_length"]
    );
    // both positives have width 30 against a label of 25
    assert!((result.losses.loss_vessel_length - 25.0).abs() < 1e-4);
    assert!(result.losses.loss_box_reg.abs() < 1e-6);
    assert!(result.losses.loss_classifier.is_finite());
}

/// 700 overlapping proposals on a grid, more negatives than one sampled batch holds.
fn dense_scene() -> (Vec<Array2<f32>>, Vec<Target>) {
    let proposals = vec![Array2::from_shape_fn((700, 4), |(i, c)| {
        let x = (i % 35) as f32 * 6.0;
        let y = (i / 35) as f32 * 6.0;
        [x, y, x + 12.0, y + 12.0][c]
    })];
    let targets = vec![Target::new(
        array![[0.0, 0.0, 12.0, 12.0], [30.0, 30.0, 42.0, 42.0]],
        array![1, 3],
        Some(array![14.0, 0.0]),
    )
    .unwrap()];
    (proposals, targets)
}

fn train_once(mut heads: RoiHeads<CoordinateFeatures>) -> RoiLosses {
    let (proposals, targets) = dense_scene();
    heads
        .forward(&FeatureMaps::new(), &proposals, &[(256, 256)], Mode::Training(&targets))
        .unwrap()
        .into_training()
        .unwrap()
        .losses
}

#[test]
fn training_is_reproducible_with_a_seed() {
    let predictor = PredictorHead::new_random(4, 4, &mut StdRng::seed_from_u64(3));

    let first = train_once(roi_heads(predictor.clone(), 9));
    let second = train_once(roi_heads(predictor, 9));

    assert_eq!(first, second);
}

#[test]
fn sampler_seed_is_taken_from_config() {
    let config = RoiHeadsConfig::from_json_str(r#"{"sampler_seed": 7}"#).unwrap();
    let predictor = PredictorHead::new_random(4, 4, &mut StdRng::seed_from_u64(3));
    let build = || {
        let head = LengthRegressionHead::new(&config, predictor.clone()).unwrap();
        RoiHeads::from_config(CoordinateFeatures, Box::new(head), &config)
    };

    let runs: Vec<RoiLosses> = (0..3).map(|_| train_once(build())).collect();

    assert!(runs.iter().all(|losses| *losses == runs[0]));
    assert_eq!(runs[0], train_once(roi_heads(predictor.clone(), 7)));
}

#[test]
fn image_without_objects_trains_on_background_only() {
    let mut heads = roi_heads(width_predictor(), 1);
    let proposals = vec![array![[10.0, 10.0, 40.0, 20.0], [60.0, 60.0, 90.0, 80.0]]];
    let targets = vec![Target::new(Array2::zeros((0, 4)), Array1::zeros(0), None).unwrap()];

    let losses = heads
        .forward(&FeatureMaps::new(), &proposals, &[(100, 100)], Mode::Training(&targets))
        .unwrap()
        .into_training()
        .unwrap()
        .losses;

    assert!(losses.loss_classifier.is_finite());
    assert_eq!(losses.loss_box_reg, 0.0);
    assert!(!losses.length_loss_defined());
}

#[test]
fn mismatched_batch_is_rejected() {
    let mut heads = roi_heads(width_predictor(), 1);
    let proposals = vec![array![[10.0, 10.0, 40.0, 20.0]]];

    let err = heads
        .forward(&FeatureMaps::new(), &proposals, &[(100, 100), (100, 100)], Mode::Inference)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<RoiHeadError>(), Some(RoiHeadError::ShapeMismatch { .. })));

    let err = heads
        .forward(&FeatureMaps::new(), &proposals, &[(100, 100)], Mode::Training(&[]))
        .unwrap_err();
    assert!(err.downcast_ref::<RoiHeadError>().is_some());
}

#[test]
fn head_is_usable_through_the_trait_object() {
    let head: Box<dyn DetectionHead> =
        Box::new(LengthRegressionHead::new(&RoiHeadsConfig::default(), width_predictor()).unwrap());
    let features = array![[0.0_f32, 0.0, 5.0, 5.0]].into_dyn();

    let outputs = head.predict(features.view()).unwrap();

    assert_eq!(outputs.length_pred.to_vec(), vec![5.0]);
    assert_eq!(outputs.class_logits.row(0).to_vec(), vec![0.0, 3.0, 0.0, 0.0]);
}
