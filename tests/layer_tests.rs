use htoa::layers::{BatchNorm2d, Conv2DLayer, FeedForwardLayer, Layer, MaxPoolLayer, Sequential};
use htoa::activation::ActivationLayer;
use htoa::BlockKind;
use htoa::block::NormSettings;
use ndarray::{Array2, Array4};
use rand::{rngs::StdRng, SeedableRng};

fn rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

#[test]
fn test_layer_initialization() {
    let layer = FeedForwardLayer::new(8, 1, &mut rng());

    assert_eq!(layer.inputs, 8);
    assert_eq!(layer.neurons, 1);
    assert_eq!(layer.weights.value.dim(), (1, 8));
    assert!(layer.bias.grad.iter().all(|&g| g == 0.0));
}

#[test]
#[should_panic(expected = "Input size does not match layer's input size")]
fn test_forward_propagate_invalid_input_size() {
    let layer = FeedForwardLayer::new(8, 1, &mut rng());
    layer.infer(&Array2::zeros((2, 5)));
}

#[test]
#[should_panic(expected = "Input channels do not match layer's input channels")]
fn test_conv_rejects_wrong_channels() {
    let conv = Conv2DLayer::new(3, 4, (3, 3), 1, 1, &mut rng());
    conv.infer(&Array4::zeros((1, 1, 8, 8)));
}

#[test]
fn test_stem_shapes() {
    let mut rng = rng();
    let mut stem = Sequential::default();
    stem.push(Conv2DLayer::new(1, 8, (7, 7), 2, 3, &mut rng));
    stem.push(BatchNorm2d::new(8, 0.1, 1e-5));
    stem.push(ActivationLayer::relu());
    stem.push(MaxPoolLayer::new((3, 3), 2, 1));

    let out = stem.forward(&Array4::from_elem((2, 1, 64, 64), 0.3));
    assert_eq!(out.dim(), (2, 8, 16, 16));
    assert!(out.iter().all(|&v| v >= 0.0));

    let grad = stem.backward(&Array4::ones(out.raw_dim()));
    assert_eq!(grad.dim(), (2, 1, 64, 64));
    assert_eq!(stem.parameter_count(), 8 * 49 + 2 * 8);
}

#[test]
fn test_parameter_count() {
    let norm = NormSettings { momentum: 0.1, epsilon: 1e-5 };
    let test_cases = vec![
        // 3x3 8->8, 3x3 8->8, two batch norms, identity shortcut
        (BlockKind::Basic, 8, 8, 1, 8 * 8 * 9 * 2 + 2 * 2 * 8),
        // same body with 4->8 input, plus 1x1 projection and its batch norm
        (BlockKind::Basic, 4, 8, 2, 4 * 8 * 9 + 8 * 8 * 9 + 2 * 2 * 8 + 4 * 8 + 2 * 8),
        // 1x1 16->4, 3x3 4->4, 1x1 4->16, identity shortcut
        (BlockKind::Bottleneck, 16, 4, 1, 16 * 4 + 4 * 4 * 9 + 4 * 16 + 2 * (4 + 4 + 16)),
    ];

    for (kind, in_channels, planes, stride, expected) in test_cases {
        let block = kind.build(in_channels, planes, stride, norm, &mut rng());
        assert_eq!(block.parameter_count(), expected, "{kind} block {in_channels}->{planes}");
    }
}

#[test]
fn test_identity_block_keeps_shape() {
    let norm = NormSettings { momentum: 0.1, epsilon: 1e-5 };
    let mut block = BlockKind::Bottleneck.build(16, 4, 1, norm, &mut rng());
    assert!(!block.has_projection());

    let input = Array4::from_shape_fn((2, 16, 5, 5), |(n, c, y, x)| ((n + c + y * x) % 7) as f64 - 3.0);
    let out = block.forward(&input);
    assert_eq!(out.dim(), input.dim());
    assert_eq!(block.backward(&Array4::ones(out.raw_dim())).dim(), input.dim());
}
