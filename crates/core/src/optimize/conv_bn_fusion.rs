use std::{borrow::Cow, time::Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::{
    model::Model,
    node::NodeId,
    op::Op,
    tensor::Tensor,
    value::ValueId,
};

#[derive(Debug, Clone, Error)]
pub enum FusionError {
    /// A per-channel parameter vector disagrees with the convolution's output
    /// channel count, or a parameter has the wrong dtype.
    #[error("Shape mismatch: {0}")]
    Shape(Cow<'static, str>),

    /// `variance + epsilon <= 0` for some channel. Folding would produce
    /// NaN/Inf downstream.
    #[error("Normalization parameters out of domain: {0}")]
    Domain(Cow<'static, str>),

    /// Producer/consumer bookkeeping contradicts the matched pattern. Not
    /// expected on well-formed graphs.
    #[error("Graph invariant violated: {0}")]
    Invariant(Cow<'static, str>),
}

/// A convolution whose sole consumer is an inference-mode batch
/// normalization of its output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvBnPair {
    pub conv: NodeId,
    pub bn: NodeId,
}

/// Scans the graph in topological order for fusable pairs. Read-only; call
/// again after a rewrite to rescan.
pub fn conv_bn_candidates<'a>(
    model: &'a Model,
    value_users: &'a FxHashMap<ValueId, FxHashSet<NodeId>>,
) -> impl Iterator<Item = ConvBnPair> + 'a {
    model
        .topo_sort_nodes()
        .into_iter()
        .filter_map(move |node_id| extract_conv_bn(model, value_users, node_id))
}

fn extract_conv_bn(
    model: &Model,
    value_users: &FxHashMap<ValueId, FxHashSet<NodeId>>,
    conv_id: NodeId,
) -> Option<ConvBnPair> {
    let conv = &model.graph.nodes[conv_id];
    if !matches!(conv.op, Op::Conv2d(_)) {
        return None;
    }
    let conv_out = *conv.outputs.first()?;

    // The output must flow into exactly one consumer; fusing through a
    // branching tensor would corrupt what the other consumers observe.
    let users = value_users.get(&conv_out)?;
    if users.len() != 1 {
        return None;
    }

    let bn_id = users.iter().next().copied()?;
    let bn = &model.graph.nodes[bn_id];
    let Op::BatchNormalization(ref norm) = bn.op else {
        return None;
    };
    if norm.training_mode {
        return None;
    }
    if bn.inputs.first() != Some(&conv_out) {
        return None;
    }

    // Folding needs constants for the weight, the bias (when present) and
    // all four per-channel normalization parameters.
    let inits = &model.graph.inits;
    if conv
        .inputs
        .get(Op::CONV2D_WEIGHT)
        .is_none_or(|id| !inits.contains_key(id))
    {
        return None;
    }
    if let Some(bias) = conv.inputs.get(Op::CONV2D_BIAS) {
        if !inits.contains_key(bias) {
            return None;
        }
    }
    if bn.inputs.len() != 5 || bn.inputs[1..].iter().any(|id| !inits.contains_key(id)) {
        return None;
    }

    Some(ConvBnPair {
        conv: conv_id,
        bn: bn_id,
    })
}

/// Folds inference-mode batch normalization into the preceding convolution's
/// parameters. With `m[c] = scale[c] / sqrt(var[c] + epsilon)`:
///
///   weight'[c, ..] = weight[c, ..] * m[c]
///   bias'[c]       = bias[c] * m[c] + shift[c] - mean[c] * m[c]
///
/// The returned bias is always present, even if the convolution had none.
/// The weight's leading axis is the output channel for every group count, so
/// grouped convolutions need no special handling here.
pub fn fold_batch_norm(
    weight: &Tensor,
    bias: Option<&Tensor>,
    scale: &Tensor,
    shift: &Tensor,
    mean: &Tensor,
    var: &Tensor,
    epsilon: f32,
) -> Result<(Tensor, Tensor), FusionError> {
    if weight.dims().is_empty() || !weight.elem_ty().is_f32() {
        return Err(FusionError::Shape(
            "Weight must be a non-scalar f32 tensor".into(),
        ));
    }
    let out_channels = weight.dims()[0];

    for (name, param) in [
        ("scale", scale),
        ("shift", shift),
        ("mean", mean),
        ("variance", var),
    ] {
        if param.dims().as_slice() != [out_channels] || !param.elem_ty().is_f32() {
            return Err(FusionError::Shape(
                format!(
                    "Per-channel {name} must be a [{out_channels}] f32 vector, got {:?}",
                    param.dims()
                )
                .into(),
            ));
        }
    }
    if let Some(bias) = bias {
        if bias.dims().as_slice() != [out_channels] || !bias.elem_ty().is_f32() {
            return Err(FusionError::Shape(
                format!(
                    "Bias must be a [{out_channels}] f32 vector, got {:?}",
                    bias.dims()
                )
                .into(),
            ));
        }
    }

    // Multipliers are computed in f64 so the fused parameters lose no
    // precision relative to evaluating the two operations separately.
    let mut multipliers = Vec::with_capacity(out_channels);
    for c in 0..out_channels {
        let denom = var.data::<f32>()[c] as f64 + epsilon as f64;
        if denom <= 0.0 {
            return Err(FusionError::Domain(
                format!("variance + epsilon = {denom} for channel {c}").into(),
            ));
        }
        multipliers.push(scale.data::<f32>()[c] as f64 / denom.sqrt());
    }

    let elems_per_channel = weight.dims().total_elems() / out_channels;
    let mut new_weight = Vec::with_capacity(weight.dims().total_elems());
    for (c, chunk) in weight.data::<f32>().chunks(elems_per_channel).enumerate() {
        new_weight.extend(chunk.iter().map(|&w| (w as f64 * multipliers[c]) as f32));
    }

    let mut new_bias = Vec::with_capacity(out_channels);
    for c in 0..out_channels {
        let b = bias.map_or(0f32, |b| b.data::<f32>()[c]) as f64;
        new_bias.push(
            (b * multipliers[c] + shift.data::<f32>()[c] as f64
                - mean.data::<f32>()[c] as f64 * multipliers[c]) as f32,
        );
    }

    Ok((
        Tensor::new(weight.dims().clone(), new_weight),
        Tensor::new(vec![out_channels].into(), new_bias),
    ))
}

/// Fuses every conv+batchnorm pair in the graph, in place. A shape or domain
/// error aborts fusion for the failing pair and propagates; that pair's
/// subgraph is left untouched, and pairs already rewritten stay fused. A
/// single pass suffices: a rewrite never creates a new candidate pair.
pub fn fuse_conv_batch_norm(model: &mut Model) -> Result<(), FusionError> {
    let start = Instant::now();
    let value_users = model.get_value_users();
    let pairs = conv_bn_candidates(model, &value_users).collect::<Vec<_>>();
    let count = pairs.len();

    for pair in pairs {
        rewrite_pair(model, &value_users, pair)?;
    }

    model.remove_unnecessary_nodes();

    log::info!("fuse_conv_batch_norm({count}): {:?}", start.elapsed());

    Ok(())
}

fn rewrite_pair(
    model: &mut Model,
    value_users: &FxHashMap<ValueId, FxHashSet<NodeId>>,
    ConvBnPair { conv, bn }: ConvBnPair,
) -> Result<(), FusionError> {
    let conv_node = &model.graph.nodes[conv];
    let conv_out = conv_node.outputs[0];
    let weight_id = conv_node.inputs[Op::CONV2D_WEIGHT];
    let bias_id = conv_node.inputs.get(Op::CONV2D_BIAS).copied();

    let bn_node = &model.graph.nodes[bn];
    let bn_out = bn_node.outputs[0];
    let Op::BatchNormalization(ref norm) = bn_node.op else {
        return Err(FusionError::Invariant(
            "Matched node is not a normalization".into(),
        ));
    };
    let epsilon = norm.epsilon;
    if bn_node.inputs.first() != Some(&conv_out) {
        return Err(FusionError::Invariant(
            "Normalization no longer consumes the convolution output".into(),
        ));
    }
    let scale_id = bn_node.inputs[Op::BATCH_NORM_SCALE];
    let shift_id = bn_node.inputs[Op::BATCH_NORM_BIAS];
    let mean_id = bn_node.inputs[Op::BATCH_NORM_MEAN];
    let var_id = bn_node.inputs[Op::BATCH_NORM_VAR];

    let (new_weight, new_bias) = {
        let inits = &model.graph.inits;
        let get = |id: ValueId, what: &'static str| {
            inits.get(&id).ok_or_else(|| {
                FusionError::Invariant(format!("{what} initializer disappeared").into())
            })
        };
        let weight = get(weight_id, "weight")?;
        let bias = bias_id.map(|id| get(id, "bias")).transpose()?;
        fold_batch_norm(
            weight,
            bias,
            get(scale_id, "scale")?,
            get(shift_id, "shift")?,
            get(mean_id, "mean")?,
            get(var_id, "variance")?,
            epsilon,
        )?
    };

    // From here on nothing can fail; the graph is mutated.
    model.graph.inits.insert(weight_id, new_weight);
    match bias_id {
        Some(id) => {
            model.graph.inits.insert(id, new_bias);
        }
        None => {
            let id = model.graph.values.new_val();
            model.graph.inits.insert(id, new_bias);
            model.graph.nodes[conv].inputs.push(id);
        }
    }

    // Every consumer of the normalization's output now reads the
    // convolution's output directly; graph outputs included.
    if let Some(users) = value_users.get(&bn_out) {
        for &user_id in users {
            let user = &mut model.graph.nodes[user_id];
            for input in &mut user.inputs {
                if *input == bn_out {
                    *input = conv_out;
                }
            }
        }
    }
    for output in &mut model.graph.outputs {
        if *output == bn_out {
            *output = conv_out;
        }
    }

    model.graph.nodes[bn].deleted = true;

    // The normalization's parameter initializers are orphans now, unless
    // something else also reads them.
    for id in [scale_id, shift_id, mean_id, var_id] {
        let orphaned = value_users
            .get(&id)
            .is_none_or(|users| users.iter().all(|&user| user == bn));
        if orphaned {
            model.graph.inits.remove(&id);
        }
    }

    Ok(())
}

#[cfg(test)]
use crate::{
    node::Node,
    op::{BatchNormalization, Conv2d},
};

#[cfg(test)]
const OUT_CHANNELS: usize = 16;

#[cfg(test)]
fn vector(data: Vec<f32>) -> Tensor {
    let len = data.len();
    Tensor::new(vec![len].into(), data)
}

/// conv([1,12,h,w]) -> bn -> relu, with per-channel normalization parameters
/// supplied by the caller.
#[cfg(test)]
fn conv_bn_relu_model(
    with_conv_bias: bool,
    scale: Vec<f32>,
    shift: Vec<f32>,
    mean: Vec<f32>,
    var: Vec<f32>,
    epsilon: f32,
) -> (Model, NodeId, NodeId) {
    let mut m = Model::default();
    let x = m.graph.values.new_val_named("x");
    let w = m.graph.values.new_val_named("conv_weight");
    let conv_out = m.graph.values.new_val();
    m.graph
        .inits
        .insert(w, Tensor::rand::<f32>(vec![OUT_CHANNELS, 12, 3, 3].into()));
    let mut conv_ins = vec![x, w];
    if with_conv_bias {
        let b = m.graph.values.new_val_named("conv_bias");
        m.graph
            .inits
            .insert(b, Tensor::rand::<f32>(vec![OUT_CHANNELS].into()));
        conv_ins.push(b);
    }
    let conv = m.add_node(
        Node::new(Op::Conv2d(Conv2d {
            kernel_shape: vec![3, 3].into(),
            strides: vec![1, 1].into(),
            padding: vec![0, 0].into(),
            dilations: vec![1, 1].into(),
            group: 1,
            ..Default::default()
        }))
        .with_ins(conv_ins)
        .with_out(conv_out),
    );

    let bn_out = m.graph.values.new_val();
    let mut bn_ins = vec![conv_out];
    for (name, data) in [
        ("bn_scale", scale),
        ("bn_shift", shift),
        ("bn_mean", mean),
        ("bn_var", var),
    ] {
        let id = m.graph.values.new_val_named(name);
        m.graph.inits.insert(id, vector(data));
        bn_ins.push(id);
    }
    let bn = m.add_node(
        Node::new(Op::BatchNormalization(BatchNormalization {
            epsilon,
            momentum: 0.9,
            training_mode: false,
        }))
        .with_ins(bn_ins)
        .with_out(bn_out),
    );

    let relu_out = m.graph.values.new_val();
    m.add_node(Node::new(Op::ReLU).with_in(bn_out).with_out(relu_out));

    m.graph.inputs.push(x);
    m.graph.outputs.push(relu_out);
    (m, conv, bn)
}

#[cfg(test)]
fn identity_bn_params() -> (Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>) {
    (
        vec![1.; OUT_CHANNELS],
        vec![0.; OUT_CHANNELS],
        vec![0.; OUT_CHANNELS],
        vec![1.; OUT_CHANNELS],
    )
}

#[test]
fn fold_identity_normalization_keeps_parameters() {
    let weight = Tensor::rand::<f32>(vec![OUT_CHANNELS, 12, 3, 3].into());
    let (scale, shift, mean, var) = identity_bn_params();
    let (new_weight, new_bias) = fold_batch_norm(
        &weight,
        None,
        &vector(scale),
        &vector(shift),
        &vector(mean),
        &vector(var),
        1e-5,
    )
    .unwrap();
    assert_eq!(new_weight.dims(), weight.dims());
    assert_eq!(new_bias.dims().as_slice(), &[OUT_CHANNELS]);
    assert!(new_weight.allclose(&weight, 1e-4, 1e-4));
    assert!(new_bias.data::<f32>().iter().all(|&b| b.abs() < 1e-4));
}

#[test]
fn fold_with_bias_hand_computed() {
    // m = [2/sqrt(0.25), 0.5/sqrt(4)] = [4, 0.25]
    let weight = Tensor::new(vec![2, 1, 1, 1].into(), vec![2.0f32, -3.0]);
    let bias = vector(vec![1.0, 0.5]);
    let (new_weight, new_bias) = fold_batch_norm(
        &weight,
        Some(&bias),
        &vector(vec![2.0, 0.5]),
        &vector(vec![1.0, -1.0]),
        &vector(vec![0.5, 0.25]),
        &vector(vec![0.25, 4.0]),
        0.0,
    )
    .unwrap();
    assert_eq!(new_weight.data::<f32>(), &[8.0, -0.75]);
    assert_eq!(new_bias.data::<f32>(), &[3.0, -0.9375]);
}

#[test]
fn fold_rejects_mismatched_channel_vectors() {
    let weight = Tensor::rand::<f32>(vec![2, 1, 1, 1].into());
    let err = fold_batch_norm(
        &weight,
        None,
        &vector(vec![1.0, 1.0, 1.0]),
        &vector(vec![0.0, 0.0]),
        &vector(vec![0.0, 0.0]),
        &vector(vec![1.0, 1.0]),
        1e-5,
    )
    .unwrap_err();
    assert!(matches!(err, FusionError::Shape(_)));
}

#[test]
fn fold_rejects_non_positive_variance() {
    let weight = Tensor::rand::<f32>(vec![1, 1, 1, 1].into());
    // variance + epsilon == 0 is out of domain...
    let err = fold_batch_norm(
        &weight,
        None,
        &vector(vec![1.0]),
        &vector(vec![0.0]),
        &vector(vec![0.0]),
        &vector(vec![-1e-5]),
        1e-5,
    )
    .unwrap_err();
    assert!(matches!(err, FusionError::Domain(_)));

    // ...while variance == 0 with positive epsilon is fine.
    assert!(fold_batch_norm(
        &weight,
        None,
        &vector(vec![1.0]),
        &vector(vec![0.0]),
        &vector(vec![0.0]),
        &vector(vec![0.0]),
        1e-5,
    )
    .is_ok());
}

#[test]
fn fuse_removes_normalization_and_rewires() {
    let (scale, shift, mean, var) = identity_bn_params();
    let (mut m, conv, bn) = conv_bn_relu_model(true, scale, shift, mean, var, 1e-5);

    let value_users = m.get_value_users();
    assert_eq!(conv_bn_candidates(&m, &value_users).count(), 1);

    fuse_conv_batch_norm(&mut m).unwrap();

    assert!(m.graph.nodes[bn].deleted);
    assert!(!m.graph.nodes[conv].deleted);
    let conv_out = m.graph.nodes[conv].outputs[0];
    let relu = m
        .graph
        .nodes
        .iter()
        .find(|(_, n)| !n.deleted && matches!(n.op, Op::ReLU))
        .map(|(id, _)| id)
        .unwrap();
    assert_eq!(m.graph.nodes[relu].inputs, vec![conv_out]);

    // Rescanning the rewritten graph yields nothing.
    let value_users = m.get_value_users();
    assert_eq!(conv_bn_candidates(&m, &value_users).count(), 0);
}

#[test]
fn fuse_installs_bias_and_rewires_graph_outputs() {
    // conv (no bias) -> bn, where the bn output is the graph output.
    let (scale, shift, mean, var) = identity_bn_params();
    let (mut m, conv, bn) = conv_bn_relu_model(false, scale, shift, mean, var, 1e-5);
    let bn_out = m.graph.nodes[bn].outputs[0];
    let relu = m
        .graph
        .nodes
        .iter()
        .find(|(_, n)| !n.deleted && matches!(n.op, Op::ReLU))
        .map(|(id, _)| id)
        .unwrap();
    m.graph.nodes[relu].deleted = true;
    m.graph.outputs = vec![bn_out];

    assert_eq!(m.graph.nodes[conv].inputs.len(), 2);
    fuse_conv_batch_norm(&mut m).unwrap();

    let conv_node = &m.graph.nodes[conv];
    assert_eq!(conv_node.inputs.len(), 3);
    assert!(m.graph.inits.contains_key(&conv_node.inputs[Op::CONV2D_BIAS]));
    assert_eq!(m.graph.outputs, vec![conv_node.outputs[0]]);
}

#[test]
fn branching_output_is_never_matched() {
    let (scale, shift, mean, var) = identity_bn_params();
    let (mut m, conv, bn) = conv_bn_relu_model(true, scale, shift, mean, var, 1e-5);
    // A second consumer of the convolution output.
    let conv_out = m.graph.nodes[conv].outputs[0];
    let branch_out = m.graph.values.new_val();
    m.add_node(Node::new(Op::ReLU).with_in(conv_out).with_out(branch_out));
    m.graph.outputs.push(branch_out);

    let value_users = m.get_value_users();
    assert_eq!(conv_bn_candidates(&m, &value_users).count(), 0);

    fuse_conv_batch_norm(&mut m).unwrap();
    assert!(!m.graph.nodes[bn].deleted);
}

#[test]
fn dangling_conv_is_never_matched() {
    let mut m = Model::default();
    let x = m.graph.values.new_val_named("x");
    let w = m.graph.values.new_val_named("w");
    let conv_out = m.graph.values.new_val();
    m.graph
        .inits
        .insert(w, Tensor::rand::<f32>(vec![4, 3, 3, 3].into()));
    m.add_node(
        Node::new(Op::Conv2d(Conv2d {
            kernel_shape: vec![3, 3].into(),
            strides: vec![1, 1].into(),
            padding: vec![0, 0].into(),
            dilations: vec![1, 1].into(),
            group: 1,
            ..Default::default()
        }))
        .with_ins(vec![x, w])
        .with_out(conv_out),
    );
    m.graph.inputs.push(x);
    m.graph.outputs.push(conv_out);

    let value_users = m.get_value_users();
    assert_eq!(conv_bn_candidates(&m, &value_users).count(), 0);
}

#[test]
fn training_mode_is_never_matched() {
    let (scale, shift, mean, var) = identity_bn_params();
    let (mut m, _conv, bn) = conv_bn_relu_model(true, scale, shift, mean, var, 1e-5);
    if let Op::BatchNormalization(ref mut norm) = m.graph.nodes[bn].op {
        norm.training_mode = true;
    }
    let value_users = m.get_value_users();
    assert_eq!(conv_bn_candidates(&m, &value_users).count(), 0);
}

#[test]
fn fusion_error_leaves_pair_intact() {
    // Mismatched scale length: the matcher yields the pair, folding rejects
    // it, and the graph keeps its pre-fusion state.
    let (_, shift, mean, var) = identity_bn_params();
    let (mut m, conv, bn) = conv_bn_relu_model(true, vec![1.; 3], shift, mean, var, 1e-5);
    let weight_id = m.graph.nodes[conv].inputs[Op::CONV2D_WEIGHT];
    let weight_before = m.graph.inits[&weight_id].clone();

    let err = fuse_conv_batch_norm(&mut m).unwrap_err();
    assert!(matches!(err, FusionError::Shape(_)));
    assert!(!m.graph.nodes[bn].deleted);
    assert_eq!(m.graph.inits[&weight_id], weight_before);
}
