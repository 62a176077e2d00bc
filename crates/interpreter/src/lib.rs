pub mod conv2d;

use std::borrow::Cow;

use graphfuse_core::{
    analysis::shape::ShapeError,
    model::Model,
    op::{BatchNormalization, MaxPool, Op},
    tensor::{Tensor, TypedShape},
    value::ValueId,
};
use ndarray::{ArrayViewD, IxDyn};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Graph takes {expected} inputs but {got} were provided")]
    WrongInputCount { expected: usize, got: usize },

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("Value fed to a node was never computed")]
    MissingValue,

    #[error("Unsupported operation: {0}")]
    UnsupportedOp(Cow<'static, str>),
}

/// Evaluates the graph on the given inputs in topological order. This is a
/// reference evaluator: correctness over speed.
pub fn run(model: &Model, inputs: &[Tensor]) -> Result<Vec<Tensor>, RunError> {
    if inputs.len() != model.graph.inputs.len() {
        return Err(RunError::WrongInputCount {
            expected: model.graph.inputs.len(),
            got: inputs.len(),
        });
    }

    let mut values: FxHashMap<ValueId, Tensor> = model.graph.inits.clone();
    for (&id, tensor) in model.graph.inputs.iter().zip(inputs.iter()) {
        values.insert(id, tensor.clone());
    }

    for node_id in model.topo_sort_nodes() {
        let node = &model.graph.nodes[node_id];
        let mut op = node.op.clone();
        log::trace!(
            "running {}",
            node.name.as_deref().unwrap_or_else(|| op.name())
        );
        let outputs = {
            let mut ins = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                ins.push(values.get(input).ok_or(RunError::MissingValue)?);
            }
            let in_shapes = ins
                .iter()
                .map(|t| TypedShape::new(t.dims().clone(), t.elem_ty()))
                .collect::<Vec<_>>();
            let out_shapes = op.compute_output_shapes(&in_shapes.iter().collect::<Vec<_>>())?;
            let mut outs = out_shapes
                .iter()
                .map(|shape| Tensor::zeros_of_type(shape.elem_ty, shape.dims.clone()))
                .collect::<Vec<_>>();
            compute(&op, &ins, &mut outs)?;
            outs
        };
        for (&val, out) in node.outputs.iter().zip(outputs.into_iter()) {
            values.insert(val, out);
        }
    }

    model
        .graph
        .outputs
        .iter()
        .map(|id| values.get(id).cloned().ok_or(RunError::MissingValue))
        .collect()
}

fn compute(op: &Op, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<(), RunError> {
    match op {
        Op::Conv2d(conv) => conv2d::run(conv, inputs, outputs),
        Op::BatchNormalization(norm) => batch_norm(norm, inputs, outputs),
        Op::ReLU => relu(inputs, outputs),
        Op::MaxPool(maxpool) => max_pool(maxpool, inputs, outputs),
        Op::Add => add(inputs, outputs),
    }
}

/// Inference-mode normalization over the channel axis of an NCHW tensor.
fn batch_norm(
    norm: &BatchNormalization,
    inputs: &[&Tensor],
    outputs: &mut [Tensor],
) -> Result<(), RunError> {
    if norm.training_mode {
        return Err(RunError::UnsupportedOp(
            "training-mode BatchNormalization".into(),
        ));
    }

    let x = inputs[Op::BATCH_NORM_IN];
    let scale = inputs[Op::BATCH_NORM_SCALE].data::<f32>();
    let shift = inputs[Op::BATCH_NORM_BIAS].data::<f32>();
    let mean = inputs[Op::BATCH_NORM_MEAN].data::<f32>();
    let var = inputs[Op::BATCH_NORM_VAR].data::<f32>();

    let dims = x.dims();
    let channels = dims[1];
    let spatial = dims[2..].iter().product::<usize>();
    let y = outputs[0].data_mut::<f32>();

    for (i, (xs, ys)) in x
        .data::<f32>()
        .chunks(spatial)
        .zip(y.chunks_mut(spatial))
        .enumerate()
    {
        let c = i % channels;
        let m = scale[c] / (var[c] + norm.epsilon).sqrt();
        for (x, y) in xs.iter().zip(ys.iter_mut()) {
            *y = (x - mean[c]) * m + shift[c];
        }
    }

    Ok(())
}

fn relu(inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<(), RunError> {
    for (x, y) in inputs[0]
        .data::<f32>()
        .iter()
        .zip(outputs[0].data_mut::<f32>())
    {
        *y = x.max(0.);
    }
    Ok(())
}

fn max_pool(op: &MaxPool, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<(), RunError> {
    let x = inputs[0];
    let [batch, channels, h_in, w_in] =
        <[usize; 4]>::try_from(x.dims().as_slice()).expect("input must be 4d");
    let h_out = outputs[0].dims()[2];
    let w_out = outputs[0].dims()[3];
    let kernel = &op.kernel_shape;
    let stride = &op.strides;
    let padding = &op.padding;
    if padding.len() != 4 {
        return Err(RunError::UnsupportedOp(
            "MaxPool with unresolved padding".into(),
        ));
    }

    let data = x.data::<f32>();
    let out = outputs[0].data_mut::<f32>();
    for plane in 0..batch * channels {
        let xs = &data[plane * h_in * w_in..][..h_in * w_in];
        let ys = &mut out[plane * h_out * w_out..][..h_out * w_out];
        for oy in 0..h_out {
            for ox in 0..w_out {
                let mut max = f32::NEG_INFINITY;
                for ky in 0..kernel[0] {
                    for kx in 0..kernel[1] {
                        let iy = (oy * stride[0] + ky).wrapping_sub(padding[0]);
                        let ix = (ox * stride[1] + kx).wrapping_sub(padding[1]);
                        if iy < h_in && ix < w_in {
                            max = max.max(xs[iy * w_in + ix]);
                        }
                    }
                }
                ys[oy * w_out + ox] = max;
            }
        }
    }

    Ok(())
}

fn add(inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<(), RunError> {
    let out_dims = outputs[0].dims().as_slice().to_vec();
    let broadcast_of = |t: &Tensor| {
        ArrayViewD::from_shape(IxDyn(t.dims().as_slice()), t.data::<f32>())
            .ok()
            .and_then(|view| view.broadcast(IxDyn(&out_dims)).map(|b| b.to_owned()))
            .ok_or_else(|| RunError::UnsupportedOp("Add operand is not broadcastable".into()))
    };
    let a = broadcast_of(inputs[0])?;
    let b = broadcast_of(inputs[1])?;
    for ((y, a), b) in outputs[0]
        .data_mut::<f32>()
        .iter_mut()
        .zip(a.iter())
        .zip(b.iter())
    {
        *y = a + b;
    }
    Ok(())
}

#[cfg(test)]
use graphfuse_core::{node::Node, op::Conv2d};

#[cfg(test)]
fn single_node_model(op: Op, inits: Vec<Tensor>, input_dims: Vec<usize>) -> (Model, Tensor) {
    use graphfuse_core::tensor::TensorElemType;

    let mut m = Model::default();
    let x = m.graph.values.new_val_named_and_shaped(
        "x",
        TypedShape::new(input_dims.clone().into(), TensorElemType::F32),
    );
    let mut ins = vec![x];
    for init in inits {
        let id = m.graph.values.new_val();
        m.graph.inits.insert(id, init);
        ins.push(id);
    }
    let out = m.graph.values.new_val();
    m.add_node(Node::new(op).with_ins(ins).with_out(out));
    m.graph.inputs.push(x);
    m.graph.outputs.push(out);

    let n: usize = input_dims.iter().product();
    let input = Tensor::new(input_dims.into(), (1..=n).map(|i| i as f32).collect());
    (m, input)
}

#[test]
fn conv2d_simple() {
    let weight = Tensor::new(vec![1, 1, 2, 2].into(), vec![1.0f32; 4]);
    let bias = Tensor::new(vec![1].into(), vec![10.0f32]);
    let (m, x) = single_node_model(
        Op::Conv2d(Conv2d {
            kernel_shape: vec![2, 2].into(),
            strides: vec![1, 1].into(),
            padding: vec![0, 0].into(),
            dilations: vec![1, 1].into(),
            group: 1,
            ..Default::default()
        }),
        vec![weight, bias],
        vec![1, 1, 3, 3],
    );
    // x = 1..9 row-major; each output is the window sum plus the bias.
    let y = &run(&m, &[x]).unwrap()[0];
    assert_eq!(y.dims().as_slice(), &[1, 1, 2, 2]);
    assert_eq!(y.data::<f32>(), &[22.0, 26.0, 34.0, 38.0]);
}

#[test]
fn conv2d_dilated() {
    let weight = Tensor::new(vec![1, 1, 2, 2].into(), vec![1.0f32; 4]);
    let (m, x) = single_node_model(
        Op::Conv2d(Conv2d {
            kernel_shape: vec![2, 2].into(),
            strides: vec![1, 1].into(),
            padding: vec![0, 0].into(),
            dilations: vec![2, 2].into(),
            group: 1,
            ..Default::default()
        }),
        vec![weight],
        vec![1, 1, 4, 4],
    );
    let y = &run(&m, &[x]).unwrap()[0];
    assert_eq!(y.dims().as_slice(), &[1, 1, 2, 2]);
    assert_eq!(y.data::<f32>(), &[24.0, 28.0, 40.0, 44.0]);
}

#[test]
fn conv2d_grouped() {
    let weight = Tensor::new(vec![2, 1, 1, 1].into(), vec![3.0f32, 5.0]);
    let (m, x) = single_node_model(
        Op::Conv2d(Conv2d {
            kernel_shape: vec![1, 1].into(),
            strides: vec![1, 1].into(),
            padding: vec![0, 0].into(),
            dilations: vec![1, 1].into(),
            group: 2,
            ..Default::default()
        }),
        vec![weight],
        vec![1, 2, 1, 2],
    );
    // x = [1, 2 | 3, 4]; channel 0 scaled by 3, channel 1 by 5.
    let y = &run(&m, &[x]).unwrap()[0];
    assert_eq!(y.data::<f32>(), &[3.0, 6.0, 15.0, 20.0]);
}

#[test]
fn batch_norm_inference() {
    use graphfuse_core::op::BatchNormalization;

    let scale = Tensor::new(vec![2].into(), vec![2.0f32, 0.5]);
    let shift = Tensor::new(vec![2].into(), vec![1.0f32, -1.0]);
    let mean = Tensor::new(vec![2].into(), vec![1.0f32, 2.0]);
    let var = Tensor::new(vec![2].into(), vec![0.25f32, 4.0]);
    let (m, x) = single_node_model(
        Op::BatchNormalization(BatchNormalization {
            epsilon: 0.0,
            momentum: 0.9,
            training_mode: false,
        }),
        vec![scale, shift, mean, var],
        vec![1, 2, 1, 2],
    );
    // x = [1, 2 | 3, 4]
    let y = &run(&m, &[x]).unwrap()[0];
    assert_eq!(y.data::<f32>(), &[1.0, 5.0, -0.75, -0.5]);
}

#[test]
fn relu_clamps_negative() {
    let mut m = Model::default();
    let x = m.graph.values.new_val();
    let out = m.graph.values.new_val();
    m.add_node(Node::new(Op::ReLU).with_in(x).with_out(out));
    m.graph.inputs.push(x);
    m.graph.outputs.push(out);
    let input = Tensor::new(vec![4].into(), vec![-1.0f32, 0.0, 2.0, -3.5]);
    let y = &run(&m, &[input]).unwrap()[0];
    assert_eq!(y.data::<f32>(), &[0.0, 0.0, 2.0, 0.0]);
}

#[test]
fn max_pool_2x2() {
    use graphfuse_core::op::MaxPool;

    let (m, x) = single_node_model(
        Op::MaxPool(MaxPool {
            kernel_shape: vec![2, 2].into(),
            strides: vec![2, 2].into(),
            padding: vec![0, 0].into(),
        }),
        vec![],
        vec![1, 1, 4, 4],
    );
    let y = &run(&m, &[x]).unwrap()[0];
    assert_eq!(y.data::<f32>(), &[6.0, 8.0, 14.0, 16.0]);
}

#[test]
fn add_broadcasts_channelwise() {
    let b = Tensor::new(vec![2, 1, 1].into(), vec![10.0f32, 20.0]);
    let (m, x) = single_node_model(Op::Add, vec![b], vec![1, 2, 1, 2]);
    let y = &run(&m, &[x]).unwrap()[0];
    assert_eq!(y.data::<f32>(), &[11.0, 12.0, 23.0, 24.0]);
}

#[test]
fn wrong_input_count() {
    let (m, x) = single_node_model(Op::ReLU, vec![], vec![1, 1, 2, 2]);
    assert!(matches!(
        run(&m, &[x.clone(), x]),
        Err(RunError::WrongInputCount { .. })
    ));
}
