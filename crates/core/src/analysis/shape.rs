use std::borrow::Cow;

use rustc_hash::FxHashMap;

use thiserror::Error;

use crate::{
    model::Model,
    node::NodeId,
    op::Op,
    tensor::TypedShape,
    value::ValueId,
};

#[derive(Debug, Clone, Error)]
pub enum ShapeError {
    #[error("Something went wrong: {0}")]
    Message(Cow<'static, str>),
}

impl Op {
    /// Computes the output shapes of the operation.
    /// `self` could be overwritten (e.g. if auto_pad is given, conv paddings
    /// are resolved to the explicit `[top, left, bottom, right]` form).
    pub fn compute_output_shapes(
        &mut self,
        inputs: &[&TypedShape],
    ) -> Result<Vec<TypedShape>, ShapeError> {
        let mut shapes = vec![];

        match self {
            Op::Conv2d(conv) => {
                let input = &inputs[Op::CONV2D_IN].dims;
                let weight = &inputs[Op::CONV2D_WEIGHT].dims;
                let kernel = &conv.kernel_shape;
                let stride = &conv.strides;
                let dilations = &conv.dilations;

                if input.len() != 4 || weight.len() != 4 {
                    return Err(ShapeError::Message(
                        "Conv2d: Input and weight must be 4-dimensional".into(),
                    ));
                }
                if kernel.len() != 2 || stride.len() != 2 || dilations.len() != 2 {
                    return Err(ShapeError::Message(
                        "Conv2d: Kernel, strides and dilations must have 2 elements".into(),
                    ));
                }
                let group = conv.group as usize;
                if group == 0 || input[1] != weight[1] * group || weight[0] % group != 0 {
                    return Err(ShapeError::Message(
                        format!(
                            "Conv2d: Input channels ({}) do not match weight ({:?}) with group={}",
                            input[1], weight, conv.group
                        )
                        .into(),
                    ));
                }
                if kernel[0] != weight[2] || kernel[1] != weight[3] {
                    return Err(ShapeError::Message(
                        format!(
                            "Conv2d: kernel_shape {kernel:?} disagrees with weight {weight:?}"
                        )
                        .into(),
                    ));
                }

                let auto_pad = &conv.auto_pad;
                let padding = &conv.padding;
                let pad_h;
                let pad_w;
                if !auto_pad.is_empty() && auto_pad != "NOTSET" {
                    if auto_pad != "SAME_UPPER" {
                        return Err(ShapeError::Message(
                            format!("Conv2d: Unsupported auto_pad: {auto_pad}").into(),
                        ));
                    }
                    let out0 = (input[2] as f32 / stride[0] as f32).ceil() as usize;
                    let out1 = (input[3] as f32 / stride[1] as f32).ceil() as usize;
                    let pad0 = ((out0 - 1) * stride[0] + dilations[0] * (kernel[0] - 1) + 1)
                        .saturating_sub(input[2]);
                    let pad1 = ((out1 - 1) * stride[1] + dilations[1] * (kernel[1] - 1) + 1)
                        .saturating_sub(input[3]);
                    conv.padding = vec![pad0 / 2, pad1 / 2, pad0 - pad0 / 2, pad1 - pad1 / 2].into();
                    pad_h = pad0;
                    pad_w = pad1;
                } else if padding.len() == 2 {
                    pad_h = padding[0] * 2;
                    pad_w = padding[1] * 2;
                    conv.padding = vec![padding[0], padding[1], padding[0], padding[1]].into();
                } else if padding.len() == 4 {
                    pad_h = padding[0] + padding[2];
                    pad_w = padding[1] + padding[3];
                } else {
                    return Err(ShapeError::Message(
                        format!("Conv2d: Unknown padding pattern: {padding:?}").into(),
                    ));
                }

                let h_out = (input[2] + pad_h)
                    .checked_sub(dilations[0] * (kernel[0] - 1) + 1)
                    .map(|x| x / stride[0] + 1);
                let w_out = (input[3] + pad_w)
                    .checked_sub(dilations[1] * (kernel[1] - 1) + 1)
                    .map(|x| x / stride[1] + 1);
                let (Some(h_out), Some(w_out)) = (h_out, w_out) else {
                    return Err(ShapeError::Message(
                        "Conv2d: Kernel does not fit into the padded input".into(),
                    ));
                };

                shapes.push(TypedShape::new(
                    vec![input[0], weight[0], h_out, w_out].into(),
                    inputs[Op::CONV2D_IN].elem_ty,
                ));
            }
            Op::BatchNormalization(_) => {
                let input = inputs[Op::BATCH_NORM_IN];
                if input.dims.len() < 2 {
                    return Err(ShapeError::Message(
                        "BatchNormalization: Input must have a channel dimension".into(),
                    ));
                }
                shapes.push(TypedShape::new(input.dims.clone(), input.elem_ty));
            }
            Op::ReLU => {
                let input = inputs[0];
                shapes.push(TypedShape::new(input.dims.clone(), input.elem_ty));
            }
            Op::MaxPool(maxpool) => {
                let input = &inputs[0].dims;
                let kernel = &maxpool.kernel_shape;
                let stride = &maxpool.strides;

                if input.len() != 4 {
                    return Err(ShapeError::Message(
                        "MaxPool: Input must be 4-dimensional".into(),
                    ));
                }

                let padding = &maxpool.padding;
                if padding.len() == 2 {
                    maxpool.padding =
                        vec![padding[0], padding[1], padding[0], padding[1]].into();
                } else if padding.len() != 4 {
                    return Err(ShapeError::Message(
                        format!("MaxPool: Unknown padding pattern: {padding:?}").into(),
                    ));
                }
                let padding = &maxpool.padding;

                let h_out = (input[2] + padding[0] + padding[2])
                    .checked_sub(kernel[0])
                    .map(|x| x / stride[0] + 1);
                let w_out = (input[3] + padding[1] + padding[3])
                    .checked_sub(kernel[1])
                    .map(|x| x / stride[1] + 1);
                let (Some(h_out), Some(w_out)) = (h_out, w_out) else {
                    return Err(ShapeError::Message(
                        "MaxPool: Kernel does not fit into the padded input".into(),
                    ));
                };

                shapes.push(TypedShape::new(
                    vec![input[0], input[1], h_out, w_out].into(),
                    inputs[0].elem_ty,
                ));
            }
            Op::Add => {
                let x = &inputs[0].dims;
                let y = &inputs[1].dims;
                let Some(shape) = x.broadcast(y) else {
                    return Err(ShapeError::Message(
                        format!("Add: Cannot broadcast {x:?} and {y:?}").into(),
                    ));
                };
                shapes.push(TypedShape::new(shape, inputs[0].elem_ty));
            }
        }

        Ok(shapes)
    }
}

/// Infer `TypedShape`s of output tensors for each node.
/// Nodes whose input shapes are not (yet) known are skipped.
pub fn infer_shapes(
    model: &Model,
    shapes: &mut FxHashMap<NodeId, (Op, Vec<TypedShape>)>,
    value_shapes: &mut FxHashMap<ValueId, TypedShape>,
) -> Result<(), ShapeError> {
    for (&val_id, tensor) in model.graph.inits.iter() {
        value_shapes.insert(
            val_id,
            TypedShape::new(tensor.dims().clone(), tensor.elem_ty()),
        );
    }
    for &val_id in &model.graph.inputs {
        let Some(shape) = &model.graph.values[val_id].shape else {
            continue;
        };
        value_shapes.insert(val_id, shape.clone());
    }

    'nodes: for node_id in model.topo_sort_nodes() {
        let node = &model.graph.nodes[node_id];
        let mut op = node.op.clone();
        let mut inputs = vec![];
        for input in &node.inputs {
            let Some(input) = value_shapes.get(input) else {
                continue 'nodes;
            };
            inputs.push(input.clone());
        }
        let inputs = inputs.iter().collect::<Vec<_>>();
        let output_shapes = op.compute_output_shapes(&inputs)?;
        for (&val, shape) in node.outputs.iter().zip(output_shapes.iter()) {
            value_shapes.insert(val, shape.clone());
        }
        shapes.insert(node_id, (op, output_shapes));
    }

    Ok(())
}

#[cfg(test)]
use crate::{op::Conv2d, tensor::TensorElemType};

#[test]
fn infer_shapes_through_the_graph() {
    use crate::{node::Node, tensor::Tensor};

    let mut m = Model::default();
    let x = m.graph.values.new_val_named_and_shaped(
        "x",
        TypedShape::new(vec![1, 12, 64, 64].into(), TensorElemType::F32),
    );
    let w = m.graph.values.new_val();
    m.graph
        .inits
        .insert(w, Tensor::zeros::<f32>(vec![16, 12, 3, 3].into()));
    let conv_out = m.graph.values.new_val();
    m.add_node(
        Node::new(Op::Conv2d(Conv2d {
            kernel_shape: vec![3, 3].into(),
            strides: vec![1, 1].into(),
            padding: vec![1, 1].into(),
            dilations: vec![1, 1].into(),
            group: 1,
            ..Default::default()
        }))
        .with_ins(vec![x, w])
        .with_out(conv_out),
    );
    let relu_out = m.graph.values.new_val();
    m.add_node(Node::new(Op::ReLU).with_in(conv_out).with_out(relu_out));
    m.graph.inputs.push(x);
    m.graph.outputs.push(relu_out);

    let mut shapes = FxHashMap::default();
    let mut value_shapes = FxHashMap::default();
    infer_shapes(&m, &mut shapes, &mut value_shapes).unwrap();

    assert_eq!(value_shapes[&conv_out].dims, vec![1, 16, 64, 64].into());
    assert_eq!(value_shapes[&relu_out].dims, vec![1, 16, 64, 64].into());
    assert_eq!(shapes.len(), 2);
}

#[test]
fn conv2d_shapes() {
    let mut op = Op::Conv2d(Conv2d {
        kernel_shape: vec![3, 3].into(),
        strides: vec![1, 1].into(),
        padding: vec![0, 0].into(),
        dilations: vec![1, 1].into(),
        group: 1,
        ..Default::default()
    });
    let input = TypedShape::new(vec![1, 12, 64, 64].into(), TensorElemType::F32);
    let weight = TypedShape::new(vec![16, 12, 3, 3].into(), TensorElemType::F32);
    let out = op.compute_output_shapes(&[&input, &weight]).unwrap();
    assert_eq!(out[0].dims, vec![1, 16, 62, 62].into());
}

#[test]
fn conv2d_same_upper_with_dilation() {
    let mut op = Op::Conv2d(Conv2d {
        auto_pad: "SAME_UPPER".into(),
        kernel_shape: vec![3, 3].into(),
        strides: vec![1, 1].into(),
        padding: vec![].into(),
        dilations: vec![1, 2].into(),
        group: 2,
        ..Default::default()
    });
    let input = TypedShape::new(vec![1, 28, 20, 20].into(), TensorElemType::F32);
    let weight = TypedShape::new(vec![32, 14, 3, 3].into(), TensorElemType::F32);
    let out = op.compute_output_shapes(&[&input, &weight]).unwrap();
    assert_eq!(out[0].dims, vec![1, 32, 20, 20].into());
    // Padding resolved to the explicit form.
    if let Op::Conv2d(conv) = &op {
        assert_eq!(conv.padding, vec![1, 2, 1, 2].into());
    }
}

#[test]
fn conv2d_group_mismatch() {
    let mut op = Op::Conv2d(Conv2d {
        kernel_shape: vec![3, 3].into(),
        strides: vec![1, 1].into(),
        padding: vec![0, 0].into(),
        dilations: vec![1, 1].into(),
        group: 3,
        ..Default::default()
    });
    let input = TypedShape::new(vec![1, 12, 8, 8].into(), TensorElemType::F32);
    let weight = TypedShape::new(vec![16, 12, 3, 3].into(), TensorElemType::F32);
    assert!(op.compute_output_shapes(&[&input, &weight]).is_err());
}

#[test]
fn maxpool_shapes() {
    use crate::op::MaxPool;

    let mut op = Op::MaxPool(MaxPool {
        kernel_shape: vec![2, 2].into(),
        strides: vec![2, 2].into(),
        padding: vec![0, 0].into(),
    });
    let input = TypedShape::new(vec![1, 8, 28, 28].into(), TensorElemType::F32);
    let out = op.compute_output_shapes(&[&input]).unwrap();
    assert_eq!(out[0].dims, vec![1, 8, 14, 14].into());
}

#[test]
fn add_broadcast_shapes() {
    let mut op = Op::Add;
    let x = TypedShape::new(vec![1, 8, 28, 28].into(), TensorElemType::F32);
    let y = TypedShape::new(vec![8, 1, 1].into(), TensorElemType::F32);
    let out = op.compute_output_shapes(&[&x, &y]).unwrap();
    assert_eq!(out[0].dims, vec![1, 8, 28, 28].into());

    let z = TypedShape::new(vec![7, 1, 1].into(), TensorElemType::F32);
    assert!(op.compute_output_shapes(&[&x, &z]).is_err());
}
