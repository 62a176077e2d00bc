use graphfuse_core::{
    op::{Conv2d, Op},
    tensor::Tensor,
};
use ndarray::{linalg, s, Array3, Array4, Array6, ArrayView3, ArrayView4};

use crate::RunError;

/// im2col + per-group matmul. Supports strides, dilations, groups and
/// asymmetric zero padding. Expects `op.padding` in the resolved
/// `[top, left, bottom, right]` form produced by shape inference.
pub fn run(op: &Conv2d, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<(), RunError> {
    let input = inputs[Op::CONV2D_IN];
    let weight = inputs[Op::CONV2D_WEIGHT];
    let output = &mut outputs[0];

    let kernel = &op.kernel_shape;
    let stride = &op.strides;
    let dilation = &op.dilations;
    let padding = &op.padding;
    if padding.len() != 4 {
        return Err(RunError::UnsupportedOp(
            "Conv2d with unresolved padding".into(),
        ));
    }

    let group = op.group as usize;
    let [batch, in_c, h_in, w_in] =
        <[usize; 4]>::try_from(input.dims().as_slice()).expect("input must be 4d");
    let [_, out_c, h_out, w_out] =
        <[usize; 4]>::try_from(output.dims().as_slice()).expect("output must be 4d");
    let in_c_per_g = in_c / group;
    let out_c_per_g = out_c / group;

    let mut padded = Array4::<f32>::zeros([
        batch,
        in_c,
        h_in + padding[0] + padding[2],
        w_in + padding[1] + padding[3],
    ]);
    padded
        .slice_mut(s![
            ..,
            ..,
            padding[0]..h_in + padding[0],
            padding[1]..w_in + padding[1]
        ])
        .assign(&ArrayView4::from_shape([batch, in_c, h_in, w_in], input.data::<f32>()).unwrap());

    let weight_ = ArrayView3::from_shape(
        [group, out_c_per_g, in_c_per_g * kernel[0] * kernel[1]],
        weight.data::<f32>(),
    )
    .unwrap();

    let mut output_ = inputs.get(Op::CONV2D_BIAS).map_or_else(
        || Array3::zeros([group, out_c_per_g, batch * h_out * w_out]),
        |bias| {
            ArrayView3::from_shape([group, out_c_per_g, 1], bias.data::<f32>())
                .unwrap()
                .broadcast([group, out_c_per_g, batch * h_out * w_out])
                .unwrap()
                .to_owned()
        },
    );

    let mut col = Array6::<f32>::zeros([batch, in_c, kernel[0], kernel[1], h_out, w_out]);
    for fy in 0..kernel[0] {
        let y0 = fy * dilation[0];
        let y_end = y0 + stride[0] * (h_out - 1) + 1;
        for fx in 0..kernel[1] {
            let x0 = fx * dilation[1];
            let x_end = x0 + stride[1] * (w_out - 1) + 1;
            col.slice_mut(s![.., .., fy, fx, .., ..])
                .assign(&padded.slice(s![.., .., y0..y_end;stride[0], x0..x_end;stride[1]]));
        }
    }

    let col = col.permuted_axes([1, 2, 3, 0, 4, 5]);
    let col = col
        .as_standard_layout()
        .into_shape([
            group,
            in_c_per_g * kernel[0] * kernel[1],
            batch * h_out * w_out,
        ])
        .unwrap();

    for g in 0..group {
        linalg::general_mat_mul(
            1.0,
            &weight_.slice(s![g, .., ..]),
            &col.slice(s![g, .., ..]),
            1.0,
            &mut output_.slice_mut(s![g, .., ..]),
        );
    }

    let output_ = output_
        .into_shape([out_c, batch, h_out, w_out])
        .unwrap()
        .permuted_axes([1, 0, 2, 3]);

    output.set_raw_vec(output_.as_standard_layout().to_owned().into_raw_vec());

    Ok(())
}
