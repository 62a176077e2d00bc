use crate::dim::Dimensions;

/// Closed set of operation kinds. Attributed kinds carry their own struct so
/// passes can match exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Conv2d(Conv2d),
    BatchNormalization(BatchNormalization),
    ReLU,
    MaxPool(MaxPool),
    Add,
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#Conv>
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conv2d {
    pub auto_pad: String,
    pub dilations: Dimensions,
    pub group: i64,
    pub kernel_shape: Dimensions,
    pub strides: Dimensions,
    /// Either `[top, left]` (symmetric) or `[top, left, bottom, right]`.
    /// Shape inference normalizes to the 4-element form.
    pub padding: Dimensions,
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#BatchNormalization>
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchNormalization {
    pub epsilon: f32,
    pub momentum: f32,
    pub training_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MaxPool {
    pub kernel_shape: Dimensions,
    pub strides: Dimensions,
    pub padding: Dimensions,
}

impl Op {
    pub const CONV2D_IN: usize = 0;
    pub const CONV2D_WEIGHT: usize = 1;
    pub const CONV2D_BIAS: usize = 2;

    pub const BATCH_NORM_IN: usize = 0;
    pub const BATCH_NORM_SCALE: usize = 1;
    pub const BATCH_NORM_BIAS: usize = 2;
    pub const BATCH_NORM_MEAN: usize = 3;
    pub const BATCH_NORM_VAR: usize = 4;

    pub fn name(&self) -> &'static str {
        match self {
            Op::Conv2d(_) => "Conv2d",
            Op::BatchNormalization(_) => "BatchNormalization",
            Op::ReLU => "ReLU",
            Op::MaxPool(_) => "MaxPool",
            Op::Add => "Add",
        }
    }
}
