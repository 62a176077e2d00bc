pub mod conv_bn_fusion;
