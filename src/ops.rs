//! Operator-category predicates
//!
//! Static categorization of operator kinds, used to decide fusibility
//! and quantizability of graph regions. The operator set is open
//! (tags are strings), so unknown ops simply fall outside every
//! category.

/// Unary elementwise operators
pub fn is_unary_op(op_type: &str) -> bool {
    matches!(
        op_type,
        "Neg" | "Sqrt"
            | "Abs"
            | "Log"
            | "Exp"
            | "Not"
            | "Cast"
            | "Floor"
            | "Ceil"
            | "Round"
            | "Erf"
            | "Gelu"
            | "Sin"
            | "Cos"
            | "Atan"
            | "Sign"
            | "IsNaN"
            | "IsInf"
            | "LeakyRelu"
            | "Elu"
            | "Tanh"
            | "Sigmoid"
            | "Softmax"
            | "Softplus"
            | "InstanceNormalization"
            | "CumSum"
    )
}

/// Binary elementwise operators
pub fn is_binary_op(op_type: &str) -> bool {
    matches!(
        op_type,
        "Add" | "Sub"
            | "Mul"
            | "Pow"
            | "Div"
            | "Min"
            | "Max"
            | "Greater"
            | "GreaterOrEqual"
            | "Less"
            | "LessOrEqual"
            | "Equal"
            | "BitwiseOr"
            | "BitwiseAnd"
            | "BitwiseXor"
            | "BitShift"
    )
}

/// Reduction operators fusible by the backend compiler
pub fn is_fusible_reduction_op(op_type: &str) -> bool {
    matches!(
        op_type,
        "ReduceMax" | "ReduceMin" | "ReduceMean" | "ReduceProd" | "ReduceSum" | "TopK"
    )
}

/// Data-movement operators that copy values without computing
pub fn is_copy_op(op_type: &str) -> bool {
    matches!(
        op_type,
        "Flatten"
            | "Transpose"
            | "Concat"
            | "Split"
            | "Squeeze"
            | "Expand"
            | "ReverseSequence"
            | "Reshape"
            | "Tile"
            | "Gather"
            | "Slice"
            | "GatherElements"
            | "GatherND"
            | "ScatterElements"
            | "ScatterND"
            | "OneHot"
    )
}

/// Linear (weighted) operators
pub fn is_linear_op(op_type: &str) -> bool {
    matches!(op_type, "Conv" | "Gemm" | "MatMul")
}

/// Pointwise or elementwise fusible operators
pub fn is_pointwise_or_elementwise_op(op_type: &str) -> bool {
    is_unary_op(op_type) || is_binary_op(op_type)
}

/// Pooling and window operators
pub fn is_pooling_or_window_op(op_type: &str) -> bool {
    matches!(
        op_type,
        "AveragePool"
            | "GlobalAveragePool"
            | "MaxPool"
            | "GlobalMaxPool"
            | "GlobalLpPool"
            | "LpPool"
            | "MaxPoolGridSample"
            | "HammingWindow"
            | "BlackmanWindow"
            | "HannWindow"
    )
}

/// Normalization operators
pub fn is_normalization_op(op_type: &str) -> bool {
    matches!(
        op_type,
        "BatchNormalization"
            | "InstanceNormalization"
            | "LRN"
            | "LpNormalization"
            | "GroupNormalization"
            | "LayerNormalization"
    )
}

/// Type/precision conversion operators
pub fn is_conversion_op(op_type: &str) -> bool {
    matches!(op_type, "Cast" | "QuantizeLinear" | "DequantizeLinear")
}

/// Copy operators other than Reshape
pub fn is_non_reshape_copy_op(op_type: &str) -> bool {
    is_copy_op(op_type) && op_type != "Reshape"
}

/// Control-flow operators (If/Loop subgraphs are not analyzed)
pub fn is_control_flow_op(op_type: &str) -> bool {
    matches!(op_type, "If" | "Loop")
}

/// Operator types quantized by default by the runtime
pub fn is_default_quantizable_op(op_type: &str) -> bool {
    matches!(
        op_type,
        "Conv" | "Gemm"
            | "ArgMax"
            | "Relu"
            | "Split"
            | "MaxPool"
            | "InstanceNormalization"
            | "Softmax"
            | "Where"
            | "Squeeze"
            | "GlobalAveragePool"
            | "Pad"
            | "Resize"
            | "ConvTranspose"
            | "Gather"
            | "Sigmoid"
            | "EmbedLayerNormalization"
            | "Reshape"
            | "Unsqueeze"
            | "Transpose"
            | "MatMul"
            | "Concat"
            | "Mul"
            | "Clip"
            | "Add"
            | "LeakyRelu"
            | "AveragePool"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_ops() {
        assert!(is_linear_op("MatMul"));
        assert!(is_linear_op("Gemm"));
        assert!(is_linear_op("Conv"));
        assert!(!is_linear_op("Add"));
    }

    #[test]
    fn test_copy_ops() {
        assert!(is_copy_op("Reshape"));
        assert!(is_copy_op("Transpose"));
        assert!(!is_non_reshape_copy_op("Reshape"));
        assert!(is_non_reshape_copy_op("Transpose"));
    }

    #[test]
    fn test_pointwise_union() {
        assert!(!is_pointwise_or_elementwise_op("Relu"));
        assert!(is_pointwise_or_elementwise_op("Sigmoid"));
        assert!(is_pointwise_or_elementwise_op("Add"));
        assert!(!is_pointwise_or_elementwise_op("MatMul"));
    }

    #[test]
    fn test_conversion_ops() {
        assert!(is_conversion_op("QuantizeLinear"));
        assert!(is_conversion_op("DequantizeLinear"));
        assert!(is_conversion_op("Cast"));
        assert!(!is_conversion_op("Identity"));
    }
}
