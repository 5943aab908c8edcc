//! Quantizable-region analysis
//!
//! Walks the graph to find quantizable weight tensors, locate
//! attention partitions, classify residual adds, and build the
//! exclusion lists that keep unsupported or unfusible regions out of
//! quantization.

mod mha;
mod partitions;
mod residual;
mod weights;

pub use mha::{
    find_mha_partitions, find_nodes_from_mha_to_exclude, find_nodes_to_exclude,
    expand_node_names_from_patterns, MhaExcludeOptions,
};
pub use partitions::{
    classify_partition_nodes, filter_quantizable_kgen_heads, NoQuantizeInput,
};
pub use residual::build_non_residual_input_map;
pub use weights::{find_quantizable_weights, WeightPack, EXCLUDE_NODE_SUBSTRINGS};
