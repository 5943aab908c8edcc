//! Calibration data plumbing
//!
//! A calibration data reader yields one input-feed mapping per
//! calibration step. The core consumes a reader in a single pass
//! unless the fast path caches activations; restartability is the
//! caller's concern.

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::graph::{DataType, Graph, TensorData, TensorKind};

/// One input feed: tensor name to value
pub type Feed = HashMap<String, TensorData>;

/// Source of calibration feeds, finite
pub trait CalibrationDataReader {
    /// Next feed, or `None` when the data is exhausted
    fn next_feed(&mut self) -> Option<Feed>;

    /// Drain the remaining feeds into memory
    fn collect_feeds(&mut self) -> Vec<Feed> {
        let mut feeds = Vec::new();
        while let Some(feed) = self.next_feed() {
            feeds.push(feed);
        }
        feeds
    }
}

/// Reader over pre-built feeds
pub struct VecDataReader {
    feeds: std::vec::IntoIter<Feed>,
}

impl VecDataReader {
    pub fn new(feeds: Vec<Feed>) -> Self {
        Self {
            feeds: feeds.into_iter(),
        }
    }
}

impl CalibrationDataReader for VecDataReader {
    fn next_feed(&mut self) -> Option<Feed> {
        self.feeds.next()
    }
}

/// Synthesizes random feeds from a graph's input signature.
///
/// Float inputs get uniform values in `[0, 1)`; integer inputs get
/// zeros (index-like inputs must stay in range, and zero always is).
/// Unknown or dynamic dimensions collapse to 1.
pub struct RandomDataProvider {
    feeds: std::vec::IntoIter<Feed>,
}

impl RandomDataProvider {
    pub fn from_graph(graph: &Graph, num_samples: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut feeds = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            feeds.push(random_feed(graph, &mut rng));
        }
        Self {
            feeds: feeds.into_iter(),
        }
    }
}

impl CalibrationDataReader for RandomDataProvider {
    fn next_feed(&mut self) -> Option<Feed> {
        self.feeds.next()
    }
}

/// Build one random feed for the graph's external inputs
pub fn random_feed(graph: &Graph, rng: &mut StdRng) -> Feed {
    let mut feed = Feed::new();
    for &input in graph.inputs() {
        let tensor = graph.tensor(input);
        let (dtype, shape) = match &tensor.kind {
            TensorKind::Variable { dtype, shape } => (*dtype, shape.clone()),
            // Initializers listed as inputs are not fed
            TensorKind::Constant(_) => continue,
        };
        let dims: Vec<usize> = shape
            .unwrap_or_default()
            .iter()
            .map(|&d| if d > 0 { d as usize } else { 1 })
            .collect();
        let count: usize = dims.iter().product();
        let data = match dtype {
            DataType::I32 | DataType::I64 | DataType::Bool => TensorData::I64(
                ArrayD::from_elem(IxDyn(&dims), 0i64),
            ),
            DataType::I8 => TensorData::I8(ArrayD::from_elem(IxDyn(&dims), 0i8)),
            DataType::F32 | DataType::F16 => {
                let values: Vec<f32> = (0..count).map(|_| rng.gen::<f32>()).collect();
                TensorData::F32(ArrayD::from_shape_vec(IxDyn(&dims), values).unwrap())
            }
        };
        feed.insert(tensor.name.clone(), data);
    }
    feed
}
