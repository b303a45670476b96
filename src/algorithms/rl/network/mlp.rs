//! Dense multi-layer perceptron with manual backpropagation and Adam.
//!
//! Fallback backend for builds without the `rl-nn` feature. It covers only
//! what the trainers need: ReLU layers, a linear head, Adam and global-norm
//! clipping. Anything larger belongs on libtorch.
//!
//! Architecture: `input → hidden… → output`, ReLU between layers and a
//! linear output. Weights are stored `(in, out)` so a batch forward pass is
//! `x · W + b`.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::Rng;

use super::{NamedParams, ParamTensor};
use crate::algorithms::rl::error::{RLError, Result};

#[derive(Debug, Clone)]
struct Dense {
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl Dense {
    /// Xavier/Glorot uniform initialization.
    fn new<R: Rng + ?Sized>(input: usize, output: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (input + output) as f64).sqrt();
        let weight = Array2::from_shape_fn((input, output), |_| rng.gen_range(-limit..=limit));
        Self {
            weight,
            bias: Array1::zeros(output),
        }
    }
}

/// Activations kept from a forward pass for backpropagation.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    /// Input to each layer.
    inputs: Vec<Array2<f64>>,
    /// Pre-activation output of each layer.
    pre_activations: Vec<Array2<f64>>,
}

impl ForwardCache {
    /// Network output (pre-activation of the last layer).
    pub fn output(&self) -> &Array2<f64> {
        // A cache always holds at least one layer.
        &self.pre_activations[self.pre_activations.len() - 1]
    }
}

/// Per-layer `(dW, db)` gradients.
#[derive(Debug, Clone)]
pub struct Gradients {
    layers: Vec<(Array2<f64>, Array1<f64>)>,
}

impl Gradients {
    pub fn global_norm(&self) -> f64 {
        self.layers
            .iter()
            .map(|(w, b)| w.iter().chain(b.iter()).map(|g| g * g).sum::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|(w, b)| w.iter().chain(b.iter()).all(|g| g.is_finite()))
    }

    /// Rescales so the global L2 norm is at most `max_norm`. Returns the norm
    /// before clipping.
    pub fn clip_norm(&mut self, max_norm: f64) -> f64 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            let scale = max_norm / norm;
            for (w, b) in &mut self.layers {
                w.mapv_inplace(|g| g * scale);
                b.mapv_inplace(|g| g * scale);
            }
        }
        norm
    }
}

#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Dense>,
}

impl Mlp {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        hidden: &[usize],
        output_dim: usize,
        rng: &mut R,
    ) -> Self {
        let mut dims = Vec::with_capacity(hidden.len() + 2);
        dims.push(input_dim);
        dims.extend_from_slice(hidden);
        dims.push(output_dim);
        let layers = dims
            .windows(2)
            .map(|pair| Dense::new(pair[0], pair[1], rng))
            .collect();
        Self { layers }
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |l| l.weight.nrows())
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, |l| l.weight.ncols())
    }

    fn check_input(&self, x: &ArrayView2<'_, f64>) -> Result<()> {
        if x.ncols() != self.input_dim() {
            return Err(RLError::state_length(self.input_dim(), x.ncols()));
        }
        Ok(())
    }

    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.check_input(&x)?;
        let last = self.layers.len().saturating_sub(1);
        let mut a = x.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            a = a.dot(&layer.weight) + &layer.bias;
            if i < last {
                a.mapv_inplace(|z| z.max(0.0));
            }
        }
        Ok(a)
    }

    pub fn forward_cached(&self, x: ArrayView2<'_, f64>) -> Result<ForwardCache> {
        self.check_input(&x)?;
        let last = self.layers.len().saturating_sub(1);
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        let mut a = x.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            let z = a.dot(&layer.weight) + &layer.bias;
            inputs.push(a);
            a = if i < last { z.mapv(|v| v.max(0.0)) } else { z.clone() };
            pre_activations.push(z);
        }
        Ok(ForwardCache {
            inputs,
            pre_activations,
        })
    }

    /// Backpropagates `d_output` (loss gradient w.r.t. the network output).
    pub fn backward(&self, cache: &ForwardCache, d_output: Array2<f64>) -> Gradients {
        let mut grads = Vec::with_capacity(self.layers.len());
        let mut dz = d_output;
        for l in (0..self.layers.len()).rev() {
            let dw = cache.inputs[l].t().dot(&dz);
            let db = dz.sum_axis(Axis(0));
            if l > 0 {
                let mut da = dz.dot(&self.layers[l].weight.t());
                Zip::from(&mut da)
                    .and(&cache.pre_activations[l - 1])
                    .for_each(|g, &z| {
                        if z <= 0.0 {
                            *g = 0.0;
                        }
                    });
                dz = da;
            }
            grads.push((dw, db));
        }
        grads.reverse();
        Gradients { layers: grads }
    }

    /// Copies `other`'s parameters. Both networks must share a layout.
    pub fn copy_from(&mut self, other: &Mlp) -> Result<()> {
        let same_layout = self.layers.len() == other.layers.len()
            && self
                .layers
                .iter()
                .zip(&other.layers)
                .all(|(a, b)| a.weight.dim() == b.weight.dim());
        if !same_layout {
            return Err(RLError::InvalidConfig(
                "cannot copy parameters between networks of different shape".into(),
            ));
        }
        self.layers.clone_from(&other.layers);
        Ok(())
    }

    /// Parameters as `"{prefix}l{n}.weight"` / `"{prefix}l{n}.bias"`, layers numbered from 1.
    pub fn state_dict(&self, prefix: &str) -> NamedParams {
        let mut params = NamedParams::new();
        for (i, layer) in self.layers.iter().enumerate() {
            let (rows, cols) = layer.weight.dim();
            params.insert(
                format!("{prefix}l{}.weight", i + 1),
                ParamTensor::new(vec![rows, cols], layer.weight.iter().copied().collect()),
            );
            params.insert(
                format!("{prefix}l{}.bias", i + 1),
                ParamTensor::new(vec![cols], layer.bias.to_vec()),
            );
        }
        params
    }

    /// Loads parameters written by [`Mlp::state_dict`]. Shapes must match exactly.
    pub fn load_state_dict(&mut self, params: &NamedParams, prefix: &str) -> Result<()> {
        let mut loaded = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let (rows, cols) = layer.weight.dim();
            let w = fetch(params, &format!("{prefix}l{}.weight", i + 1), &[rows, cols])?;
            let b = fetch(params, &format!("{prefix}l{}.bias", i + 1), &[cols])?;
            let weight = Array2::from_shape_vec((rows, cols), w.data.clone())
                .map_err(|e| RLError::InvalidInput(e.to_string()))?;
            loaded.push(Dense {
                weight,
                bias: Array1::from(b.data.clone()),
            });
        }
        self.layers = loaded;
        Ok(())
    }

    fn apply(&mut self, updates: impl Iterator<Item = (Array2<f64>, Array1<f64>)>) {
        for (layer, (dw, db)) in self.layers.iter_mut().zip(updates) {
            layer.weight -= &dw;
            layer.bias -= &db;
        }
    }
}

fn fetch<'a>(params: &'a NamedParams, name: &str, shape: &[usize]) -> Result<&'a ParamTensor> {
    let tensor = params
        .get(name)
        .ok_or_else(|| RLError::InvalidInput(format!("missing parameter `{name}`")))?;
    if tensor.shape != shape || tensor.data.len() != tensor.numel() {
        return Err(RLError::InvalidInput(format!(
            "parameter `{name}` has shape {:?}, expected {:?}",
            tensor.shape, shape
        )));
    }
    if tensor.data.iter().any(|v| !v.is_finite()) {
        return Err(RLError::InvalidInput(format!(
            "parameter `{name}` holds non-finite values"
        )));
    }
    Ok(tensor)
}

/// Adam optimizer state for one [`Mlp`].
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: i32,
    m: Vec<(Array2<f64>, Array1<f64>)>,
    v: Vec<(Array2<f64>, Array1<f64>)>,
}

impl Adam {
    pub fn new(net: &Mlp, learning_rate: f64) -> Self {
        let zeros: Vec<_> = net
            .layers
            .iter()
            .map(|l| (Array2::zeros(l.weight.dim()), Array1::zeros(l.bias.len())))
            .collect();
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: zeros.clone(),
            v: zeros,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Applies one bias-corrected Adam update.
    pub fn step(&mut self, net: &mut Mlp, grads: &Gradients) {
        self.t += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);
        let c1 = 1.0 - b1.powi(self.t);
        let c2 = 1.0 - b2.powi(self.t);
        let lr = self.learning_rate;

        let mut updates = Vec::with_capacity(grads.layers.len());
        for ((g, m), v) in grads.layers.iter().zip(&mut self.m).zip(&mut self.v) {
            Zip::from(&mut m.0).and(&g.0).for_each(|m, &g| *m = b1 * *m + (1.0 - b1) * g);
            Zip::from(&mut v.0).and(&g.0).for_each(|v, &g| *v = b2 * *v + (1.0 - b2) * g * g);
            Zip::from(&mut m.1).and(&g.1).for_each(|m, &g| *m = b1 * *m + (1.0 - b1) * g);
            Zip::from(&mut v.1).and(&g.1).for_each(|v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

            let dw = Zip::from(&m.0)
                .and(&v.0)
                .map_collect(|&m, &v| lr * (m / c1) / ((v / c2).sqrt() + eps));
            let db = Zip::from(&m.1)
                .and(&v.1)
                .map_collect(|&m, &v| lr * (m / c1) / ((v / c2).sqrt() + eps));
            updates.push((dw, db));
        }
        net.apply(updates.into_iter());
    }
}
