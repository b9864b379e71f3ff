//! Single-layer LSTM forecaster
//!
//! Univariate input, `units` hidden cells, dense linear head with `horizon`
//! outputs. Trained with truncated-free BPTT over the whole lookback window
//! and the Adam optimizer on mean-squared error.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Global gradient-norm clip applied per mini-batch
const MAX_GRAD_NORM: f64 = 5.0;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// Gate layout inside the stacked `4 * units` pre-activation vector
const GATE_INPUT: usize = 0;
const GATE_FORGET: usize = 1;
const GATE_CELL: usize = 2;
const GATE_OUTPUT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 0.001,
        }
    }
}

/// LSTM weights; all matrices are row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lstm {
    units: usize,
    horizon: usize,
    /// Input weights, `4 * units`
    w_input: Vec<f64>,
    /// Recurrent weights, `4 * units` rows of `units`
    w_recurrent: Vec<f64>,
    /// Gate biases, `4 * units`
    bias: Vec<f64>,
    /// Head weights, `horizon` rows of `units`
    w_out: Vec<f64>,
    /// Head bias, `horizon`
    b_out: Vec<f64>,
}

/// Per-step activations kept for the backward pass
struct StepCache {
    input: f64,
    gates: Vec<f64>,
    cell: Vec<f64>,
    hidden_prev: Vec<f64>,
    cell_prev: Vec<f64>,
}

impl Lstm {
    /// Glorot-style uniform init; forget-gate bias starts at 1.0
    pub fn new(units: usize, horizon: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let limit = 1.0 / (units.max(1) as f64).sqrt();
        let mut uniform = |len: usize| -> Vec<f64> {
            (0..len).map(|_| rng.gen_range(-limit..limit)).collect()
        };
        let w_input = uniform(4 * units);
        let w_recurrent = uniform(4 * units * units);
        let w_out = uniform(horizon * units);
        let mut bias = vec![0.0; 4 * units];
        for b in &mut bias[GATE_FORGET * units..(GATE_FORGET + 1) * units] {
            *b = 1.0;
        }
        Self {
            units,
            horizon,
            w_input,
            w_recurrent,
            bias,
            w_out,
            b_out: vec![0.0; horizon],
        }
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Shape consistency check for deserialized weights
    pub fn is_well_formed(&self) -> bool {
        let u = self.units;
        u > 0
            && self.horizon > 0
            && self.w_input.len() == 4 * u
            && self.w_recurrent.len() == 4 * u * u
            && self.bias.len() == 4 * u
            && self.w_out.len() == self.horizon * u
            && self.b_out.len() == self.horizon
            && self.tensors().iter().all(|t| t.iter().all(|v| v.is_finite()))
    }

    /// Forecast `horizon` values from one input window
    pub fn forward(&self, window: &[f64]) -> Vec<f64> {
        let (hidden, _) = self.run(window, false);
        self.head(&hidden)
    }

    fn zeros_like(&self) -> Self {
        Self {
            units: self.units,
            horizon: self.horizon,
            w_input: vec![0.0; self.w_input.len()],
            w_recurrent: vec![0.0; self.w_recurrent.len()],
            bias: vec![0.0; self.bias.len()],
            w_out: vec![0.0; self.w_out.len()],
            b_out: vec![0.0; self.b_out.len()],
        }
    }

    fn tensors(&self) -> [&Vec<f64>; 5] {
        [
            &self.w_input,
            &self.w_recurrent,
            &self.bias,
            &self.w_out,
            &self.b_out,
        ]
    }

    fn tensors_mut(&mut self) -> [&mut Vec<f64>; 5] {
        [
            &mut self.w_input,
            &mut self.w_recurrent,
            &mut self.bias,
            &mut self.w_out,
            &mut self.b_out,
        ]
    }

    fn head(&self, hidden: &[f64]) -> Vec<f64> {
        (0..self.horizon)
            .map(|k| {
                let row = &self.w_out[k * self.units..(k + 1) * self.units];
                self.b_out[k] + dot(row, hidden)
            })
            .collect()
    }

    /// Unroll over the window, returning the last hidden state and, when
    /// `keep` is set, the per-step caches.
    fn run(&self, window: &[f64], keep: bool) -> (Vec<f64>, Vec<StepCache>) {
        let u = self.units;
        let mut hidden = vec![0.0; u];
        let mut cell = vec![0.0; u];
        let mut caches = Vec::with_capacity(if keep { window.len() } else { 0 });

        for &x in window {
            let mut gates = vec![0.0; 4 * u];
            for (r, gate) in gates.iter_mut().enumerate() {
                let z = self.w_input[r] * x
                    + dot(&self.w_recurrent[r * u..(r + 1) * u], &hidden)
                    + self.bias[r];
                *gate = if r / u == GATE_CELL { z.tanh() } else { sigmoid(z) };
            }
            let mut next_cell = vec![0.0; u];
            let mut next_hidden = vec![0.0; u];
            for j in 0..u {
                let i = gates[GATE_INPUT * u + j];
                let f = gates[GATE_FORGET * u + j];
                let g = gates[GATE_CELL * u + j];
                let o = gates[GATE_OUTPUT * u + j];
                next_cell[j] = f * cell[j] + i * g;
                next_hidden[j] = o * next_cell[j].tanh();
            }
            if keep {
                caches.push(StepCache {
                    input: x,
                    gates,
                    cell: next_cell.clone(),
                    hidden_prev: hidden,
                    cell_prev: cell,
                });
            }
            hidden = next_hidden;
            cell = next_cell;
        }
        (hidden, caches)
    }

    /// Accumulate gradients of `scale * sum((y - target)^2)` into `grad`;
    /// returns the unscaled squared error.
    fn backward(&self, window: &[f64], target: &[f64], scale: f64, grad: &mut Lstm) -> f64 {
        let u = self.units;
        let (hidden, caches) = self.run(window, true);
        let output = self.head(&hidden);

        let mut loss = 0.0;
        let mut d_hidden = vec![0.0; u];
        for k in 0..self.horizon {
            let err = output[k] - target[k];
            loss += err * err;
            let dy = 2.0 * err * scale;
            grad.b_out[k] += dy;
            for j in 0..u {
                grad.w_out[k * u + j] += dy * hidden[j];
                d_hidden[j] += dy * self.w_out[k * u + j];
            }
        }

        let mut d_cell = vec![0.0; u];
        let mut d_gates = vec![0.0; 4 * u];
        for step in caches.iter().rev() {
            for j in 0..u {
                let i = step.gates[GATE_INPUT * u + j];
                let f = step.gates[GATE_FORGET * u + j];
                let g = step.gates[GATE_CELL * u + j];
                let o = step.gates[GATE_OUTPUT * u + j];
                let tc = step.cell[j].tanh();

                let d_o = d_hidden[j] * tc;
                d_cell[j] += d_hidden[j] * o * (1.0 - tc * tc);
                let d_i = d_cell[j] * g;
                let d_g = d_cell[j] * i;
                let d_f = d_cell[j] * step.cell_prev[j];

                d_gates[GATE_INPUT * u + j] = d_i * i * (1.0 - i);
                d_gates[GATE_FORGET * u + j] = d_f * f * (1.0 - f);
                d_gates[GATE_CELL * u + j] = d_g * (1.0 - g * g);
                d_gates[GATE_OUTPUT * u + j] = d_o * o * (1.0 - o);

                d_cell[j] *= f;
            }

            let mut d_hidden_prev = vec![0.0; u];
            for (r, dz) in d_gates.iter().enumerate() {
                grad.w_input[r] += dz * step.input;
                grad.bias[r] += dz;
                let row = r * u;
                for j in 0..u {
                    grad.w_recurrent[row + j] += dz * step.hidden_prev[j];
                    d_hidden_prev[j] += dz * self.w_recurrent[row + j];
                }
            }
            d_hidden = d_hidden_prev;
        }
        loss
    }

    /// Fit on `(window, target)` pairs; returns the final epoch's MSE
    pub fn train(
        &mut self,
        inputs: &[Vec<f64>],
        targets: &[Vec<f64>],
        params: &TrainingParams,
        seed: u64,
    ) -> f64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut adam = Adam::new(self);
        let mut order: Vec<usize> = (0..inputs.len()).collect();
        let batch_size = params.batch_size.max(1);
        let mut epoch_mse = f64::NAN;

        for _ in 0..params.epochs {
            order.shuffle(&mut rng);
            let mut total = 0.0;
            for batch in order.chunks(batch_size) {
                let mut grad = self.zeros_like();
                let scale = 1.0 / (batch.len() * self.horizon) as f64;
                for &idx in batch {
                    total += self.backward(&inputs[idx], &targets[idx], scale, &mut grad);
                }
                clip_gradients(&mut grad, MAX_GRAD_NORM);
                adam.step(self, &grad, params.learning_rate);
            }
            epoch_mse = total / (inputs.len() * self.horizon).max(1) as f64;
        }
        epoch_mse
    }
}

struct Adam {
    m: Lstm,
    v: Lstm,
    t: i32,
}

impl Adam {
    fn new(model: &Lstm) -> Self {
        Self {
            m: model.zeros_like(),
            v: model.zeros_like(),
            t: 0,
        }
    }

    fn step(&mut self, model: &mut Lstm, grad: &Lstm, lr: f64) {
        self.t += 1;
        let c1 = 1.0 - ADAM_BETA1.powi(self.t);
        let c2 = 1.0 - ADAM_BETA2.powi(self.t);
        for (((p, g), m), v) in model
            .tensors_mut()
            .into_iter()
            .zip(grad.tensors())
            .zip(self.m.tensors_mut())
            .zip(self.v.tensors_mut())
        {
            for k in 0..p.len() {
                m[k] = ADAM_BETA1 * m[k] + (1.0 - ADAM_BETA1) * g[k];
                v[k] = ADAM_BETA2 * v[k] + (1.0 - ADAM_BETA2) * g[k] * g[k];
                p[k] -= lr * (m[k] / c1) / ((v[k] / c2).sqrt() + ADAM_EPS);
            }
        }
    }
}

fn clip_gradients(grad: &mut Lstm, max_norm: f64) {
    let norm = grad
        .tensors()
        .iter()
        .flat_map(|t| t.iter())
        .map(|g| g * g)
        .sum::<f64>()
        .sqrt();
    if norm > max_norm {
        let factor = max_norm / norm;
        for tensor in grad.tensors_mut() {
            tensor.iter_mut().for_each(|g| *g *= factor);
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_windows(n: usize, lookback: usize) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
        let series: Vec<f64> = (0..n)
            .map(|i| 0.5 + 0.4 * (i as f64 * 0.3).sin())
            .collect();
        let mut inputs = Vec::new();
        let mut targets = Vec::new();
        for i in lookback..n {
            inputs.push(series[i - lookback..i].to_vec());
            targets.push(vec![series[i]]);
        }
        (inputs, targets)
    }

    #[test]
    fn test_shapes() {
        let net = Lstm::new(4, 2, 1);
        assert!(net.is_well_formed());
        assert_eq!(net.forward(&[0.1, 0.2, 0.3]).len(), 2);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let net = Lstm::new(3, 1, 11);
        let window = [0.2, 0.7, 0.1, 0.5];
        let target = [0.4];
        let mut grad = net.zeros_like();
        net.backward(&window, &target, 1.0, &mut grad);

        let loss = |n: &Lstm| {
            let y = n.forward(&window)[0];
            (y - target[0]).powi(2)
        };
        let eps = 1e-6;
        for (t, idx) in [(0usize, 2usize), (1, 5), (2, 4), (3, 1), (4, 0)] {
            let mut plus = net.clone();
            plus.tensors_mut()[t][idx] += eps;
            let mut minus = net.clone();
            minus.tensors_mut()[t][idx] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            let analytic = grad.tensors()[t][idx];
            assert!(
                (numeric - analytic).abs() < 1e-6,
                "tensor {} idx {}: numeric {} analytic {}",
                t,
                idx,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn test_training_reduces_error() {
        let (inputs, targets) = sine_windows(120, 8);
        let mut net = Lstm::new(8, 1, 5);
        let before: f64 = inputs
            .iter()
            .zip(&targets)
            .map(|(x, y)| (net.forward(x)[0] - y[0]).powi(2))
            .sum::<f64>()
            / inputs.len() as f64;
        let params = TrainingParams {
            epochs: 30,
            batch_size: 16,
            learning_rate: 0.01,
        };
        let after = net.train(&inputs, &targets, &params, 5);
        assert!(after < before, "mse before {} after {}", before, after);
        assert!(net.is_well_formed());
    }

    #[test]
    fn test_training_is_deterministic() {
        let (inputs, targets) = sine_windows(40, 5);
        let params = TrainingParams {
            epochs: 2,
            batch_size: 8,
            learning_rate: 0.01,
        };
        let mut a = Lstm::new(4, 1, 3);
        let mut b = Lstm::new(4, 1, 3);
        a.train(&inputs, &targets, &params, 9);
        b.train(&inputs, &targets, &params, 9);
        assert_eq!(a, b);
    }
}
