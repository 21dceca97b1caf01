//! Adam optimizer with lazily allocated moment estimates
//! Moments for a parameter are created on its first gradient, so a freshly
//! built optimizer carries no state at all.

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::Optimizer;

use crate::models::TaggedParameter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl ParamsAdam {
    pub fn with_lr(lr: f64) -> Self {
        Self { lr, ..Default::default() }
    }
}

/// First/second moment accumulators for one parameter
struct Moments {
    m: Var,
    v: Var,
}

struct Slot {
    var: Var,
    moments: Option<Moments>,
}

pub struct Adam {
    params: ParamsAdam,
    slots: Vec<Slot>,
    step_t: usize,
}

impl Adam {
    /// Optimizer over a selection of tagged generator parameters.
    pub fn from_parameters(parameters: &[TaggedParameter], params: ParamsAdam) -> Result<Self> {
        Self::new(parameters.iter().map(|p| p.var.clone()).collect(), params)
    }

    /// Number of optimizer steps taken
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn num_params(&self) -> usize {
        self.slots.len()
    }

    /// Number of parameters that currently hold moment estimates
    pub fn num_moment_states(&self) -> usize {
        self.slots.iter().filter(|s| s.moments.is_some()).count()
    }

    /// (parameters with state, bytes held by moment tensors)
    pub fn memory_stats(&self) -> (usize, usize) {
        let mut elements = 0;
        for slot in &self.slots {
            if let Some(moments) = &slot.moments {
                elements += moments.m.elem_count() + moments.v.elem_count();
            }
        }
        (self.num_moment_states(), elements * DType::F32.size_in_bytes())
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let slots = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| Slot { var, moments: None })
            .collect();
        Ok(Self { params, slots, step_t: 0 })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam { lr, beta1, beta2, eps, weight_decay } = self.params;
        let bias_correction1 = 1.0 - beta1.powi(self.step_t as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step_t as i32);

        for slot in self.slots.iter_mut() {
            let Some(grad) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let param = slot.var.as_tensor().detach();
            let grad = grad.detach().to_dtype(DType::F32)?;
            let grad = if weight_decay > 0.0 {
                (grad + (param.to_dtype(DType::F32)? * weight_decay)?)?
            } else {
                grad
            };

            if slot.moments.is_none() {
                slot.moments = Some(Moments {
                    m: Var::zeros(grad.dims(), DType::F32, grad.device())?,
                    v: Var::zeros(grad.dims(), DType::F32, grad.device())?,
                });
            }
            let Some(moments) = slot.moments.as_ref() else {
                continue;
            };

            let m = ((moments.m.as_tensor() * beta1)? + (&grad * (1.0 - beta1))?)?;
            let v = ((moments.v.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            moments.m.set(&m)?;
            moments.v.set(&v)?;

            let m_hat = (m / bias_correction1)?;
            let v_hat = (v / bias_correction2)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let update = (update * lr)?.to_dtype(param.dtype())?;
            slot.var.set(&(param - update)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}
