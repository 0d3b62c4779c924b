//! # Data Transformation
//!
//! Per-field chains of value operations: type conversions, scalar
//! arithmetic, unary math, windowed reductions, string decoration, and
//! named custom functions. A chain applies in order and short-circuits on
//! the first failing step; stateful steps mutate their per-chain state
//! exactly once per executed call.
//!
//! Arithmetic runs in double precision throughout. Unary math domain
//! violations propagate IEEE NaN/Inf rather than erroring.

use crate::value::FieldValue;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

/// Caller-supplied pure transformation, registered by name.
pub type CustomFn = Arc<dyn Fn(&FieldValue) -> Result<FieldValue, TransformError> + Send + Sync>;

// ─── Operations ─────────────────────────────────────────────────────────────

/// One transformation step.
#[derive(Debug, Clone)]
pub enum TransformOp {
    // Type conversions
    ToInt,
    ToFloat,
    ToDouble,
    ToString,
    ToHex,
    ToBinary,

    // Scalar arithmetic (double precision)
    Add(f64),
    Subtract(f64),
    Multiply(f64),
    Divide(f64),
    Modulo(f64),
    Power(f64),

    // Unary math
    Abs,
    Sqrt,
    Log,
    Log10,
    Sin,
    Cos,
    Tan,

    // Stateful reductions
    MovingAverage(usize),
    Diff,
    CumulativeSum,
    MinHistory,
    MaxHistory,

    // String decoration
    Prefix(String),
    Postfix(String),

    // Clamping
    Clamp { min: f64, max: f64 },

    // Named custom function (resolved against the transformer's registry)
    Custom(String),
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("division by zero")]
    DivideByZero,
    #[error("cannot parse `{0}` as a number")]
    ParseFailure(String),
    #[error("domain error: {0}")]
    DomainError(String),
    #[error("no custom function registered as `{0}`")]
    NoCustomFn(String),
    #[error("{op} is not defined for {ty} values")]
    TypeMismatch { op: &'static str, ty: &'static str },
}

// ─── Chain State ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ChainState {
    history: VecDeque<f64>,
    cumulative: f64,
    previous: Option<f64>,
    run_min: Option<f64>,
    run_max: Option<f64>,
}

impl ChainState {
    fn reset(&mut self) {
        self.history.clear();
        self.cumulative = 0.0;
        self.previous = None;
        self.run_min = None;
        self.run_max = None;
    }
}

#[derive(Debug, Default)]
struct TransformChain {
    steps: Vec<TransformOp>,
    state: ChainState,
}

// ─── Transformer ────────────────────────────────────────────────────────────

/// Maps field paths to transformation chains.
pub struct DataTransformer {
    chains: Mutex<HashMap<String, TransformChain>>,
    custom: RwLock<HashMap<String, CustomFn>>,
}

impl DataTransformer {
    pub fn new() -> Self {
        DataTransformer {
            chains: Mutex::new(HashMap::new()),
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the chain for `path`, resetting its state.
    pub fn set_chain(&self, path: impl Into<String>, steps: Vec<TransformOp>) {
        let path = path.into();
        debug!(field = %path, steps = steps.len(), "installed transform chain");
        self.lock_chains().insert(
            path,
            TransformChain {
                steps,
                state: ChainState::default(),
            },
        );
    }

    /// Append one step to `path`'s chain, creating the chain if absent.
    pub fn push_op(&self, path: impl Into<String>, op: TransformOp) {
        self.lock_chains()
            .entry(path.into())
            .or_default()
            .steps
            .push(op);
    }

    pub fn clear_chain(&self, path: &str) {
        self.lock_chains().remove(path);
    }

    pub fn has_chain(&self, path: &str) -> bool {
        self.lock_chains().contains_key(path)
    }

    pub fn chain_len(&self, path: &str) -> usize {
        self.lock_chains()
            .get(path)
            .map(|c| c.steps.len())
            .unwrap_or(0)
    }

    /// Register a named custom function usable via [`TransformOp::Custom`].
    pub fn register_custom(&self, name: impl Into<String>, f: CustomFn) {
        self.custom
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), f);
    }

    /// Apply `path`'s chain to `value`. With no chain installed the value
    /// passes through unchanged.
    pub fn transform(&self, path: &str, value: FieldValue) -> Result<FieldValue, TransformError> {
        let mut chains = self.lock_chains();
        let chain = match chains.get_mut(path) {
            Some(chain) => chain,
            None => return Ok(value),
        };

        let mut current = value;
        for op in &chain.steps {
            current = apply(op, current, &mut chain.state, &self.custom)?;
        }
        Ok(current)
    }

    /// Reset stateful accumulators for one chain.
    pub fn reset_state(&self, path: &str) {
        if let Some(chain) = self.lock_chains().get_mut(path) {
            chain.state.reset();
        }
    }

    /// Reset stateful accumulators for every chain.
    pub fn reset_all(&self) {
        for chain in self.lock_chains().values_mut() {
            chain.state.reset();
        }
    }

    fn lock_chains(&self) -> std::sync::MutexGuard<'_, HashMap<String, TransformChain>> {
        self.chains.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for DataTransformer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Application ────────────────────────────────────────────────────────────

fn apply(
    op: &TransformOp,
    value: FieldValue,
    state: &mut ChainState,
    custom: &RwLock<HashMap<String, CustomFn>>,
) -> Result<FieldValue, TransformError> {
    match op {
        TransformOp::ToInt => match &value {
            FieldValue::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::I64)
                .map_err(|_| TransformError::ParseFailure(s.clone())),
            other => numeric(other, "to-int").map(|v| FieldValue::I64(v as i64)),
        },
        TransformOp::ToFloat => match &value {
            FieldValue::Str(s) => s
                .trim()
                .parse::<f32>()
                .map(FieldValue::F32)
                .map_err(|_| TransformError::ParseFailure(s.clone())),
            other => numeric(other, "to-float").map(|v| FieldValue::F32(v as f32)),
        },
        TransformOp::ToDouble => match &value {
            FieldValue::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(FieldValue::F64)
                .map_err(|_| TransformError::ParseFailure(s.clone())),
            other => numeric(other, "to-double").map(FieldValue::F64),
        },
        TransformOp::ToString => Ok(FieldValue::Str(value.to_string())),
        TransformOp::ToHex => value
            .integral_bits()
            .map(|bits| FieldValue::Str(format!("0x{bits:x}")))
            .ok_or(TransformError::TypeMismatch {
                op: "to-hex",
                ty: value.type_name(),
            }),
        TransformOp::ToBinary => value
            .integral_bits()
            .map(|bits| FieldValue::Str(format!("0b{bits:b}")))
            .ok_or(TransformError::TypeMismatch {
                op: "to-binary",
                ty: value.type_name(),
            }),

        TransformOp::Add(p) => arithmetic(&value, *p, "add", |a, b| a + b),
        TransformOp::Subtract(p) => arithmetic(&value, *p, "subtract", |a, b| a - b),
        TransformOp::Multiply(p) => arithmetic(&value, *p, "multiply", |a, b| a * b),
        TransformOp::Divide(p) => {
            if *p == 0.0 {
                return Err(TransformError::DivideByZero);
            }
            arithmetic(&value, *p, "divide", |a, b| a / b)
        }
        TransformOp::Modulo(p) => {
            if *p == 0.0 {
                return Err(TransformError::DivideByZero);
            }
            arithmetic(&value, *p, "modulo", |a, b| a % b)
        }
        TransformOp::Power(p) => arithmetic(&value, *p, "power", |a, b| a.powf(b)),

        TransformOp::Abs => unary(&value, "abs", f64::abs),
        TransformOp::Sqrt => unary(&value, "sqrt", f64::sqrt),
        TransformOp::Log => unary(&value, "log", f64::ln),
        TransformOp::Log10 => unary(&value, "log10", f64::log10),
        TransformOp::Sin => unary(&value, "sin", f64::sin),
        TransformOp::Cos => unary(&value, "cos", f64::cos),
        TransformOp::Tan => unary(&value, "tan", f64::tan),

        TransformOp::MovingAverage(window) => {
            let v = numeric(&value, "moving-average")?;
            let window = (*window).max(1);
            state.history.push_back(v);
            while state.history.len() > window {
                state.history.pop_front();
            }
            let sum: f64 = state.history.iter().sum();
            Ok(FieldValue::F64(sum / state.history.len() as f64))
        }
        TransformOp::Diff => {
            let v = numeric(&value, "diff")?;
            let out = match state.previous {
                Some(prev) => v - prev,
                None => 0.0,
            };
            state.previous = Some(v);
            Ok(FieldValue::F64(out))
        }
        TransformOp::CumulativeSum => {
            let v = numeric(&value, "cumulative-sum")?;
            state.cumulative += v;
            Ok(FieldValue::F64(state.cumulative))
        }
        TransformOp::MinHistory => {
            let v = numeric(&value, "min")?;
            let min = state.run_min.map_or(v, |m| m.min(v));
            state.run_min = Some(min);
            Ok(FieldValue::F64(min))
        }
        TransformOp::MaxHistory => {
            let v = numeric(&value, "max")?;
            let max = state.run_max.map_or(v, |m| m.max(v));
            state.run_max = Some(max);
            Ok(FieldValue::F64(max))
        }

        TransformOp::Prefix(prefix) => Ok(FieldValue::Str(format!("{prefix}{value}"))),
        TransformOp::Postfix(postfix) => Ok(FieldValue::Str(format!("{value}{postfix}"))),

        TransformOp::Clamp { min, max } => {
            let v = numeric(&value, "clamp")?;
            Ok(FieldValue::F64(v.clamp(*min, *max)))
        }

        TransformOp::Custom(name) => {
            let registry = custom.read().unwrap_or_else(|e| e.into_inner());
            match registry.get(name) {
                Some(f) => f(&value),
                None => Err(TransformError::NoCustomFn(name.clone())),
            }
        }
    }
}

fn numeric(value: &FieldValue, op: &'static str) -> Result<f64, TransformError> {
    value.as_f64().ok_or(TransformError::TypeMismatch {
        op,
        ty: value.type_name(),
    })
}

fn arithmetic(
    value: &FieldValue,
    param: f64,
    op: &'static str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<FieldValue, TransformError> {
    numeric(value, op).map(|v| FieldValue::F64(f(v, param)))
}

fn unary(
    value: &FieldValue,
    op: &'static str,
    f: impl Fn(f64) -> f64,
) -> Result<FieldValue, TransformError> {
    numeric(value, op).map(|v| FieldValue::F64(f(v)))
}
