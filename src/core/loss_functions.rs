//! Robust loss functions for outlier rejection in nonlinear least squares.
//!
//! A loss function ρ(s) is applied to the squared norm `s = ||r||²` of a residual block, so
//! the block contributes `½ ρ(||r||²)` to the total cost instead of `½ ||r||²`. Large
//! residuals then pull on the solution less than they would under plain least squares.
//!
//! # Mathematical Formulation
//!
//! Every loss evaluates, for `s ≥ 0`:
//! - **ρ(s)**: the robust cost
//! - **ρ'(s)**: first derivative (the weight of the residual)
//! - **ρ''(s)**: second derivative (used by the corrector)
//!
//! Well-behaved losses satisfy `ρ(0) = 0` and `ρ'(0) = 1`. The corrector requires
//! `ρ'(s) > 0`, so every loss here floors `ρ'` at `f64::MIN_POSITIVE`.
//!
//! # Available Loss Functions
//!
//! | Loss             | ρ(s)                                          |
//! | ---------------- | --------------------------------------------- |
//! | [`TrivialLoss`]  | `s`                                           |
//! | [`HuberLoss`]    | `s` for `s ≤ a²`, `2a√s - a²` otherwise       |
//! | [`SoftLOneLoss`] | `2a²(√(1 + s/a²) - 1)`                        |
//! | [`CauchyLoss`]   | `a² ln(1 + s/a²)`                             |
//! | [`ArctanLoss`]   | `a atan2(s, a)`                               |
//! | [`TolerantLoss`] | `b ln(1 + e^((s-a)/b)) - b ln(1 + e^(-a/b))`  |
//! | [`TukeyLoss`]    | `a²/3 (1 - (1 - s/a²)³)` for `s ≤ a²`         |
//!
//! plus the combinators [`ComposedLoss`], [`ScaledLoss`] and [`LossWrapper`].
//!
//! # Example
//!
//! ```
//! use apex_nlls::core::loss_functions::{HuberLoss, LossFunction};
//! # use apex_nlls::ApexNllsResult;
//! # fn main() -> ApexNllsResult<()> {
//!
//! let huber = HuberLoss::new(1.0)?;
//!
//! // Inlier: quadratic region, full weight
//! assert_eq!(huber.evaluate(0.5), [0.5, 1.0, 0.0]);
//!
//! // Outlier: linear growth, reduced weight
//! let [rho, rho1, _] = huber.evaluate(4.0);
//! assert_eq!(rho, 3.0);
//! assert_eq!(rho1, 0.5);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::core::CoreError;
use crate::error::ApexNllsResult;

/// Trait for robust loss functions.
///
/// `evaluate(s)` returns `[ρ(s), ρ'(s), ρ''(s)]` for a squared residual norm `s ≥ 0`.
/// Implement this trait to plug a custom loss in through [`Loss::Custom`].
pub trait LossFunction: Send + Sync {
    /// Evaluate the loss and its first two derivatives at `s`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

fn require_positive(name: &str, value: f64) -> ApexNllsResult<()> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!("{name} needs to be larger than zero, got {value}")).into())
    }
}

/// Plain least squares, `ρ(s) = s`.
///
/// Attaching no loss to a residual block behaves exactly like this loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialLoss;

impl LossFunction for TrivialLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        [s, 1.0, 0.0]
    }
}

/// Huber loss: quadratic for inliers, linear for outliers.
///
/// ```text
/// ρ(s) = s              if s ≤ a²
///        2a√s - a²      otherwise
/// ```
#[derive(Debug, Clone)]
pub struct HuberLoss {
    a: f64,
    b: f64,
}

impl HuberLoss {
    /// Create a Huber loss with threshold `a > 0`.
    pub fn new(a: f64) -> ApexNllsResult<Self> {
        require_positive("scale", a)?;
        Ok(HuberLoss { a, b: a * a })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.b {
            // Outlier region
            let r = s.sqrt();
            let rho1 = (self.a / r).max(f64::MIN_POSITIVE);
            [2.0 * self.a * r - self.b, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Soft L1 loss, a smooth approximation of Huber.
///
/// ```text
/// ρ(s) = 2a² (√(1 + s/a²) - 1)
/// ```
#[derive(Debug, Clone)]
pub struct SoftLOneLoss {
    b: f64,
    c: f64,
}

impl SoftLOneLoss {
    pub fn new(a: f64) -> ApexNllsResult<Self> {
        require_positive("scale", a)?;
        let b = a * a;
        Ok(SoftLOneLoss { b, c: 1.0 / b })
    }
}

impl LossFunction for SoftLOneLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let tmp = sum.sqrt();
        let rho1 = (1.0 / tmp).max(f64::MIN_POSITIVE);
        [
            2.0 * self.b * (tmp - 1.0),
            rho1,
            -(self.c * rho1) / (2.0 * sum),
        ]
    }
}

/// Cauchy loss, a heavy-tailed log penalty.
///
/// ```text
/// ρ(s) = a² ln(1 + s/a²)
/// ```
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    b: f64,
    c: f64,
}

impl CauchyLoss {
    pub fn new(a: f64) -> ApexNllsResult<Self> {
        require_positive("scale", a)?;
        let b = a * a;
        Ok(CauchyLoss { b, c: 1.0 / b })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [
            self.b * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.c * inv * inv,
        ]
    }
}

/// Arctan loss, bounded above by `a π / 2`.
///
/// ```text
/// ρ(s) = a atan2(s, a)
/// ```
#[derive(Debug, Clone)]
pub struct ArctanLoss {
    a: f64,
    b: f64,
}

impl ArctanLoss {
    pub fn new(a: f64) -> ApexNllsResult<Self> {
        require_positive("scale", a)?;
        Ok(ArctanLoss { a, b: 1.0 / (a * a) })
    }
}

impl LossFunction for ArctanLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * s * self.b;
        let inv = 1.0 / sum;
        [
            self.a * s.atan2(self.a),
            inv.max(f64::MIN_POSITIVE),
            -2.0 * s * self.b * inv * inv,
        ]
    }
}

/// Tolerant loss: residuals below `a` cost almost nothing, above `a` the cost grows
/// linearly, with a transition of width `b`.
///
/// ```text
/// ρ(s) = b ln(1 + e^((s - a)/b)) - b ln(1 + e^(-a/b))
/// ```
#[derive(Debug, Clone)]
pub struct TolerantLoss {
    a: f64,
    b: f64,
    c: f64,
}

impl TolerantLoss {
    /// Values of `(s - a)/b` above this are treated as the asymptote to avoid `e^x` overflow.
    const LOG_MAX_EXP: f64 = 36.7;

    /// Create a tolerant loss; requires `a ≥ 0` and `b > 0`.
    pub fn new(a: f64, b: f64) -> ApexNllsResult<Self> {
        if a < 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "tolerance a needs to be non-negative, got {a}"
            ))
            .into());
        }
        require_positive("transition width b", b)?;
        Ok(TolerantLoss {
            a,
            b,
            c: b * (-a / b).exp().ln_1p(),
        })
    }
}

impl LossFunction for TolerantLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let x = (s - self.a) / self.b;
        if x > Self::LOG_MAX_EXP {
            [s - self.a - self.c, 1.0, 0.0]
        } else {
            let e_x = x.exp();
            [
                self.b * e_x.ln_1p() - self.c,
                (e_x / (1.0 + e_x)).max(f64::MIN_POSITIVE),
                0.5 / (self.b * (1.0 + x.cosh())),
            ]
        }
    }
}

/// Tukey biweight loss; residuals beyond `a` contribute a constant cost.
///
/// ```text
/// ρ(s) = a²/3 (1 - (1 - s/a²)³)    if s ≤ a²
///        a²/3                      otherwise
/// ```
#[derive(Debug, Clone)]
pub struct TukeyLoss {
    a_squared: f64,
}

impl TukeyLoss {
    pub fn new(a: f64) -> ApexNllsResult<Self> {
        require_positive("scale", a)?;
        Ok(TukeyLoss { a_squared: a * a })
    }
}

impl LossFunction for TukeyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s <= self.a_squared {
            let value = 1.0 - s / self.a_squared;
            let value_sq = value * value;
            [
                self.a_squared / 3.0 * (1.0 - value_sq * value),
                value_sq.max(f64::MIN_POSITIVE),
                -2.0 / self.a_squared * value,
            ]
        } else {
            // Outliers are ignored, only the positivity floor on ρ' remains
            [self.a_squared / 3.0, f64::MIN_POSITIVE, 0.0]
        }
    }
}

/// Composition `f(g(s))` of two losses.
#[derive(Clone)]
pub struct ComposedLoss {
    f: Loss,
    g: Loss,
}

impl ComposedLoss {
    pub fn new(f: Loss, g: Loss) -> Self {
        ComposedLoss { f, g }
    }
}

impl LossFunction for ComposedLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let g = self.g.evaluate(s);
        let f = self.f.evaluate(g[0]);
        [
            f[0],
            (f[1] * g[1]).max(f64::MIN_POSITIVE),
            f[2] * g[1] * g[1] + f[1] * g[2],
        ]
    }
}

/// A loss multiplied by a constant factor `a`. Without an inner loss this is `a · s`.
#[derive(Clone)]
pub struct ScaledLoss {
    rho: Option<Loss>,
    a: f64,
}

impl ScaledLoss {
    pub fn new(rho: Option<Loss>, a: f64) -> Self {
        ScaledLoss { rho, a }
    }
}

impl LossFunction for ScaledLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        match &self.rho {
            None => [self.a * s, self.a, 0.0],
            Some(rho) => {
                let rho = rho.evaluate(s);
                [
                    self.a * rho[0],
                    (self.a * rho[1]).max(f64::MIN_POSITIVE),
                    self.a * rho[2],
                ]
            }
        }
    }
}

/// A shared, swappable loss.
///
/// Clones share the same slot, so a residual block holding a clone sees every later
/// [`LossWrapper::reset`]. This allows changing the robustness of many residuals between
/// solves without rebuilding the problem.
///
/// Evaluating a wrapper whose slot is empty is a programming error and panics.
#[derive(Clone, Default)]
pub struct LossWrapper {
    inner: Arc<RwLock<Option<Loss>>>,
}

impl LossWrapper {
    pub fn new(loss: Option<Loss>) -> Self {
        LossWrapper {
            inner: Arc::new(RwLock::new(loss)),
        }
    }

    /// Replace the wrapped loss.
    pub fn reset(&self, loss: Option<Loss>) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = loss;
    }

    /// The currently wrapped loss, if any.
    pub fn get(&self) -> Option<Loss> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl LossFunction for LossWrapper {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(loss) => loss.evaluate(s),
            None => panic!("LossWrapper evaluated before a loss was set"),
        }
    }
}

/// Closed set of loss kinds attachable to a residual block.
///
/// Cloning is cheap: the combinators and custom losses are reference counted.
#[derive(Clone)]
pub enum Loss {
    Trivial(TrivialLoss),
    Huber(HuberLoss),
    SoftLOne(SoftLOneLoss),
    Cauchy(CauchyLoss),
    Arctan(ArctanLoss),
    Tolerant(TolerantLoss),
    Tukey(TukeyLoss),
    Composed(Arc<ComposedLoss>),
    Scaled(Arc<ScaledLoss>),
    Wrapper(LossWrapper),
    Custom(Arc<dyn LossFunction>),
}

impl Loss {
    pub fn trivial() -> Self {
        Loss::Trivial(TrivialLoss)
    }

    pub fn huber(a: f64) -> ApexNllsResult<Self> {
        HuberLoss::new(a).map(Loss::Huber)
    }

    pub fn soft_l_one(a: f64) -> ApexNllsResult<Self> {
        SoftLOneLoss::new(a).map(Loss::SoftLOne)
    }

    pub fn cauchy(a: f64) -> ApexNllsResult<Self> {
        CauchyLoss::new(a).map(Loss::Cauchy)
    }

    pub fn arctan(a: f64) -> ApexNllsResult<Self> {
        ArctanLoss::new(a).map(Loss::Arctan)
    }

    pub fn tolerant(a: f64, b: f64) -> ApexNllsResult<Self> {
        TolerantLoss::new(a, b).map(Loss::Tolerant)
    }

    pub fn tukey(a: f64) -> ApexNllsResult<Self> {
        TukeyLoss::new(a).map(Loss::Tukey)
    }

    /// `f(g(s))`
    pub fn composed(f: Loss, g: Loss) -> Self {
        Loss::Composed(Arc::new(ComposedLoss::new(f, g)))
    }

    pub fn scaled(rho: Option<Loss>, a: f64) -> Self {
        Loss::Scaled(Arc::new(ScaledLoss::new(rho, a)))
    }

    pub fn custom(loss: impl LossFunction + 'static) -> Self {
        Loss::Custom(Arc::new(loss))
    }

    /// Short name of the loss kind, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Loss::Trivial(_) => "Trivial",
            Loss::Huber(_) => "Huber",
            Loss::SoftLOne(_) => "SoftLOne",
            Loss::Cauchy(_) => "Cauchy",
            Loss::Arctan(_) => "Arctan",
            Loss::Tolerant(_) => "Tolerant",
            Loss::Tukey(_) => "Tukey",
            Loss::Composed(_) => "Composed",
            Loss::Scaled(_) => "Scaled",
            Loss::Wrapper(_) => "Wrapper",
            Loss::Custom(_) => "Custom",
        }
    }
}

impl LossFunction for Loss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        match self {
            Loss::Trivial(loss) => loss.evaluate(s),
            Loss::Huber(loss) => loss.evaluate(s),
            Loss::SoftLOne(loss) => loss.evaluate(s),
            Loss::Cauchy(loss) => loss.evaluate(s),
            Loss::Arctan(loss) => loss.evaluate(s),
            Loss::Tolerant(loss) => loss.evaluate(s),
            Loss::Tukey(loss) => loss.evaluate(s),
            Loss::Composed(loss) => loss.evaluate(s),
            Loss::Scaled(loss) => loss.evaluate(s),
            Loss::Wrapper(loss) => loss.evaluate(s),
            Loss::Custom(loss) => loss.evaluate(s),
        }
    }
}

impl From<LossWrapper> for Loss {
    fn from(wrapper: LossWrapper) -> Self {
        Loss::Wrapper(wrapper)
    }
}

impl fmt::Debug for Loss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Loss::{}", self.name())
    }
}
