//! Residual blocks: a cost function, an optional loss, and the parameter blocks it reads.
//!
//! Evaluating a residual block produces its cost `½ ρ(||r||²)` and, on request, the
//! residual vector and the Jacobian with respect to each parameter block. Jacobians are
//! returned in the tangent space of each block, so a block with a manifold gets a
//! `num_residuals × tangent_size` matrix. When a loss is applied, residuals and Jacobians
//! are passed through the [`Corrector`] so that a least-squares solver working on them
//! sees the robustified problem.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use nalgebra as na;
use tracing::warn;

use crate::core::corrector::Corrector;
use crate::core::cost_function::CostFunction;
use crate::core::loss_functions::{Loss, LossFunction};
use crate::core::parameter_block::{ParameterBlock, ParameterBlockId, UNINDEXED};
use crate::core::{CoreError, CoreResult};

/// Stable handle of a residual block inside a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResidualBlockId(pub(crate) usize);

impl fmt::Display for ResidualBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Clone)]
pub struct ResidualBlock {
    id: ResidualBlockId,
    cost_function: Arc<dyn CostFunction>,
    loss_function: Option<Loss>,
    parameter_blocks: Vec<ParameterBlockId>,
    index: i64,
}

impl ResidualBlock {
    pub fn new(
        id: ResidualBlockId,
        cost_function: Arc<dyn CostFunction>,
        loss_function: Option<Loss>,
        parameter_blocks: Vec<ParameterBlockId>,
        index: i64,
    ) -> Self {
        ResidualBlock {
            id,
            cost_function,
            loss_function,
            parameter_blocks,
            index,
        }
    }

    pub fn id(&self) -> ResidualBlockId {
        self.id
    }

    pub fn cost_function(&self) -> &Arc<dyn CostFunction> {
        &self.cost_function
    }

    pub fn loss_function(&self) -> Option<&Loss> {
        self.loss_function.as_ref()
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlockId] {
        &self.parameter_blocks
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.cost_function.num_residuals()
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: i64) {
        self.index = index;
    }

    /// Scratch space `evaluate` needs: room for the residuals plus one ambient Jacobian
    /// per varying parameter block that has a manifold.
    pub fn num_scratch_doubles_for_evaluate(&self, parameter_blocks: &[&ParameterBlock]) -> usize {
        let ambient_jacobian_sizes: usize = parameter_blocks
            .iter()
            .filter(|block| !block.is_constant() && block.manifold().is_some())
            .map(|block| block.size())
            .sum();
        self.num_residuals() * (1 + ambient_jacobian_sizes)
    }

    /// Evaluate the block at the current state of `parameter_blocks`.
    ///
    /// `parameter_blocks` must be the blocks named by [`Self::parameter_blocks`], in order.
    /// When given, `jacobians` has one slot per parameter block; a `Some` slot receives a
    /// row-major `num_residuals × tangent_size` Jacobian. `scratch` must hold at least
    /// [`Self::num_scratch_doubles_for_evaluate`] values.
    ///
    /// Returns the cost: `½ ρ(||r||²)` with the loss applied, `½ ||r||²` otherwise.
    pub fn evaluate(
        &self,
        parameter_blocks: &[&ParameterBlock],
        apply_loss_function: bool,
        residuals: Option<&mut [f64]>,
        mut jacobians: Option<&mut [Option<&mut [f64]>]>,
        scratch: &mut [f64],
    ) -> CoreResult<f64> {
        let num_parameter_blocks = self.parameter_blocks.len();
        let num_residuals = self.num_residuals();
        self.check_buffers(parameter_blocks, residuals.as_deref(), jacobians.as_deref(), scratch)?;

        let parameters: Vec<&[f64]> = parameter_blocks.iter().map(|block| block.state()).collect();
        let residuals_requested = residuals.is_some();

        let (residual_scratch, mut jacobian_scratch) = scratch.split_at_mut(num_residuals);
        let residuals: &mut [f64] = match residuals {
            Some(residuals) => residuals,
            None => residual_scratch,
        };

        // Blocks with a manifold are differentiated in ambient coordinates first
        let mut ambient_jacobians: Vec<Option<&mut [f64]>> = Vec::with_capacity(num_parameter_blocks);
        for (i, block) in parameter_blocks.iter().enumerate() {
            let requested = jacobians
                .as_deref()
                .is_some_and(|slots| slots[i].is_some());
            if requested && block.plus_jacobian().is_some() {
                let (chunk, rest) =
                    std::mem::take(&mut jacobian_scratch).split_at_mut(num_residuals * block.size());
                ambient_jacobians.push(Some(chunk));
                jacobian_scratch = rest;
            } else {
                ambient_jacobians.push(None);
            }
        }

        let evaluated = match jacobians.as_deref_mut() {
            Some(slots) => {
                let mut eval_jacobians: Vec<Option<&mut [f64]>> = slots
                    .iter_mut()
                    .zip(ambient_jacobians.iter_mut())
                    .map(|(slot, ambient)| match ambient {
                        Some(chunk) => Some(&mut **chunk),
                        None => slot.as_deref_mut(),
                    })
                    .collect();
                invalidate(residuals, &mut eval_jacobians);
                let ok = self
                    .cost_function
                    .evaluate(&parameters, residuals, Some(eval_jacobians.as_mut_slice()));
                if ok {
                    self.check_finite(&parameters, residuals, &eval_jacobians)?;
                }
                ok
            }
            None => {
                invalidate(residuals, &mut []);
                let ok = self.cost_function.evaluate(&parameters, residuals, None);
                if ok {
                    self.check_finite(&parameters, residuals, &[])?;
                }
                ok
            }
        };
        if !evaluated {
            return Err(CoreError::Evaluation(format!(
                "cost function of residual block {} returned false",
                self.id
            )));
        }

        let sq_norm: f64 = residuals.iter().map(|r| r * r).sum();

        // J_tangent = J_ambient · P
        if let Some(slots) = jacobians.as_deref_mut() {
            for ((slot, ambient), block) in slots
                .iter_mut()
                .zip(ambient_jacobians.iter())
                .zip(parameter_blocks)
            {
                let (Some(target), Some(ambient), Some(plus_jacobian)) =
                    (slot.as_deref_mut(), ambient.as_deref(), block.plus_jacobian())
                else {
                    continue;
                };
                let size = block.size();
                let tangent_size = block.tangent_size();
                // Row-major buffers read as column-major transposes: (J P)ᵀ = Pᵀ Jᵀ
                let ambient_t = na::DMatrixView::from_slice(ambient, size, num_residuals);
                let plus_t = na::DMatrixView::from_slice(plus_jacobian, tangent_size, size);
                let mut target_t = na::DMatrixViewMut::from_slice(target, tangent_size, num_residuals);
                target_t.copy_from(&(plus_t * ambient_t));
            }
        }

        let loss = match (&self.loss_function, apply_loss_function) {
            (Some(loss), true) => loss,
            _ => return Ok(0.5 * sq_norm),
        };

        let rho = loss.evaluate(sq_norm);
        let cost = 0.5 * rho[0];

        if !residuals_requested && jacobians.is_none() {
            return Ok(cost);
        }

        let corrector = Corrector::new(sq_norm, &rho);
        if let Some(slots) = jacobians.as_deref_mut() {
            for (slot, block) in slots.iter_mut().zip(parameter_blocks) {
                if let Some(jacobian) = slot.as_deref_mut() {
                    corrector.correct_jacobian(num_residuals, block.tangent_size(), residuals, jacobian);
                }
            }
        }
        if residuals_requested {
            corrector.correct_residuals(residuals);
        }
        Ok(cost)
    }

    fn check_buffers(
        &self,
        parameter_blocks: &[&ParameterBlock],
        residuals: Option<&[f64]>,
        jacobians: Option<&[Option<&mut [f64]>]>,
        scratch: &[f64],
    ) -> CoreResult<()> {
        let num_residuals = self.num_residuals();
        if parameter_blocks.len() != self.parameter_blocks.len() {
            return Err(CoreError::InvalidInput(format!(
                "residual block {} expects {} parameter blocks, got {}",
                self.id,
                self.parameter_blocks.len(),
                parameter_blocks.len()
            )));
        }
        if let Some(residuals) = residuals {
            if residuals.len() != num_residuals {
                return Err(CoreError::InvalidInput(format!(
                    "residual buffer of residual block {} has {} entries, expected {}",
                    self.id,
                    residuals.len(),
                    num_residuals
                )));
            }
        }
        if let Some(slots) = jacobians {
            if slots.len() != parameter_blocks.len() {
                return Err(CoreError::InvalidInput(format!(
                    "residual block {} got {} Jacobian slots for {} parameter blocks",
                    self.id,
                    slots.len(),
                    parameter_blocks.len()
                )));
            }
            for (slot, block) in slots.iter().zip(parameter_blocks) {
                let Some(jacobian) = slot else { continue };
                if block.is_constant() && block.manifold().is_some() {
                    return Err(CoreError::InvalidInput(format!(
                        "Jacobian requested for constant parameter block '{}' with a manifold",
                        block.key()
                    )));
                }
                if !block.is_constant() && block.manifold().is_some() && block.plus_jacobian().is_none() {
                    return Err(CoreError::Manifold(format!(
                        "plus-Jacobian of parameter block '{}' is unavailable",
                        block.key()
                    )));
                }
                let expected = num_residuals * block.tangent_size();
                if jacobian.len() != expected {
                    return Err(CoreError::InvalidInput(format!(
                        "Jacobian buffer for parameter block '{}' has {} entries, expected {}",
                        block.key(),
                        jacobian.len(),
                        expected
                    )));
                }
            }
        }
        let needed = self.num_scratch_doubles_for_evaluate(parameter_blocks);
        if scratch.len() < needed {
            return Err(CoreError::InvalidInput(format!(
                "scratch buffer of {} doubles is too small, residual block {} needs {}",
                scratch.len(),
                self.id,
                needed
            )));
        }
        Ok(())
    }

    fn check_finite(
        &self,
        parameters: &[&[f64]],
        residuals: &[f64],
        jacobians: &[Option<&mut [f64]>],
    ) -> CoreResult<()> {
        let residuals_finite = residuals.iter().all(|v| v.is_finite());
        let jacobians_finite = jacobians
            .iter()
            .flatten()
            .all(|jacobian| jacobian.iter().all(|v| v.is_finite()));
        if residuals_finite && jacobians_finite {
            return Ok(());
        }

        let message = self.evaluation_report(parameters, residuals, jacobians);
        warn!("{}", message);
        Err(CoreError::Evaluation(message))
    }

    /// Table of parameter values, residuals and Jacobian entries for diagnostics.
    fn evaluation_report(
        &self,
        parameters: &[&[f64]],
        residuals: &[f64],
        jacobians: &[Option<&mut [f64]>],
    ) -> String {
        let num_residuals = self.num_residuals();
        let mut report = format!(
            "Residual block {} produced non-finite values. Residual block size: {} parameter blocks x {} residuals\n",
            self.id,
            parameters.len(),
            num_residuals
        );
        let _ = writeln!(report, "Residuals: {residuals:?}");
        for (i, values) in parameters.iter().enumerate() {
            let _ = writeln!(report, "Parameter block {i}: {values:?}");
            if let Some(Some(jacobian)) = jacobians.get(i) {
                let cols = jacobian.len() / num_residuals.max(1);
                for row in jacobian.chunks(cols.max(1)) {
                    let _ = writeln!(report, "  | {row:?}");
                }
            }
        }
        report
    }
}

/// Fill outputs with NaN so entries the cost function forgets to write are caught.
fn invalidate(residuals: &mut [f64], jacobians: &mut [Option<&mut [f64]>]) {
    residuals.fill(f64::NAN);
    for jacobian in jacobians.iter_mut().flatten() {
        jacobian.fill(f64::NAN);
    }
}

impl fmt::Debug for ResidualBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidualBlock")
            .field("id", &self.id)
            .field("num_residuals", &self.num_residuals())
            .field("parameter_blocks", &self.parameter_blocks)
            .field("loss", &self.loss_function)
            .field("index", &self.index)
            .finish()
    }
}

impl fmt::Display for ResidualBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} num residuals: {} parameter blocks: [",
            self.id,
            self.num_residuals()
        )?;
        for (i, id) in self.parameter_blocks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "]")?;
        if self.index != UNINDEXED {
            write!(f, " index: {}", self.index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::CostFunction;

    /// Residuals are affine in the parameters: r = A · [x; y] + b, with A given row-major
    /// over the concatenated parameter blocks.
    pub struct AffineCost {
        pub sizes: Vec<usize>,
        pub matrix: Vec<f64>,
        pub offset: Vec<f64>,
    }

    impl CostFunction for AffineCost {
        fn parameter_block_sizes(&self) -> &[usize] {
            &self.sizes
        }

        fn num_residuals(&self) -> usize {
            self.offset.len()
        }

        fn evaluate(
            &self,
            parameters: &[&[f64]],
            residuals: &mut [f64],
            jacobians: Option<&mut [Option<&mut [f64]>]>,
        ) -> bool {
            let total: usize = self.sizes.iter().sum();
            let flat: Vec<f64> = parameters.iter().flat_map(|p| p.iter().copied()).collect();
            for (row, residual) in residuals.iter_mut().enumerate() {
                *residual = self.offset[row]
                    + (0..total)
                        .map(|col| self.matrix[row * total + col] * flat[col])
                        .sum::<f64>();
            }
            if let Some(jacobians) = jacobians {
                let mut col_start = 0;
                for (block, size) in self.sizes.iter().enumerate() {
                    if let Some(jacobian) = jacobians[block].as_deref_mut() {
                        for row in 0..self.offset.len() {
                            for col in 0..*size {
                                jacobian[row * size + col] =
                                    self.matrix[row * total + col_start + col];
                            }
                        }
                    }
                    col_start += size;
                }
            }
            true
        }
    }

    /// Always reports failure.
    pub struct FailingCost;

    impl CostFunction for FailingCost {
        fn parameter_block_sizes(&self) -> &[usize] {
            &[1]
        }

        fn num_residuals(&self) -> usize {
            1
        }

        fn evaluate(
            &self,
            _parameters: &[&[f64]],
            _residuals: &mut [f64],
            _jacobians: Option<&mut [Option<&mut [f64]>]>,
        ) -> bool {
            false
        }
    }

    /// Reports success but never writes its outputs.
    pub struct ForgetfulCost;

    impl CostFunction for ForgetfulCost {
        fn parameter_block_sizes(&self) -> &[usize] {
            &[1]
        }

        fn num_residuals(&self) -> usize {
            1
        }

        fn evaluate(
            &self,
            _parameters: &[&[f64]],
            _residuals: &mut [f64],
            _jacobians: Option<&mut [Option<&mut [f64]>]>,
        ) -> bool {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::{AffineCost, FailingCost, ForgetfulCost};
    use super::*;
    use crate::manifold::QuaternionManifold;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// r = [x0 + 2 y0, x1 - y1, x2 + 3], x of size 3, y of size 2
    fn affine_block(loss: Option<Loss>) -> (ResidualBlock, ParameterBlock, ParameterBlock) {
        #[rustfmt::skip]
        let matrix = vec![
            1.0, 0.0, 0.0, 2.0,  0.0,
            0.0, 1.0, 0.0, 0.0, -1.0,
            0.0, 0.0, 1.0, 0.0,  0.0,
        ];
        let cost = AffineCost {
            sizes: vec![3, 2],
            matrix,
            offset: vec![0.0, 0.0, 3.0],
        };
        let x = ParameterBlock::new(ParameterBlockId(0), "x", &[1.0, 2.0, -1.0], 0);
        let y = ParameterBlock::new(ParameterBlockId(1), "y", &[0.5, 1.0], 1);
        let residual_block = ResidualBlock::new(
            ResidualBlockId(0),
            Arc::new(cost),
            loss,
            vec![x.id(), y.id()],
            0,
        );
        (residual_block, x, y)
    }

    #[test]
    fn test_evaluate_without_loss() -> TestResult {
        let (block, x, y) = affine_block(None);
        let mut scratch = vec![0.0; block.num_scratch_doubles_for_evaluate(&[&x, &y])];
        let mut residuals = [0.0; 3];
        let mut jx = [0.0; 9];
        let mut jy = [0.0; 6];
        let mut jacobians = [Some(&mut jx[..]), Some(&mut jy[..])];

        let cost = block.evaluate(
            &[&x, &y],
            true,
            Some(&mut residuals[..]),
            Some(&mut jacobians[..]),
            &mut scratch,
        )?;

        // r = [1 + 1, 2 - 1, -1 + 3]
        assert_eq!(residuals, [2.0, 1.0, 2.0]);
        assert!((cost - 4.5).abs() < 1e-12);
        assert_eq!(jx, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(jy, [2.0, 0.0, 0.0, -1.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_evaluate_cost_only_without_loss() -> TestResult {
        let (block, x, y) = affine_block(None);
        let mut scratch = vec![0.0; block.num_scratch_doubles_for_evaluate(&[&x, &y])];
        let cost = block.evaluate(&[&x, &y], true, None, None, &mut scratch)?;
        // ‖r‖² = 4 + 1 + 4
        assert!((cost - 0.5 * 9.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_evaluate_cost_only_with_loss() -> TestResult {
        let (block, x, y) = affine_block(Some(Loss::huber(1.0)?));
        let mut scratch = vec![0.0; block.num_scratch_doubles_for_evaluate(&[&x, &y])];
        let cost = block.evaluate(&[&x, &y], true, None, None, &mut scratch)?;
        // s = 9, Huber(1): ρ = 2·3 - 1 = 5
        assert!((cost - 2.5).abs() < 1e-12);

        let plain = block.evaluate(&[&x, &y], false, None, None, &mut scratch)?;
        assert!((plain - 4.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_evaluate_applies_corrector() -> TestResult {
        let (block, x, y) = affine_block(Some(Loss::huber(1.0)?));
        let mut scratch = vec![0.0; block.num_scratch_doubles_for_evaluate(&[&x, &y])];
        let mut residuals = [0.0; 3];
        let mut jx = [0.0; 9];
        let mut jacobians = [Some(&mut jx[..]), None];
        block.evaluate(
            &[&x, &y],
            true,
            Some(&mut residuals[..]),
            Some(&mut jacobians[..]),
            &mut scratch,
        )?;

        // ρ'(9) = 1/3 and ρ'' < 0, so both are scaled by √(1/3)
        let scale = (1.0_f64 / 3.0).sqrt();
        for (actual, expected) in residuals.iter().zip([2.0, 1.0, 2.0]) {
            assert!((actual - scale * expected).abs() < 1e-12);
        }
        assert!((jx[0] - scale).abs() < 1e-12);
        assert!((jx[4] - scale).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_evaluate_maps_jacobian_through_manifold() -> TestResult {
        struct QuaternionNorm;
        impl CostFunction for QuaternionNorm {
            fn parameter_block_sizes(&self) -> &[usize] {
                &[4]
            }
            fn num_residuals(&self) -> usize {
                4
            }
            fn evaluate(
                &self,
                parameters: &[&[f64]],
                residuals: &mut [f64],
                jacobians: Option<&mut [Option<&mut [f64]>]>,
            ) -> bool {
                residuals.copy_from_slice(parameters[0]);
                if let Some(jacobians) = jacobians {
                    if let Some(jacobian) = jacobians[0].as_deref_mut() {
                        jacobian.fill(0.0);
                        for i in 0..4 {
                            jacobian[i * 4 + i] = 1.0;
                        }
                    }
                }
                true
            }
        }

        let mut q = ParameterBlock::new(ParameterBlockId(0), "q", &[1.0, 0.0, 0.0, 0.0], 0);
        q.set_manifold(Some(Arc::new(QuaternionManifold::new())))?;
        let block = ResidualBlock::new(ResidualBlockId(0), Arc::new(QuaternionNorm), None, vec![q.id()], 0);

        assert_eq!(block.num_scratch_doubles_for_evaluate(&[&q]), 4 * (1 + 4));
        let mut scratch = vec![0.0; block.num_scratch_doubles_for_evaluate(&[&q])];
        let mut jacobian = [0.0; 12];
        let mut jacobians = [Some(&mut jacobian[..])];
        block.evaluate(&[&q], true, None, Some(&mut jacobians[..]), &mut scratch)?;

        // Identity ambient Jacobian times the plus-Jacobian is the plus-Jacobian
        let plus_jacobian = q.plus_jacobian().ok_or("missing plus-Jacobian")?;
        assert_eq!(&jacobian[..], plus_jacobian);
        Ok(())
    }

    #[test]
    fn test_evaluate_reports_cost_function_failure() {
        let x = ParameterBlock::new(ParameterBlockId(0), "x", &[1.0], 0);
        let block = ResidualBlock::new(ResidualBlockId(3), Arc::new(FailingCost), None, vec![x.id()], 0);
        let mut scratch = vec![0.0; 1];
        let result = block.evaluate(&[&x], true, None, None, &mut scratch);
        assert!(matches!(result, Err(CoreError::Evaluation(_))));
    }

    #[test]
    fn test_evaluate_rejects_unwritten_outputs() {
        let x = ParameterBlock::new(ParameterBlockId(0), "x", &[1.0], 0);
        let block = ResidualBlock::new(ResidualBlockId(0), Arc::new(ForgetfulCost), None, vec![x.id()], 0);
        let mut scratch = vec![0.0; 1];
        let mut residuals = [0.0];
        let result = block.evaluate(&[&x], true, Some(&mut residuals[..]), None, &mut scratch);
        match result {
            Err(CoreError::Evaluation(message)) => assert!(message.contains("non-finite")),
            other => panic!("expected evaluation error, got {other:?}"),
        }
    }

    #[test]
    fn test_evaluate_rejects_constant_manifold_jacobian() -> TestResult {
        let (block, _, _) = affine_block(None);
        let mut q = ParameterBlock::new(ParameterBlockId(0), "x", &[1.0, 0.0, 0.0], 0);
        q.set_manifold(Some(Arc::new(crate::manifold::EuclideanManifold::new(3)?)))?;
        q.set_constant();
        let y = ParameterBlock::new(ParameterBlockId(1), "y", &[0.5, 1.0], 1);

        let mut scratch = vec![0.0; 64];
        let mut jx = [0.0; 9];
        let mut jacobians = [Some(&mut jx[..]), None];
        let result = block.evaluate(&[&q, &y], true, None, Some(&mut jacobians[..]), &mut scratch);
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
        Ok(())
    }
}
