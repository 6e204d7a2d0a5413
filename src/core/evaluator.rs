//! Program evaluator: cost, residuals, gradient and sparse Jacobian of a whole program.
//!
//! Residual blocks are evaluated in parallel with rayon, each task owning its own scratch
//! buffer. Results are then merged serially into the global vectors following the row
//! layout (prefix sums of residual counts) and the column layout (parameter block
//! `delta_offset`s) of the program.

use std::sync::Arc;

use faer::sparse::{SparseColMat, Triplet};
use rayon::prelude::*;
use tracing::debug;

use crate::core::cost_function::EvaluationCallback;
use crate::core::parameter_block::UNINDEXED;
use crate::core::program::Program;
use crate::core::{CoreError, CoreResult};

/// Which outputs an evaluation should produce besides the cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationRequest {
    pub residuals: bool,
    pub gradient: bool,
    pub jacobian: bool,
}

impl EvaluationRequest {
    pub fn cost_only() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            residuals: true,
            gradient: true,
            jacobian: true,
        }
    }

    pub fn with_residuals(mut self) -> Self {
        self.residuals = true;
        self
    }

    pub fn with_gradient(mut self) -> Self {
        self.gradient = true;
        self
    }

    pub fn with_jacobian(mut self) -> Self {
        self.jacobian = true;
        self
    }

    fn needs_jacobians(&self) -> bool {
        self.gradient || self.jacobian
    }
}

/// Outputs of one evaluation. Fields not requested are `None`.
#[derive(Clone)]
pub struct Evaluation {
    pub cost: f64,
    pub residuals: Option<Vec<f64>>,
    /// `Jᵀ r` in the tangent layout of the program
    pub gradient: Option<Vec<f64>>,
    /// `num_residuals × num_effective_parameters`
    pub jacobian: Option<SparseColMat<usize, f64>>,
}

#[derive(Clone)]
pub struct EvaluatorOptions {
    pub num_threads: usize,
    pub evaluation_callback: Option<Arc<dyn EvaluationCallback>>,
    pub thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            num_threads: 1,
            evaluation_callback: None,
            thread_pool: None,
        }
    }
}

/// Per residual block output of the parallel phase.
struct BlockEvaluation {
    cost: f64,
    residuals: Vec<f64>,
    jacobians: Vec<Option<Vec<f64>>>,
}

pub struct Evaluator {
    options: EvaluatorOptions,
    row_offsets: Vec<usize>,
    num_residuals: usize,
}

impl Evaluator {
    /// Prepare an evaluator for `program`, which must be indexed and valid.
    pub fn new(program: &Program, options: EvaluatorOptions) -> CoreResult<Self> {
        if options.num_threads < 1 {
            return Err(CoreError::InvalidInput(format!(
                "num_threads must be at least 1, got {}",
                options.num_threads
            )));
        }
        if !program.is_valid() {
            return Err(CoreError::InvalidProgram(
                "program indices and offsets are inconsistent, cannot build an evaluator".to_string(),
            )
            .log());
        }

        let mut row_offsets = Vec::with_capacity(program.num_residual_blocks());
        let mut num_residuals = 0;
        for block in program.residual_block_iter() {
            row_offsets.push(num_residuals);
            num_residuals += block.num_residuals();
        }

        Ok(Self {
            options,
            row_offsets,
            num_residuals,
        })
    }

    pub fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    /// Evaluate `program` at `state`.
    ///
    /// `state` is scattered into the parameter blocks first, so afterwards the blocks hold
    /// `state`. Jacobian columns of constant blocks stay empty and their gradient entries
    /// stay zero.
    pub fn evaluate(
        &self,
        program: &mut Program,
        state: &[f64],
        apply_loss_function: bool,
        request: EvaluationRequest,
    ) -> CoreResult<Evaluation> {
        if program.num_residual_blocks() != self.row_offsets.len() {
            return Err(CoreError::InvalidProgram(format!(
                "evaluator was built for {} residual blocks, program has {}",
                self.row_offsets.len(),
                program.num_residual_blocks()
            )));
        }

        if let Some(callback) = &self.options.evaluation_callback {
            callback.prepare_for_evaluation(request.needs_jacobians(), true);
        }

        program
            .state_vector_to_parameter_blocks(state)
            .map_err(|e| CoreError::Evaluation(format!("could not set the evaluation point: {e}")))?;

        let program: &Program = program;
        let blocks = self.evaluate_residual_blocks(program, apply_loss_function, request)?;

        let num_effective_parameters = program.num_effective_parameters();
        let mut cost = 0.0;
        let mut residuals = request.residuals.then(|| vec![0.0; self.num_residuals]);
        let mut gradient = request.gradient.then(|| vec![0.0; num_effective_parameters]);
        let mut triplets = Vec::new();

        for ((id, block), &row_offset) in program
            .residual_blocks()
            .iter()
            .zip(&blocks)
            .zip(&self.row_offsets)
        {
            cost += block.cost;
            if let Some(residuals) = residuals.as_mut() {
                residuals[row_offset..row_offset + block.residuals.len()].copy_from_slice(&block.residuals);
            }
            if !request.needs_jacobians() {
                continue;
            }

            let residual_block = program
                .residual_block(*id)
                .ok_or_else(|| CoreError::InvalidProgram(format!("residual block {id} is missing")))?;
            let num_rows = residual_block.num_residuals();
            let parameter_blocks = program.parameter_blocks_for(residual_block)?;
            for (parameter_block, jacobian) in parameter_blocks.iter().zip(&block.jacobians) {
                let Some(jacobian) = jacobian else { continue };
                if parameter_block.index() == UNINDEXED {
                    return Err(CoreError::InvalidProgram(format!(
                        "varying parameter block '{}' is not part of the program",
                        parameter_block.key()
                    )));
                }
                let num_cols = parameter_block.tangent_size();
                let col_offset = parameter_block.delta_offset();

                if let Some(gradient) = gradient.as_mut() {
                    for c in 0..num_cols {
                        gradient[col_offset + c] += (0..num_rows)
                            .map(|r| jacobian[r * num_cols + c] * block.residuals[r])
                            .sum::<f64>();
                    }
                }
                if request.jacobian {
                    for r in 0..num_rows {
                        for c in 0..num_cols {
                            triplets.push(Triplet::new(
                                row_offset + r,
                                col_offset + c,
                                jacobian[r * num_cols + c],
                            ));
                        }
                    }
                }
            }
        }

        let jacobian = if request.jacobian {
            let matrix = SparseColMat::try_new_from_triplets(
                self.num_residuals,
                num_effective_parameters,
                &triplets,
            )
            .map_err(|e| {
                CoreError::Evaluation("failed to assemble the sparse Jacobian".to_string()).log_with_source(e)
            })?;
            Some(matrix)
        } else {
            None
        };

        debug!(
            "Evaluated {} residual blocks: cost {:.6e}",
            self.row_offsets.len(),
            cost
        );
        Ok(Evaluation {
            cost,
            residuals,
            gradient,
            jacobian,
        })
    }

    fn evaluate_residual_blocks(
        &self,
        program: &Program,
        apply_loss_function: bool,
        request: EvaluationRequest,
    ) -> CoreResult<Vec<BlockEvaluation>> {
        let max_scratch = program.max_scratch_doubles_needed_for_evaluate();
        let min_len = program
            .num_residual_blocks()
            .div_ceil(self.options.num_threads)
            .max(1);
        let need_jacobians = request.needs_jacobians();
        let need_residuals = request.residuals || request.gradient;

        let run = || {
            program
                .residual_blocks()
                .par_iter()
                .with_min_len(min_len)
                .map_init(
                    || vec![0.0; max_scratch],
                    |scratch, id| -> CoreResult<BlockEvaluation> {
                        let residual_block = program.residual_block(*id).ok_or_else(|| {
                            CoreError::InvalidProgram(format!("residual block {id} is missing"))
                        })?;
                        let parameter_blocks = program.parameter_blocks_for(residual_block)?;
                        let num_residuals = residual_block.num_residuals();

                        let mut residuals = vec![0.0; num_residuals];
                        let mut jacobians: Vec<Option<Vec<f64>>> = parameter_blocks
                            .iter()
                            .map(|block| {
                                (need_jacobians && !block.is_constant())
                                    .then(|| vec![0.0; num_residuals * block.tangent_size()])
                            })
                            .collect();
                        let mut slots: Vec<Option<&mut [f64]>> =
                            jacobians.iter_mut().map(|j| j.as_deref_mut()).collect();

                        let cost = residual_block.evaluate(
                            &parameter_blocks,
                            apply_loss_function,
                            need_residuals.then_some(residuals.as_mut_slice()),
                            need_jacobians.then_some(slots.as_mut_slice()),
                            scratch,
                        )?;
                        drop(slots);

                        Ok(BlockEvaluation {
                            cost,
                            residuals,
                            jacobians,
                        })
                    },
                )
                .collect::<CoreResult<Vec<_>>>()
        };

        match &self.options.thread_pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}
