//! Programs: ordered, indexed views of a problem.
//!
//! A [`Program`] holds the parameter blocks and residual blocks that take part in an
//! evaluation, in a fixed order. After [`Program::set_parameter_offsets_and_index`] every
//! parameter block knows its position in the array and its offsets into the concatenated
//! state and tangent vectors, which is the layout linear solvers consume.
//!
//! Blocks live in an arena keyed by their handles. The arrays reference a subset of it:
//! after [`Program::create_reduced_program`] a constant parameter block leaves the array but
//! stays in the arena, since residual blocks that still read it need its state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::core::cost_function::EvaluationCallback;
use crate::core::parameter_block::{ParameterBlock, ParameterBlockId, UNINDEXED};
use crate::core::residual_block::{ResidualBlock, ResidualBlockId};
use crate::core::{CoreError, CoreResult};

#[derive(Clone, Default)]
pub struct Program {
    pub(crate) parameter_blocks: Vec<ParameterBlockId>,
    pub(crate) residual_blocks: Vec<ResidualBlockId>,
    pub(crate) parameter_arena: HashMap<ParameterBlockId, ParameterBlock>,
    pub(crate) residual_arena: HashMap<ResidualBlockId, ResidualBlock>,
}

/// Result of removing constant structure from a program.
#[derive(Clone)]
pub struct ReducedProgram {
    pub program: Program,
    /// Keys of the parameter blocks dropped from the parameter array, in program order
    pub removed_parameter_blocks: Vec<String>,
    /// Cost of the residual blocks whose parameters are all constant, loss applied
    pub fixed_cost: f64,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlockId] {
        &self.parameter_blocks
    }

    pub fn residual_blocks(&self) -> &[ResidualBlockId] {
        &self.residual_blocks
    }

    pub fn parameter_block(&self, id: ParameterBlockId) -> Option<&ParameterBlock> {
        self.parameter_arena.get(&id)
    }

    pub fn parameter_block_mut(&mut self, id: ParameterBlockId) -> Option<&mut ParameterBlock> {
        self.parameter_arena.get_mut(&id)
    }

    pub fn residual_block(&self, id: ResidualBlockId) -> Option<&ResidualBlock> {
        self.residual_arena.get(&id)
    }

    /// The parameter blocks of the array, in order.
    pub fn parameter_block_iter(&self) -> impl Iterator<Item = &ParameterBlock> + '_ {
        self.parameter_blocks
            .iter()
            .filter_map(|id| self.parameter_arena.get(id))
    }

    /// The residual blocks of the array, in order.
    pub fn residual_block_iter(&self) -> impl Iterator<Item = &ResidualBlock> + '_ {
        self.residual_blocks
            .iter()
            .filter_map(|id| self.residual_arena.get(id))
    }

    /// Look up the parameter blocks a residual block reads, in argument order.
    pub fn parameter_blocks_for(&self, residual_block: &ResidualBlock) -> CoreResult<Vec<&ParameterBlock>> {
        residual_block
            .parameter_blocks()
            .iter()
            .map(|id| {
                self.parameter_arena.get(id).ok_or_else(|| {
                    CoreError::InvalidProgram(format!(
                        "residual block {} references unknown parameter block {}",
                        residual_block.id(),
                        id
                    ))
                })
            })
            .collect()
    }

    pub(crate) fn push_parameter_block(&mut self, block: ParameterBlock) {
        self.parameter_blocks.push(block.id());
        self.parameter_arena.insert(block.id(), block);
    }

    pub(crate) fn push_residual_block(&mut self, block: ResidualBlock) {
        self.residual_blocks.push(block.id());
        self.residual_arena.insert(block.id(), block);
    }

    /// Assign array positions and prefix-sum offsets.
    ///
    /// Parameter blocks referenced by residual blocks but absent from the parameter array
    /// end up with index [`UNINDEXED`].
    pub fn set_parameter_offsets_and_index(&mut self) {
        let referenced: Vec<ParameterBlockId> = self
            .residual_blocks
            .iter()
            .filter_map(|id| self.residual_arena.get(id))
            .flat_map(|block| block.parameter_blocks().iter().copied())
            .collect();
        for id in referenced {
            if let Some(block) = self.parameter_arena.get_mut(&id) {
                block.set_index(UNINDEXED);
            }
        }

        let mut state_offset = 0;
        let mut delta_offset = 0;
        for (i, id) in self.parameter_blocks.iter().enumerate() {
            if let Some(block) = self.parameter_arena.get_mut(id) {
                block.set_index(i as i64);
                block.set_state_offset(state_offset);
                block.set_delta_offset(delta_offset);
                state_offset += block.size();
                delta_offset += block.tangent_size();
            }
        }

        for (i, id) in self.residual_blocks.iter().enumerate() {
            if let Some(block) = self.residual_arena.get_mut(id) {
                block.set_index(i as i64);
            }
        }
    }

    /// Check that indices and offsets match the array layout. The first violation is
    /// logged at WARN.
    pub fn is_valid(&self) -> bool {
        for (i, id) in self.residual_blocks.iter().enumerate() {
            let Some(block) = self.residual_arena.get(id) else {
                warn!("Residual block {} at position {} is missing from the program", id, i);
                return false;
            };
            if block.index() != i as i64 {
                warn!("Residual block {} has index {}, expected {}", id, block.index(), i);
                return false;
            }
        }

        let mut state_offset = 0;
        let mut delta_offset = 0;
        for (i, id) in self.parameter_blocks.iter().enumerate() {
            let Some(block) = self.parameter_arena.get(id) else {
                warn!("Parameter block {} at position {} is missing from the program", id, i);
                return false;
            };
            if block.index() != i as i64
                || block.state_offset() != state_offset
                || block.delta_offset() != delta_offset
            {
                warn!(
                    "Parameter block '{}' has index {}, state offset {}, delta offset {}; expected {}, {}, {}",
                    block.key(),
                    block.index(),
                    block.state_offset(),
                    block.delta_offset(),
                    i,
                    state_offset,
                    delta_offset
                );
                return false;
            }
            state_offset += block.size();
            delta_offset += block.tangent_size();
        }
        true
    }

    /// Copy of this program without residual blocks whose parameters are all constant and
    /// without parameter blocks that are constant or unused.
    ///
    /// The removed residual blocks are evaluated once, with their loss applied, and their
    /// cost is returned as `fixed_cost`. The evaluation callback, if any, is notified once
    /// before the first such evaluation.
    pub fn create_reduced_program(
        &self,
        evaluation_callback: Option<&dyn EvaluationCallback>,
    ) -> CoreResult<ReducedProgram> {
        let mut program = self.clone();
        let (removed_parameter_blocks, fixed_cost) = program.remove_fixed_blocks(evaluation_callback)?;
        program.set_parameter_offsets_and_index();
        debug!(
            "Reduced program: removed {} parameter blocks, {} residual blocks remain, fixed cost {:.6e}",
            removed_parameter_blocks.len(),
            program.num_residual_blocks(),
            fixed_cost
        );
        Ok(ReducedProgram {
            program,
            removed_parameter_blocks,
            fixed_cost,
        })
    }

    fn remove_fixed_blocks(
        &mut self,
        mut evaluation_callback: Option<&dyn EvaluationCallback>,
    ) -> CoreResult<(Vec<String>, f64)> {
        let mut used: HashSet<ParameterBlockId> = HashSet::new();
        let mut active_residual_blocks = Vec::with_capacity(self.residual_blocks.len());
        let mut fixed_cost = 0.0;
        let mut scratch = vec![0.0; self.max_scratch_doubles_needed_for_evaluate()];

        for &id in &self.residual_blocks {
            let residual_block = self.residual_arena.get(&id).ok_or_else(|| {
                CoreError::InvalidProgram(format!("residual block {id} is missing from the program"))
            })?;
            let parameter_blocks = self.parameter_blocks_for(residual_block)?;

            let mut all_constant = true;
            for block in &parameter_blocks {
                if !block.is_constant() {
                    all_constant = false;
                    used.insert(block.id());
                }
            }
            if !all_constant {
                active_residual_blocks.push(id);
                continue;
            }

            // Constant residual: fold its cost into the fixed cost
            if let Some(callback) = evaluation_callback.take() {
                callback.prepare_for_evaluation(false, true);
            }
            let cost = residual_block
                .evaluate(&parameter_blocks, true, None, None, &mut scratch)
                .map_err(|e| {
                    CoreError::Evaluation(format!(
                        "Evaluation of the residual {} failed during removal of fixed residual blocks.",
                        residual_block.index()
                    ))
                    .log_with_source(e)
                })?;
            fixed_cost += cost;
        }
        self.residual_blocks = active_residual_blocks;

        let mut removed_parameter_blocks = Vec::new();
        let mut active_parameter_blocks = Vec::with_capacity(self.parameter_blocks.len());
        for &id in &self.parameter_blocks {
            if used.contains(&id) {
                active_parameter_blocks.push(id);
            } else if let Some(block) = self.parameter_arena.get(&id) {
                removed_parameter_blocks.push(block.key().to_string());
            }
        }
        self.parameter_blocks = active_parameter_blocks;

        let both_empty = self.residual_blocks.is_empty() && self.parameter_blocks.is_empty();
        let both_non_empty = !self.residual_blocks.is_empty() && !self.parameter_blocks.is_empty();
        if !(both_empty || both_non_empty) {
            return Err(CoreError::InvalidProgram(format!(
                "reduced program has {} residual blocks but {} parameter blocks",
                self.residual_blocks.len(),
                self.parameter_blocks.len()
            ))
            .log());
        }
        Ok((removed_parameter_blocks, fixed_cost))
    }

    /// `state_plus_delta = state ⊞ delta`, block by block, projected onto the bounds.
    ///
    /// Blocks are split into at most `num_threads` contiguous chunks that run as rayon
    /// tasks, on `thread_pool` when given and on the global pool otherwise. The first
    /// failing block stops the remaining work.
    pub fn plus(
        &self,
        state: &[f64],
        delta: &[f64],
        state_plus_delta: &mut [f64],
        thread_pool: Option<&rayon::ThreadPool>,
        num_threads: usize,
    ) -> CoreResult<()> {
        if num_threads == 0 {
            return Err(CoreError::ParallelComputation(
                "num_threads must be at least 1".to_string(),
            ));
        }
        let num_parameters = self.num_parameters();
        let num_effective_parameters = self.num_effective_parameters();
        if state.len() != num_parameters
            || state_plus_delta.len() != num_parameters
            || delta.len() != num_effective_parameters
        {
            return Err(CoreError::InvalidInput(format!(
                "plus expects {} state and {} delta values, got state {}, delta {}, output {}",
                num_parameters,
                num_effective_parameters,
                state.len(),
                delta.len(),
                state_plus_delta.len()
            )));
        }

        let mut tasks = Vec::with_capacity(self.parameter_blocks.len());
        let mut rest = state_plus_delta;
        let mut state_offset = 0;
        let mut delta_offset = 0;
        for block in self.parameter_block_iter() {
            let (out, tail) = std::mem::take(&mut rest).split_at_mut(block.size());
            rest = tail;
            tasks.push((
                block,
                &state[state_offset..state_offset + block.size()],
                &delta[delta_offset..delta_offset + block.tangent_size()],
                out,
            ));
            state_offset += block.size();
            delta_offset += block.tangent_size();
        }

        let abort = AtomicBool::new(false);
        let chunk_size = tasks.len().div_ceil(num_threads).max(1);
        let mut run = || {
            tasks.par_chunks_mut(chunk_size).for_each(|chunk| {
                for (block, x, delta, out) in chunk.iter_mut() {
                    if abort.load(Ordering::Relaxed) {
                        return;
                    }
                    if !block.plus(x, delta, out) {
                        warn!("Plus failed for parameter block '{}'", block.key());
                        abort.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            })
        };
        match thread_pool {
            Some(pool) => pool.install(run),
            None => run(),
        }

        if abort.load(Ordering::Relaxed) {
            return Err(CoreError::Manifold(
                "Plus failed for at least one parameter block".to_string(),
            ));
        }
        Ok(())
    }

    /// Constant blocks must lie within their bounds; varying blocks need `lower < upper`
    /// for every coordinate.
    pub fn is_feasible(&self) -> CoreResult<()> {
        for block in self.parameter_block_iter() {
            let values = block.state();
            if block.is_constant() {
                for (j, &value) in values.iter().enumerate() {
                    let lower = block.lower_bound_for_parameter(j);
                    let upper = block.upper_bound_for_parameter(j);
                    if value < lower || value > upper {
                        return Err(CoreError::Infeasible(format!(
                            "ParameterBlock '{}' (index {}) with size {} has at least one infeasible value.\n\
                             First infeasible value is at index: {}.\n\
                             Lower bound: {:e}, value: {:e}, upper bound: {:e}\n\
                             Parameter block values: {:?}",
                            block.key(),
                            block.index(),
                            block.size(),
                            j,
                            lower,
                            value,
                            upper,
                            values
                        )));
                    }
                }
            } else {
                for j in 0..block.size() {
                    let lower = block.lower_bound_for_parameter(j);
                    let upper = block.upper_bound_for_parameter(j);
                    if lower >= upper {
                        return Err(CoreError::Infeasible(format!(
                            "ParameterBlock '{}' (index {}) with size {} has at least one infeasible bound.\n\
                             First infeasible bound is at index: {}.\n\
                             Lower bound: {:e}, upper bound: {:e}\n\
                             Parameter block values: {:?}",
                            block.key(),
                            block.index(),
                            block.size(),
                            j,
                            lower,
                            upper,
                            values
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// True if any varying block has a finite bound.
    pub fn is_bounds_constrained(&self) -> bool {
        self.parameter_block_iter()
            .filter(|block| !block.is_constant())
            .any(|block| {
                (0..block.size()).any(|j| {
                    block.lower_bound_for_parameter(j) > -f64::MAX
                        || block.upper_bound_for_parameter(j) < f64::MAX
                })
            })
    }

    /// Error naming the first parameter block holding a NaN or infinite value.
    pub fn parameter_blocks_are_finite(&self) -> CoreResult<()> {
        for block in self.parameter_block_iter() {
            if let Some(j) = block.state().iter().position(|value| !value.is_finite()) {
                return Err(CoreError::InvalidInput(format!(
                    "ParameterBlock '{}' with size {} has at least one invalid value.\n\
                     First invalid value is at index: {}.\n\
                     Parameter block values: {:?}",
                    block.key(),
                    block.size(),
                    j,
                    block.state()
                )));
            }
        }
        Ok(())
    }

    /// Concatenate the block states in array order into `state`.
    pub fn parameter_blocks_to_state_vector(&self, state: &mut [f64]) -> CoreResult<()> {
        if state.len() != self.num_parameters() {
            return Err(CoreError::InvalidInput(format!(
                "state vector has {} entries, program has {} parameters",
                state.len(),
                self.num_parameters()
            )));
        }
        let mut offset = 0;
        for block in self.parameter_block_iter() {
            state[offset..offset + block.size()].copy_from_slice(block.state());
            offset += block.size();
        }
        Ok(())
    }

    pub fn state_vector(&self) -> Vec<f64> {
        self.parameter_block_iter()
            .flat_map(|block| block.state().iter().copied())
            .collect()
    }

    /// Scatter `state` back into the blocks, refreshing plus-Jacobians.
    pub fn state_vector_to_parameter_blocks(&mut self, state: &[f64]) -> CoreResult<()> {
        if state.len() != self.num_parameters() {
            return Err(CoreError::InvalidInput(format!(
                "state vector has {} entries, program has {} parameters",
                state.len(),
                self.num_parameters()
            )));
        }
        let mut offset = 0;
        for id in &self.parameter_blocks {
            if let Some(block) = self.parameter_arena.get_mut(id) {
                let size = block.size();
                block.set_state(&state[offset..offset + size])?;
                offset += size;
            }
        }
        Ok(())
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.residual_block_iter().map(|block| block.num_residuals()).sum()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameter_block_iter().map(|block| block.size()).sum()
    }

    /// Sum of tangent sizes.
    pub fn num_effective_parameters(&self) -> usize {
        self.parameter_block_iter().map(|block| block.tangent_size()).sum()
    }

    pub fn max_scratch_doubles_needed_for_evaluate(&self) -> usize {
        self.residual_block_iter()
            .filter_map(|block| {
                self.parameter_blocks_for(block)
                    .ok()
                    .map(|params| block.num_scratch_doubles_for_evaluate(&params))
            })
            .max()
            .unwrap_or(0)
    }

    /// Largest `num_residuals × Σ tangent_size` over the residual blocks.
    pub fn max_derivatives_per_residual_block(&self) -> usize {
        self.residual_block_iter()
            .filter_map(|block| {
                self.parameter_blocks_for(block).ok().map(|params| {
                    block.num_residuals() * params.iter().map(|p| p.tangent_size()).sum::<usize>()
                })
            })
            .max()
            .unwrap_or(0)
    }

    pub fn max_parameters_per_residual_block(&self) -> usize {
        self.residual_block_iter()
            .map(|block| block.num_parameter_blocks())
            .max()
            .unwrap_or(0)
    }

    pub fn max_residuals_per_residual_block(&self) -> usize {
        self.residual_block_iter()
            .map(|block| block.num_residuals())
            .max()
            .unwrap_or(0)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Program: {} parameter blocks ({} parameters, {} effective), {} residual blocks ({} residuals)",
            self.num_parameter_blocks(),
            self.num_parameters(),
            self.num_effective_parameters(),
            self.num_residual_blocks(),
            self.num_residuals()
        )?;
        for block in self.parameter_block_iter() {
            writeln!(f, "  {block}")?;
        }
        for block in self.residual_block_iter() {
            writeln!(f, "  {block}")?;
        }
        Ok(())
    }
}
