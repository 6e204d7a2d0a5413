//! The user-facing problem builder.
//!
//! A [`Problem`] is a bipartite graph of parameter blocks (identified by caller-chosen
//! string keys) and residual blocks (identified by the [`ResidualBlockId`] handles returned
//! when they are added). The problem owns every block's state; callers read it back with
//! [`Problem::parameter_block_values`] or copy a solved reduced program back with
//! [`Problem::update_from_program`].
//!
//! Misusing the graph (unknown keys, size mismatches, duplicate keys in one residual block)
//! is a programming error and panics with a descriptive message. Failures that depend on
//! the numbers being evaluated are returned as [`CoreError`]s.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use apex_nlls::{CostFunction, EvaluateOptions, EvaluationRequest, Loss, Problem};
//! # use apex_nlls::ApexNllsResult;
//!
//! /// r = x - 3
//! struct Offset;
//!
//! impl CostFunction for Offset {
//!     fn parameter_block_sizes(&self) -> &[usize] {
//!         &[1]
//!     }
//!     fn num_residuals(&self) -> usize {
//!         1
//!     }
//!     fn evaluate(
//!         &self,
//!         parameters: &[&[f64]],
//!         residuals: &mut [f64],
//!         jacobians: Option<&mut [Option<&mut [f64]>]>,
//!     ) -> bool {
//!         residuals[0] = parameters[0][0] - 3.0;
//!         if let Some(jacobians) = jacobians {
//!             if let Some(jacobian) = jacobians[0].as_deref_mut() {
//!                 jacobian[0] = 1.0;
//!             }
//!         }
//!         true
//!     }
//! }
//!
//! # fn main() -> ApexNllsResult<()> {
//! let mut problem = Problem::default();
//! problem.add_parameter_block("x", &[1.0]);
//! problem.add_residual_block(Arc::new(Offset), Some(Loss::huber(1.0)?), &["x"]);
//!
//! let evaluation = problem.evaluate(&EvaluateOptions::default(), EvaluationRequest::all())?;
//! // Huber(1) at s = 4: ρ = 2·2 - 1 = 3
//! assert_eq!(evaluation.cost, 1.5);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::cost_function::{CostFunction, EvaluationCallback};
pub use crate::core::evaluator::EvaluationRequest;
use crate::core::evaluator::{Evaluation, Evaluator, EvaluatorOptions};
use crate::core::loss_functions::Loss;
use crate::core::parameter_block::{ParameterBlock, ParameterBlockId};
use crate::core::program::{Program, ReducedProgram};
use crate::core::residual_block::{ResidualBlock, ResidualBlockId};
use crate::core::{CoreError, CoreResult};
use crate::manifold::Manifold;

/// Cost, residuals, gradient and Jacobian returned by [`Problem::evaluate`].
pub type ProblemEvaluation = Evaluation;

/// Configuration for a [`Problem`].
#[derive(Clone, Default)]
pub struct ProblemOptions {
    /// Track the residual blocks of each parameter block so removal does not scan the
    /// whole problem
    pub enable_fast_removal: bool,
    /// Skip the non-finite value warning when adding parameter blocks
    pub disable_all_safety_checks: bool,
    pub evaluation_callback: Option<Arc<dyn EvaluationCallback>>,
    /// Pool used for parallel evaluation; rayon's global pool otherwise
    pub thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl ProblemOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fast_removal(mut self, enable: bool) -> Self {
        self.enable_fast_removal = enable;
        self
    }

    pub fn with_safety_checks_disabled(mut self, disable: bool) -> Self {
        self.disable_all_safety_checks = disable;
        self
    }

    pub fn with_evaluation_callback(mut self, callback: Arc<dyn EvaluationCallback>) -> Self {
        self.evaluation_callback = Some(callback);
        self
    }

    pub fn with_thread_pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.thread_pool = Some(pool);
        self
    }
}

/// Which part of the problem [`Problem::evaluate`] looks at.
///
/// Empty lists mean "everything", in problem order. Parameter blocks referenced by the
/// selected residual blocks but not listed are held constant during the evaluation.
#[derive(Debug, Clone)]
pub struct EvaluateOptions {
    pub parameter_blocks: Vec<String>,
    pub residual_blocks: Vec<ResidualBlockId>,
    pub apply_loss_function: bool,
    pub num_threads: usize,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            parameter_blocks: Vec::new(),
            residual_blocks: Vec::new(),
            apply_loss_function: true,
            num_threads: 1,
        }
    }
}

impl EvaluateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter_blocks<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_blocks = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_residual_blocks(mut self, residual_blocks: Vec<ResidualBlockId>) -> Self {
        self.residual_blocks = residual_blocks;
        self
    }

    pub fn with_apply_loss_function(mut self, apply: bool) -> Self {
        self.apply_loss_function = apply;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }
}

/// Result of [`Problem::evaluate_residual_block`].
#[derive(Debug, Clone)]
pub struct ResidualBlockEvaluation {
    pub cost: f64,
    pub residuals: Option<Vec<f64>>,
    /// One row-major `num_residuals × tangent_size` matrix per parameter block
    pub jacobians: Option<Vec<Vec<f64>>>,
}

#[derive(Default)]
pub struct Problem {
    options: ProblemOptions,
    program: Program,
    parameter_block_map: HashMap<String, ParameterBlockId>,
    next_parameter_block_id: usize,
    next_residual_block_id: usize,
}

impl Problem {
    pub fn new(options: ProblemOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn options(&self) -> &ProblemOptions {
        &self.options
    }

    /// The problem's program. Its parameter and residual arrays follow insertion order,
    /// with removals filled by swapping in the last element.
    ///
    /// Only array indices are kept current. State and delta offsets are not assigned, so
    /// the program is in the unindexed phase and [`Program::is_valid`] may report false;
    /// use [`Problem::reduced_program`] or clone it and call
    /// [`Program::set_parameter_offsets_and_index`] to get a program ready for evaluation.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Add a parameter block, or return the existing one registered under `key`.
    ///
    /// Adding an existing key again keeps its current state.
    ///
    /// # Panics
    ///
    /// Panics if `values` is empty or if `key` exists with a different size.
    pub fn add_parameter_block(&mut self, key: &str, values: &[f64]) -> ParameterBlockId {
        assert!(
            !values.is_empty(),
            "parameter block '{key}' must have at least one value"
        );
        if let Some(&id) = self.parameter_block_map.get(key) {
            let existing = self.block(id).size();
            assert_eq!(
                existing,
                values.len(),
                "Tried adding a parameter block with the same key, '{key}', twice, but with \
                 different block sizes. Original size: {existing} new size: {}",
                values.len()
            );
            return id;
        }

        if !self.options.disable_all_safety_checks && values.iter().any(|v| !v.is_finite()) {
            warn!("Parameter block '{}' was added with non-finite values: {:?}", key, values);
        }
        self.insert_parameter_block(key, values)
    }

    /// Add a parameter block and attach `manifold` to it.
    pub fn add_parameter_block_with_manifold(
        &mut self,
        key: &str,
        values: &[f64],
        manifold: Arc<dyn Manifold>,
    ) -> CoreResult<ParameterBlockId> {
        let id = self.add_parameter_block(key, values);
        self.set_manifold(key, Some(manifold))?;
        Ok(id)
    }

    fn insert_parameter_block(&mut self, key: &str, values: &[f64]) -> ParameterBlockId {
        let id = ParameterBlockId(self.next_parameter_block_id);
        self.next_parameter_block_id += 1;

        let mut block = ParameterBlock::new(id, key, values, self.program.parameter_blocks.len() as i64);
        if self.options.enable_fast_removal {
            block.enable_residual_block_dependencies();
        }
        self.program.push_parameter_block(block);
        self.parameter_block_map.insert(key.to_string(), id);
        debug!("Added parameter block '{}' of size {}", key, values.len());
        id
    }

    /// Add a residual block reading the parameter blocks named by `keys`, in order.
    ///
    /// Keys that are not yet known create zero-initialised parameter blocks of the size the
    /// cost function declares.
    ///
    /// # Panics
    ///
    /// Panics if the number of keys differs from the number of parameter blocks the cost
    /// function expects, if a key appears twice, if a declared size is zero, or if an
    /// existing block's size differs from the declared size.
    pub fn add_residual_block(
        &mut self,
        cost_function: Arc<dyn CostFunction>,
        loss_function: Option<Loss>,
        keys: &[&str],
    ) -> ResidualBlockId {
        let sizes = cost_function.parameter_block_sizes().to_vec();
        assert_eq!(
            keys.len(),
            sizes.len(),
            "Number of blocks input is different than the number of blocks that the cost \
             function expects."
        );

        let mut seen = HashSet::with_capacity(keys.len());
        for key in keys {
            assert!(
                seen.insert(*key),
                "Duplicate parameter blocks in a residual parameter block list. Key '{key}' \
                 appears more than once in {keys:?}"
            );
        }

        let mut parameter_blocks = Vec::with_capacity(keys.len());
        for (key, &size) in keys.iter().zip(&sizes) {
            assert!(size > 0, "cost function declares a zero-sized parameter block for '{key}'");
            let id = match self.parameter_block_map.get(*key) {
                Some(&id) => {
                    let existing = self.block(id).size();
                    assert_eq!(
                        existing, size,
                        "Parameter block '{key}' has size {existing}, but the cost function \
                         expects {size}"
                    );
                    id
                }
                None => self.insert_parameter_block(key, &vec![0.0; size]),
            };
            parameter_blocks.push(id);
        }

        let id = ResidualBlockId(self.next_residual_block_id);
        self.next_residual_block_id += 1;
        if self.options.enable_fast_removal {
            for parameter_block in &parameter_blocks {
                self.block_mut(*parameter_block).add_residual_block(id);
            }
        }
        let residual_block = ResidualBlock::new(
            id,
            cost_function,
            loss_function,
            parameter_blocks,
            self.program.residual_blocks.len() as i64,
        );
        self.program.push_residual_block(residual_block);
        debug!("Added residual block {} over {:?}", id, keys);
        id
    }

    /// Remove a residual block. The last residual block takes its place in the program.
    ///
    /// # Panics
    ///
    /// Panics if the residual block is unknown.
    pub fn remove_residual_block(&mut self, id: ResidualBlockId) {
        let Some(residual_block) = self.program.residual_arena.remove(&id) else {
            panic!(
                "Residual block to remove: {id} not found. This usually means that the residual \
                 block either was never added or was already removed."
            );
        };

        if self.options.enable_fast_removal {
            for parameter_block in residual_block.parameter_blocks() {
                if let Some(block) = self.program.parameter_arena.get_mut(parameter_block) {
                    block.remove_residual_block(id);
                }
            }
        }

        let index = residual_block.index() as usize;
        self.program.residual_blocks.swap_remove(index);
        if let Some(moved) = self.program.residual_blocks.get(index).copied() {
            if let Some(block) = self.program.residual_arena.get_mut(&moved) {
                block.set_index(index as i64);
            }
        }
        debug!("Removed residual block {}", id);
    }

    /// Remove a parameter block together with every residual block that reads it.
    ///
    /// # Panics
    ///
    /// Panics if `key` is unknown.
    pub fn remove_parameter_block(&mut self, key: &str) {
        let id = self.id_for(key, "remove");

        let mut dependents = self.residual_blocks_for(id);
        dependents.sort();
        for residual_block in dependents {
            self.remove_residual_block(residual_block);
        }

        let index = self.block(id).index() as usize;
        self.program.parameter_blocks.swap_remove(index);
        if let Some(moved) = self.program.parameter_blocks.get(index).copied() {
            self.block_mut(moved).set_index(index as i64);
        }
        self.program.parameter_arena.remove(&id);
        self.parameter_block_map.remove(key);
        debug!("Removed parameter block '{}'", key);
    }

    /// # Panics
    ///
    /// Panics if `key` is unknown.
    pub fn set_parameter_block_constant(&mut self, key: &str) {
        let id = self.id_for(key, "set constant");
        self.block_mut(id).set_constant();
    }

    /// # Panics
    ///
    /// Panics if `key` is unknown.
    pub fn set_parameter_block_variable(&mut self, key: &str) -> CoreResult<()> {
        let id = self.id_for(key, "set variable");
        self.block_mut(id).set_varying()
    }

    pub fn is_parameter_block_constant(&self, key: &str) -> bool {
        let id = self.id_for(key, "query constancy of");
        self.block(id).is_constant()
    }

    /// Attach or detach a manifold.
    ///
    /// # Panics
    ///
    /// Panics if `key` is unknown or the manifold's ambient size differs from the block size.
    pub fn set_manifold(&mut self, key: &str, manifold: Option<Arc<dyn Manifold>>) -> CoreResult<()> {
        let id = self.id_for(key, "set the manifold of");
        self.block_mut(id).set_manifold(manifold)
    }

    pub fn manifold(&self, key: &str) -> Option<Arc<dyn Manifold>> {
        let id = self.id_for(key, "get the manifold of");
        self.block(id).manifold().cloned()
    }

    pub fn set_parameter_lower_bound(&mut self, key: &str, index: usize, lower_bound: f64) {
        let id = self.id_for(key, "set a lower bound on");
        self.block_mut(id).set_lower_bound(index, lower_bound);
    }

    pub fn set_parameter_upper_bound(&mut self, key: &str, index: usize, upper_bound: f64) {
        let id = self.id_for(key, "set an upper bound on");
        self.block_mut(id).set_upper_bound(index, upper_bound);
    }

    pub fn parameter_lower_bound(&self, key: &str, index: usize) -> f64 {
        let id = self.id_for(key, "get a lower bound of");
        self.block(id).lower_bound_for_parameter(index)
    }

    pub fn parameter_upper_bound(&self, key: &str, index: usize) -> f64 {
        let id = self.id_for(key, "get an upper bound of");
        self.block(id).upper_bound_for_parameter(index)
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.program.num_parameter_blocks()
    }

    pub fn num_parameters(&self) -> usize {
        self.program.num_parameters()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.program.num_residual_blocks()
    }

    pub fn num_residuals(&self) -> usize {
        self.program.num_residuals()
    }

    pub fn parameter_block_size(&self, key: &str) -> usize {
        let id = self.id_for(key, "get the size of");
        self.block(id).size()
    }

    pub fn parameter_block_tangent_size(&self, key: &str) -> usize {
        let id = self.id_for(key, "get the tangent size of");
        self.block(id).tangent_size()
    }

    pub fn has_parameter_block(&self, key: &str) -> bool {
        self.parameter_block_map.contains_key(key)
    }

    /// Keys in program order.
    pub fn parameter_block_keys(&self) -> Vec<String> {
        self.program
            .parameter_block_iter()
            .map(|block| block.key().to_string())
            .collect()
    }

    /// Handles in program order.
    pub fn residual_block_ids(&self) -> Vec<ResidualBlockId> {
        self.program.residual_blocks().to_vec()
    }

    pub fn parameter_blocks_for_residual_block(&self, id: ResidualBlockId) -> Vec<String> {
        self.residual(id)
            .parameter_blocks()
            .iter()
            .map(|parameter_block| self.block(*parameter_block).key().to_string())
            .collect()
    }

    /// Residual blocks reading the block, in ascending handle order.
    pub fn residual_blocks_for_parameter_block(&self, key: &str) -> Vec<ResidualBlockId> {
        let id = self.id_for(key, "get the residual blocks of");
        let mut residual_blocks = self.residual_blocks_for(id);
        residual_blocks.sort();
        residual_blocks
    }

    pub fn cost_function_for_residual_block(&self, id: ResidualBlockId) -> Arc<dyn CostFunction> {
        self.residual(id).cost_function().clone()
    }

    pub fn loss_function_for_residual_block(&self, id: ResidualBlockId) -> Option<Loss> {
        self.residual(id).loss_function().cloned()
    }

    pub fn parameter_block_values(&self, key: &str) -> &[f64] {
        let id = self.id_for(key, "read");
        self.block(id).state()
    }

    pub fn set_parameter_block_values(&mut self, key: &str, values: &[f64]) -> CoreResult<()> {
        let id = self.id_for(key, "write");
        self.block_mut(id).set_state(values)
    }

    /// Copy the state of every parameter block in `program`'s array back into the
    /// problem block with the same key.
    pub fn update_from_program(&mut self, program: &Program) -> CoreResult<()> {
        for block in program.parameter_block_iter() {
            let Some(&id) = self.parameter_block_map.get(block.key()) else {
                return Err(CoreError::InvalidInput(format!(
                    "program contains parameter block '{}' which is not part of the problem",
                    block.key()
                )));
            };
            self.block_mut(id).set_state(block.state())?;
        }
        Ok(())
    }

    /// Reduced copy of the problem's program, see [`Program::create_reduced_program`].
    pub fn reduced_program(&self) -> CoreResult<ReducedProgram> {
        self.program
            .create_reduced_program(self.options.evaluation_callback.as_deref())
    }

    /// Evaluate the problem, or the part of it selected by `options`, at the current state.
    ///
    /// The evaluation runs on a temporary program built from the selected blocks, so the
    /// problem itself is left unchanged. Jacobian columns and gradient entries follow the
    /// tangent layout of the selected parameter blocks in the order given.
    pub fn evaluate(
        &self,
        options: &EvaluateOptions,
        request: EvaluationRequest,
    ) -> CoreResult<ProblemEvaluation> {
        let mut program = self.evaluation_program(options)?;
        program.set_parameter_offsets_and_index();

        let evaluator = Evaluator::new(
            &program,
            EvaluatorOptions {
                num_threads: options.num_threads,
                evaluation_callback: self.options.evaluation_callback.clone(),
                thread_pool: self.options.thread_pool.clone(),
            },
        )?;
        let state = program.state_vector();
        evaluator.evaluate(&mut program, &state, options.apply_loss_function, request)
    }

    /// Build the program `evaluate` runs on. Blocks referenced by the selected residual
    /// blocks but not selected themselves are copied in as constant blocks.
    fn evaluation_program(&self, options: &EvaluateOptions) -> CoreResult<Program> {
        let parameter_blocks: Vec<ParameterBlockId> = if options.parameter_blocks.is_empty() {
            self.program.parameter_blocks().to_vec()
        } else {
            let mut seen = HashSet::new();
            let mut ids = Vec::with_capacity(options.parameter_blocks.len());
            for key in &options.parameter_blocks {
                let Some(&id) = self.parameter_block_map.get(key) else {
                    return Err(CoreError::InvalidInput(format!(
                        "no parameter block with key '{key}' in the problem"
                    )));
                };
                if !seen.insert(id) {
                    return Err(CoreError::InvalidInput(format!(
                        "parameter block '{key}' is listed more than once"
                    )));
                }
                ids.push(id);
            }
            ids
        };

        let residual_blocks: Vec<ResidualBlockId> = if options.residual_blocks.is_empty() {
            self.program.residual_blocks().to_vec()
        } else {
            let mut seen = HashSet::new();
            for id in &options.residual_blocks {
                if !self.program.residual_arena.contains_key(id) {
                    return Err(CoreError::InvalidInput(format!(
                        "no residual block {id} in the problem"
                    )));
                }
                if !seen.insert(*id) {
                    return Err(CoreError::InvalidInput(format!(
                        "residual block {id} is listed more than once"
                    )));
                }
            }
            options.residual_blocks.clone()
        };

        let selected: HashSet<ParameterBlockId> = parameter_blocks.iter().copied().collect();
        let mut program = Program::new();
        for id in &parameter_blocks {
            program.push_parameter_block(self.block(*id).clone());
        }
        for id in &residual_blocks {
            let residual_block = self.residual(*id);
            for parameter_block in residual_block.parameter_blocks() {
                if selected.contains(parameter_block)
                    || program.parameter_arena.contains_key(parameter_block)
                {
                    continue;
                }
                let mut block = self.block(*parameter_block).clone();
                block.set_constant();
                program.parameter_arena.insert(*parameter_block, block);
            }
            program.push_residual_block(residual_block.clone());
        }
        Ok(program)
    }

    /// Evaluate a single residual block at the current state.
    ///
    /// `request.residuals` and `request.jacobian` select the outputs; per-block gradients
    /// are not produced. Requesting Jacobians when one of the block's parameter blocks is
    /// constant is an error. `new_point` is forwarded to the evaluation callback.
    pub fn evaluate_residual_block(
        &self,
        id: ResidualBlockId,
        apply_loss_function: bool,
        new_point: bool,
        request: EvaluationRequest,
    ) -> CoreResult<ResidualBlockEvaluation> {
        let Some(residual_block) = self.program.residual_block(id) else {
            return Err(CoreError::InvalidInput(format!(
                "no residual block {id} in the problem"
            )));
        };
        let parameter_blocks = self.program.parameter_blocks_for(residual_block)?;

        if request.jacobian {
            if let Some(block) = parameter_blocks.iter().find(|block| block.is_constant()) {
                return Err(CoreError::InvalidInput(format!(
                    "Jacobians requested for residual block {id}, but parameter block '{}' is constant",
                    block.key()
                )));
            }
        }

        if let Some(callback) = &self.options.evaluation_callback {
            callback.prepare_for_evaluation(request.jacobian, new_point);
        }

        let num_residuals = residual_block.num_residuals();
        let mut residuals = vec![0.0; num_residuals];
        let mut jacobians: Vec<Vec<f64>> = if request.jacobian {
            parameter_blocks
                .iter()
                .map(|block| vec![0.0; num_residuals * block.tangent_size()])
                .collect()
        } else {
            Vec::new()
        };
        let mut slots: Vec<Option<&mut [f64]>> =
            jacobians.iter_mut().map(|j| Some(j.as_mut_slice())).collect();
        let mut scratch = vec![0.0; residual_block.num_scratch_doubles_for_evaluate(&parameter_blocks)];

        let cost = residual_block.evaluate(
            &parameter_blocks,
            apply_loss_function,
            request.residuals.then_some(residuals.as_mut_slice()),
            request.jacobian.then_some(slots.as_mut_slice()),
            &mut scratch,
        )?;
        drop(slots);

        Ok(ResidualBlockEvaluation {
            cost,
            residuals: request.residuals.then_some(residuals),
            jacobians: request.jacobian.then_some(jacobians),
        })
    }

    fn id_for(&self, key: &str, action: &str) -> ParameterBlockId {
        match self.parameter_block_map.get(key) {
            Some(&id) => id,
            None => panic!(
                "Parameter block not found: '{key}'. You must add the parameter block to the \
                 problem before you can {action} it."
            ),
        }
    }

    fn block(&self, id: ParameterBlockId) -> &ParameterBlock {
        match self.program.parameter_arena.get(&id) {
            Some(block) => block,
            None => panic!("parameter block {id} is not part of the problem"),
        }
    }

    fn block_mut(&mut self, id: ParameterBlockId) -> &mut ParameterBlock {
        match self.program.parameter_arena.get_mut(&id) {
            Some(block) => block,
            None => panic!("parameter block {id} is not part of the problem"),
        }
    }

    fn residual(&self, id: ResidualBlockId) -> &ResidualBlock {
        match self.program.residual_arena.get(&id) {
            Some(block) => block,
            None => panic!("residual block {id} is not part of the problem"),
        }
    }

    /// Residual blocks reading `id`, from the dependency set when fast removal is enabled
    /// and by scanning otherwise.
    fn residual_blocks_for(&self, id: ParameterBlockId) -> Vec<ResidualBlockId> {
        if let Some(dependents) = self.block(id).residual_blocks() {
            return dependents.iter().copied().collect();
        }
        self.program
            .residual_block_iter()
            .filter(|block| block.parameter_blocks().contains(&id))
            .map(|block| block.id())
            .collect()
    }
}
