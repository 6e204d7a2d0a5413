//! Parameter blocks: the decision variables of a problem.
//!
//! A parameter block owns `size()` doubles of ambient state. An optional [`Manifold`] gives
//! it a tangent space of dimension `tangent_size() ≤ size()`; the plus-Jacobian of that
//! manifold at the current state is cached so residual blocks can map ambient Jacobians
//! into the tangent space without calling back into the manifold.
//!
//! Inside a [`Program`](crate::core::program::Program) each block carries its position
//! (`index`) and its offsets into the concatenated state (`state_offset`) and tangent
//! (`delta_offset`) vectors.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::core::residual_block::ResidualBlockId;
use crate::core::{CoreError, CoreResult};
use crate::manifold::Manifold;

/// Index value of a block that is not placed in an indexed program.
pub const UNINDEXED: i64 = -1;

/// Stable handle of a parameter block inside a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterBlockId(pub(crate) usize);

impl fmt::Display for ParameterBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Clone)]
pub struct ParameterBlock {
    id: ParameterBlockId,
    key: String,
    state: Vec<f64>,
    manifold: Option<Arc<dyn Manifold>>,
    is_set_constant: bool,
    lower_bounds: Option<Vec<f64>>,
    upper_bounds: Option<Vec<f64>>,
    /// Row-major `size × tangent_size`, present when a manifold is set and the block varies
    plus_jacobian: Option<Vec<f64>>,
    index: i64,
    state_offset: usize,
    delta_offset: usize,
    /// Residual blocks referencing this block, tracked only with fast removal enabled
    residual_blocks: Option<HashSet<ResidualBlockId>>,
}

impl ParameterBlock {
    pub fn new(id: ParameterBlockId, key: impl Into<String>, values: &[f64], index: i64) -> Self {
        ParameterBlock {
            id,
            key: key.into(),
            state: values.to_vec(),
            manifold: None,
            is_set_constant: false,
            lower_bounds: None,
            upper_bounds: None,
            plus_jacobian: None,
            index,
            state_offset: 0,
            delta_offset: 0,
            residual_blocks: None,
        }
    }

    pub fn id(&self) -> ParameterBlockId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ambient size.
    pub fn size(&self) -> usize {
        self.state.len()
    }

    pub fn tangent_size(&self) -> usize {
        self.manifold
            .as_ref()
            .map_or(self.state.len(), |manifold| manifold.tangent_size())
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    /// Copy `values` into the block and refresh the cached plus-Jacobian.
    pub fn set_state(&mut self, values: &[f64]) -> CoreResult<()> {
        if values.len() != self.state.len() {
            return Err(CoreError::InvalidInput(format!(
                "parameter block '{}' has size {}, got {} values",
                self.key,
                self.state.len(),
                values.len()
            )));
        }
        self.state.copy_from_slice(values);
        if !self.is_constant() {
            self.update_plus_jacobian()?;
        }
        Ok(())
    }

    /// A block is constant when explicitly marked so or when its tangent space is empty.
    pub fn is_constant(&self) -> bool {
        self.is_set_constant || self.tangent_size() == 0
    }

    pub fn set_constant(&mut self) {
        self.is_set_constant = true;
    }

    /// Mark the block as varying again. The plus-Jacobian is refreshed since it is not
    /// maintained while the block is constant.
    pub fn set_varying(&mut self) -> CoreResult<()> {
        self.is_set_constant = false;
        self.update_plus_jacobian()
    }

    pub fn manifold(&self) -> Option<&Arc<dyn Manifold>> {
        self.manifold.as_ref()
    }

    /// Attach or detach a manifold.
    ///
    /// # Panics
    ///
    /// Panics if the manifold's ambient size differs from the block size.
    pub fn set_manifold(&mut self, manifold: Option<Arc<dyn Manifold>>) -> CoreResult<()> {
        if let Some(manifold) = &manifold {
            assert_eq!(
                manifold.ambient_size(),
                self.size(),
                "manifold ambient size does not match the size of parameter block '{}'",
                self.key
            );
        }
        self.manifold = manifold;
        self.update_plus_jacobian()
    }

    pub fn plus_jacobian(&self) -> Option<&[f64]> {
        self.plus_jacobian.as_deref()
    }

    fn update_plus_jacobian(&mut self) -> CoreResult<()> {
        let Some(manifold) = &self.manifold else {
            self.plus_jacobian = None;
            return Ok(());
        };
        let tangent_size = manifold.tangent_size();
        if tangent_size == 0 {
            self.plus_jacobian = None;
            return Ok(());
        }

        let mut jacobian = vec![0.0; self.state.len() * tangent_size];
        if !manifold.plus_jacobian(&self.state, &mut jacobian) {
            self.plus_jacobian = None;
            return Err(CoreError::Manifold(format!(
                "plus-Jacobian evaluation failed for parameter block '{}' at {:?}",
                self.key, self.state
            )));
        }
        self.plus_jacobian = Some(jacobian);
        Ok(())
    }

    pub fn lower_bound_for_parameter(&self, index: usize) -> f64 {
        self.lower_bounds
            .as_ref()
            .map_or(-f64::MAX, |bounds| bounds[index])
    }

    pub fn upper_bound_for_parameter(&self, index: usize) -> f64 {
        self.upper_bounds
            .as_ref()
            .map_or(f64::MAX, |bounds| bounds[index])
    }

    pub fn set_lower_bound(&mut self, index: usize, lower_bound: f64) {
        assert!(
            index < self.size(),
            "bound index {index} out of range for parameter block '{}' of size {}",
            self.key,
            self.size()
        );
        let size = self.size();
        self.lower_bounds.get_or_insert_with(|| vec![-f64::MAX; size])[index] = lower_bound;
    }

    pub fn set_upper_bound(&mut self, index: usize, upper_bound: f64) {
        assert!(
            index < self.size(),
            "bound index {index} out of range for parameter block '{}' of size {}",
            self.key,
            self.size()
        );
        let size = self.size();
        self.upper_bounds.get_or_insert_with(|| vec![f64::MAX; size])[index] = upper_bound;
    }

    pub fn has_bounds(&self) -> bool {
        self.lower_bounds.is_some() || self.upper_bounds.is_some()
    }

    /// `x_plus_delta = x ⊞ delta`, projected onto the bounds.
    ///
    /// Uses the manifold when present and plain addition otherwise. Returns `false` when
    /// the manifold retraction fails.
    pub fn plus(&self, x: &[f64], delta: &[f64], x_plus_delta: &mut [f64]) -> bool {
        match &self.manifold {
            Some(manifold) => {
                if !manifold.plus(x, delta, x_plus_delta) {
                    return false;
                }
            }
            None => {
                for ((out, xi), di) in x_plus_delta.iter_mut().zip(x).zip(delta) {
                    *out = xi + di;
                }
            }
        }

        if let Some(lower) = &self.lower_bounds {
            for (value, &bound) in x_plus_delta.iter_mut().zip(lower) {
                *value = value.max(bound);
            }
        }
        if let Some(upper) = &self.upper_bounds {
            for (value, &bound) in x_plus_delta.iter_mut().zip(upper) {
                *value = value.min(bound);
            }
        }
        true
    }

    pub fn is_finite(&self) -> bool {
        self.state.iter().all(|value| value.is_finite())
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: i64) {
        self.index = index;
    }

    pub fn state_offset(&self) -> usize {
        self.state_offset
    }

    pub(crate) fn set_state_offset(&mut self, offset: usize) {
        self.state_offset = offset;
    }

    pub fn delta_offset(&self) -> usize {
        self.delta_offset
    }

    pub(crate) fn set_delta_offset(&mut self, offset: usize) {
        self.delta_offset = offset;
    }

    /// Start tracking which residual blocks reference this block.
    pub(crate) fn enable_residual_block_dependencies(&mut self) {
        self.residual_blocks.get_or_insert_with(HashSet::new);
    }

    pub(crate) fn add_residual_block(&mut self, residual_block: ResidualBlockId) {
        match &mut self.residual_blocks {
            Some(set) => {
                set.insert(residual_block);
            }
            None => warn!(
                "Dependency tracking is disabled for parameter block '{}'",
                self.key
            ),
        }
    }

    pub(crate) fn remove_residual_block(&mut self, residual_block: ResidualBlockId) {
        if let Some(set) = &mut self.residual_blocks {
            set.remove(&residual_block);
        }
    }

    pub fn residual_blocks(&self) -> Option<&HashSet<ResidualBlockId>> {
        self.residual_blocks.as_ref()
    }
}

impl fmt::Debug for ParameterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterBlock")
            .field("key", &self.key)
            .field("size", &self.size())
            .field("tangent_size", &self.tangent_size())
            .field("constant", &self.is_constant())
            .field("index", &self.index)
            .finish()
    }
}

impl fmt::Display for ParameterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' size: {} tangent size: {} constant: {} index: {} state offset: {} delta offset: {}",
            self.id,
            self.key,
            self.size(),
            self.tangent_size(),
            self.is_constant(),
            self.index,
            self.state_offset,
            self.delta_offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{QuaternionManifold, SubsetManifold};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn block(values: &[f64]) -> ParameterBlock {
        ParameterBlock::new(ParameterBlockId(0), "x", values, UNINDEXED)
    }

    #[test]
    fn test_plus_without_manifold_adds() {
        let block = block(&[1.0, 2.0]);
        let mut out = [0.0; 2];
        assert!(block.plus(&[1.0, 2.0], &[0.5, -0.5], &mut out));
        assert_eq!(out, [1.5, 1.5]);
    }

    #[test]
    fn test_plus_projects_onto_bounds() {
        let mut block = block(&[0.0, 0.0, 0.0]);
        block.set_lower_bound(0, -1.0);
        block.set_upper_bound(2, 0.5);
        let mut out = [0.0; 3];
        assert!(block.plus(&[0.0, 0.0, 0.0], &[-3.0, 7.0, 2.0], &mut out));
        assert_eq!(out, [-1.0, 7.0, 0.5]);
        assert_eq!(block.lower_bound_for_parameter(1), -f64::MAX);
        assert_eq!(block.upper_bound_for_parameter(1), f64::MAX);
    }

    #[test]
    fn test_manifold_sets_tangent_size_and_jacobian() -> TestResult {
        let mut block = block(&[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(block.tangent_size(), 4);
        assert!(block.plus_jacobian().is_none());

        block.set_manifold(Some(Arc::new(QuaternionManifold::new())))?;
        assert_eq!(block.tangent_size(), 3);
        let jacobian = block.plus_jacobian().ok_or("missing plus-Jacobian")?;
        assert_eq!(jacobian.len(), 12);
        // Row 1 at the identity is [w, z, -y] = [1, 0, 0]
        assert_eq!(&jacobian[3..6], &[1.0, 0.0, 0.0]);

        block.set_manifold(None)?;
        assert!(block.plus_jacobian().is_none());
        assert_eq!(block.tangent_size(), 4);
        Ok(())
    }

    #[test]
    fn test_zero_tangent_manifold_makes_block_constant() -> TestResult {
        let mut block = block(&[1.0, 2.0]);
        assert!(!block.is_constant());
        block.set_manifold(Some(Arc::new(SubsetManifold::new(2, &[0, 1])?)))?;
        assert!(block.is_constant());
        Ok(())
    }

    #[test]
    fn test_set_state_checks_size() -> TestResult {
        let mut block = block(&[1.0, 2.0]);
        block.set_state(&[3.0, 4.0])?;
        assert_eq!(block.state(), &[3.0, 4.0]);
        assert!(block.set_state(&[1.0]).is_err());
        Ok(())
    }

    #[test]
    fn test_constant_and_varying() -> TestResult {
        let mut block = block(&[1.0]);
        block.set_constant();
        assert!(block.is_constant());
        block.set_varying()?;
        assert!(!block.is_constant());
        Ok(())
    }

    #[test]
    #[should_panic(expected = "manifold ambient size does not match")]
    fn test_manifold_size_mismatch_panics() {
        let mut block = block(&[1.0, 2.0, 3.0]);
        let _ = block.set_manifold(Some(Arc::new(QuaternionManifold::new())));
    }
}
