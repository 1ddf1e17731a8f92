use super::Collective;
use crate::TrainingError;

/// Collective for a world of one process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut [f64], root: usize) -> Result<(), TrainingError> {
        if root != 0 {
            return Err(TrainingError::collective(format!(
                "broadcast root {root} does not exist in a world of size 1"
            )));
        }
        Ok(())
    }
}
