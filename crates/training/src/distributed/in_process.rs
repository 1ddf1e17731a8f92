use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::Collective;
use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    AllReduceSum,
    Broadcast { root: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Collecting,
    Draining,
}

#[derive(Debug)]
struct Round {
    generation: u64,
    phase: Phase,
    op: Option<(Op, usize)>,
    contributions: Vec<Option<Vec<f64>>>,
    arrived: usize,
    departed: usize,
    result: Vec<f64>,
    failure: Option<String>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    timeout: Option<Duration>,
    round: Mutex<Round>,
    signal: Condvar,
}

/// Rendezvous shared by ranks running as threads of one process.
#[derive(Debug, Clone)]
pub struct InProcessGroup {
    shared: Arc<Shared>,
}

impl InProcessGroup {
    pub fn new(world_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                world_size,
                timeout,
                round: Mutex::new(Round {
                    generation: 0,
                    phase: Phase::Collecting,
                    op: None,
                    contributions: vec![None; world_size],
                    arrived: 0,
                    departed: 0,
                    result: Vec::new(),
                    failure: None,
                }),
                signal: Condvar::new(),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    pub fn member(&self, rank: usize) -> InProcessCollective {
        InProcessCollective {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fails every pending and future collective of the group.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut round = self.shared.round.lock();
        if round.failure.is_none() {
            round.failure = Some(reason.into());
        }
        self.shared.signal.notify_all();
    }
}

/// One rank's handle on an [`InProcessGroup`].
#[derive(Debug)]
pub struct InProcessCollective {
    rank: usize,
    shared: Arc<Shared>,
}

impl InProcessCollective {
    fn exchange(&self, op: Op, values: &mut [f64]) -> Result<(), TrainingError> {
        let world_size = self.shared.world_size;
        if self.rank >= world_size {
            return Err(TrainingError::collective(format!(
                "rank {} is outside in-process group of size {world_size}",
                self.rank
            )));
        }

        let deadline = self.shared.timeout.map(|timeout| Instant::now() + timeout);
        let mut round = self.shared.round.lock();

        self.wait_until(&mut round, deadline, "the previous collective to drain", |round| {
            round.phase == Phase::Collecting
        })?;

        match round.op {
            None => round.op = Some((op, values.len())),
            Some((expected, len)) if expected != op || len != values.len() => {
                let reason = format!(
                    "rank {} entered {:?} over {} values while the group runs {:?} over {}",
                    self.rank,
                    op,
                    values.len(),
                    expected,
                    len
                );
                return Err(self.fail(&mut round, reason));
            }
            Some(_) => {}
        }
        if round.contributions[self.rank].is_some() {
            let reason = format!("rank {} entered the same collective twice", self.rank);
            return Err(self.fail(&mut round, reason));
        }

        round.contributions[self.rank] = Some(values.to_vec());
        round.arrived += 1;
        let generation = round.generation;

        if round.arrived == world_size {
            match combine(op, &round.contributions, values.len()) {
                Ok(result) => round.result = result,
                Err(reason) => return Err(self.fail(&mut round, reason)),
            }
            round.phase = Phase::Draining;
            self.shared.signal.notify_all();
        } else {
            self.wait_until(&mut round, deadline, "the remaining ranks", |round| {
                round.phase == Phase::Draining && round.generation == generation
            })?;
        }

        values.copy_from_slice(&round.result);
        round.departed += 1;
        if round.departed == world_size {
            round.generation += 1;
            round.phase = Phase::Collecting;
            round.op = None;
            round.arrived = 0;
            round.departed = 0;
            round.result.clear();
            for slot in round.contributions.iter_mut() {
                *slot = None;
            }
            self.shared.signal.notify_all();
        }
        Ok(())
    }

    fn wait_until<F>(
        &self,
        round: &mut MutexGuard<'_, Round>,
        deadline: Option<Instant>,
        what: &str,
        ready: F,
    ) -> Result<(), TrainingError>
    where
        F: Fn(&Round) -> bool,
    {
        loop {
            if let Some(reason) = &round.failure {
                return Err(TrainingError::collective(format!(
                    "process group aborted: {reason}"
                )));
            }
            if ready(round) {
                return Ok(());
            }
            match deadline {
                None => self.shared.signal.wait(round),
                Some(deadline) => {
                    if self.shared.signal.wait_until(round, deadline).timed_out() && !ready(round)
                    {
                        let reason = format!("rank {} timed out waiting for {what}", self.rank);
                        return Err(self.fail(round, reason));
                    }
                }
            }
        }
    }

    fn fail(&self, round: &mut MutexGuard<'_, Round>, reason: String) -> TrainingError {
        if round.failure.is_none() {
            round.failure = Some(reason.clone());
        }
        self.shared.signal.notify_all();
        TrainingError::collective(reason)
    }
}

impl Collective for InProcessCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        self.exchange(Op::AllReduceSum, values)
    }

    fn broadcast(&self, values: &mut [f64], root: usize) -> Result<(), TrainingError> {
        self.exchange(Op::Broadcast { root }, values)
    }
}

/// Sums in rank order so every run produces bit-identical totals.
fn combine(op: Op, contributions: &[Option<Vec<f64>>], len: usize) -> Result<Vec<f64>, String> {
    match op {
        Op::AllReduceSum => {
            let mut total = vec![0.0; len];
            for contribution in contributions.iter().flatten() {
                for (acc, value) in total.iter_mut().zip(contribution) {
                    *acc += value;
                }
            }
            Ok(total)
        }
        Op::Broadcast { root } => contributions
            .get(root)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| {
                format!(
                    "broadcast root {root} does not exist in a group of size {}",
                    contributions.len()
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ranks<T, F>(world_size: usize, timeout: Option<Duration>, body: F) -> Vec<T>
    where
        T: Send,
        F: Fn(InProcessCollective) -> T + Sync,
    {
        let group = InProcessGroup::new(world_size, timeout);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..world_size)
                .map(|rank| {
                    let member = group.member(rank);
                    let body = &body;
                    scope.spawn(move || body(member))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_reduce_sums_every_contribution() {
        let results = run_ranks(3, None, |member| {
            let mut values = vec![member.rank() as f64, 1.0];
            member.all_reduce_sum(&mut values).unwrap();
            values
        });
        for values in results {
            assert_eq!(values, vec![3.0, 3.0]);
        }
    }

    #[test]
    fn consecutive_rounds_do_not_mix() {
        let results = run_ranks(4, None, |member| {
            let mut totals = Vec::new();
            for round in 0..20 {
                let mut values = [(member.rank() * round) as f64];
                member.all_reduce_sum(&mut values).unwrap();
                totals.push(values[0]);
            }
            totals
        });
        let expected: Vec<f64> = (0..20).map(|round| (6 * round) as f64).collect();
        for totals in results {
            assert_eq!(totals, expected);
        }
    }

    #[test]
    fn broadcast_copies_root_values() {
        let results = run_ranks(3, None, |member| {
            let mut values = vec![member.rank() as f64 * 10.0; 2];
            member.broadcast(&mut values, 2).unwrap();
            values
        });
        for values in results {
            assert_eq!(values, vec![20.0, 20.0]);
        }
    }

    #[test]
    fn mismatched_lengths_fail_every_rank() {
        let results = run_ranks(2, Some(Duration::from_secs(5)), |member| {
            let mut values = vec![0.0; member.rank() + 1];
            member.all_reduce_sum(&mut values)
        });
        assert!(results
            .iter()
            .all(|result| matches!(result, Err(TrainingError::Collective(_)))));
    }

    #[test]
    fn missing_rank_times_out() {
        let group = InProcessGroup::new(2, Some(Duration::from_millis(50)));
        let member = group.member(0);
        let err = member.all_reduce_sum(&mut [1.0]).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        // the group stays failed
        assert!(group.member(1).all_reduce_sum(&mut [1.0]).is_err());
    }

    #[test]
    fn abort_releases_waiting_ranks() {
        let group = InProcessGroup::new(2, None);
        let member = group.member(0);
        std::thread::scope(|scope| {
            let waiter = scope.spawn(move || member.barrier());
            std::thread::sleep(Duration::from_millis(20));
            group.abort("rank 1 failed");
            let result = waiter.join().unwrap();
            assert!(matches!(result, Err(TrainingError::Collective(_))));
        });
    }
}
