use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use super::{Backend, Collective, DistributedContext, InProcessGroup};
use crate::TrainingError;

/// Runs `worker` once per rank on its own thread, joined through an in-process group.
///
/// The first failing or panicking rank aborts the group so peers blocked in a
/// collective return instead of waiting out the timeout. Results come back in
/// rank order.
pub fn spawn_workers<F, T>(
    world_size: usize,
    timeout: Option<Duration>,
    worker: F,
) -> Result<Vec<T>, TrainingError>
where
    F: Fn(DistributedContext, Arc<dyn Collective>) -> Result<T, TrainingError> + Sync,
    T: Send,
{
    if world_size == 0 {
        return Err(TrainingError::initialization(
            "cannot spawn a world of size 0",
        ));
    }
    let group = InProcessGroup::new(world_size, timeout);
    let first_failure: Mutex<Option<(usize, TrainingError)>> = Mutex::new(None);

    let results: Vec<Option<T>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let group = &group;
            let worker = &worker;
            let first_failure = &first_failure;
            let handle = thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(scope, move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        let context = DistributedContext::new(rank, world_size, Backend::InProcess)?;
                        let collective: Arc<dyn Collective> = Arc::new(group.member(rank));
                        worker(context, collective)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(TrainingError::runtime(format!(
                            "rank {rank} panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    });
                    match outcome {
                        Ok(value) => Some(value),
                        Err(err) => {
                            log::error!("rank {rank} failed: {err}");
                            let reason = format!("rank {rank} failed: {err}");
                            {
                                let mut slot = first_failure.lock();
                                if slot.is_none() {
                                    *slot = Some((rank, err));
                                }
                            }
                            group.abort(reason);
                            None
                        }
                    }
                });
            match handle {
                Ok(handle) => handles.push((rank, Some(handle))),
                Err(err) => {
                    group.abort(format!("failed to start rank {rank}"));
                    let mut slot = first_failure.lock();
                    if slot.is_none() {
                        *slot = Some((
                            rank,
                            TrainingError::initialization(format!(
                                "failed to start thread for rank {rank}: {err}"
                            )),
                        ));
                    }
                    handles.push((rank, None));
                }
            }
        }

        handles
            .into_iter()
            .map(|(rank, handle)| match handle?.join() {
                Ok(value) => value,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    group.abort(format!("rank {rank} panicked"));
                    let mut slot = first_failure.lock();
                    if slot.is_none() {
                        *slot = Some((
                            rank,
                            TrainingError::runtime(format!("rank {rank} panicked: {message}")),
                        ));
                    }
                    None
                }
            })
            .collect()
    });

    if let Some((_, err)) = first_failure.into_inner() {
        return Err(err);
    }
    results
        .into_iter()
        .enumerate()
        .map(|(rank, value)| {
            value.ok_or_else(|| TrainingError::runtime(format!("rank {rank} produced no result")))
        })
        .collect()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
