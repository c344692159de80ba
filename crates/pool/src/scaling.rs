//! Load balancing and scaling decisions
//!
//! Pure functions over load samples so the policies can be tested without
//! spawning processes.

use tokio::time::Instant;

use crate::worker::WorkerStatus;

/// One worker's load as seen by the pool
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadSample {
    pub status: WorkerStatus,
    pub active_requests: usize,
    pub last_activity: Instant,
}

/// Index of the least-loaded worker with spare capacity.
///
/// Ties go to the earliest worker in iteration order.
pub(crate) fn least_loaded(samples: &[LoadSample], max_per_worker: usize) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (index, sample) in samples.iter().enumerate() {
        if !sample.status.is_active() || sample.active_requests >= max_per_worker {
            continue;
        }
        match best {
            Some((_, load)) if load <= sample.active_requests => {}
            _ => best = Some((index, sample.active_requests)),
        }
    }
    best.map(|(index, _)| index)
}

/// In-flight requests over total capacity of active workers.
///
/// An empty pool reports zero.
pub(crate) fn load_ratio(samples: &[LoadSample], max_per_worker: usize) -> f64 {
    let (active, capacity) = samples
        .iter()
        .filter(|s| s.status.is_active())
        .fold((0usize, 0usize), |(active, capacity), s| {
            (active + s.active_requests, capacity + max_per_worker)
        });
    if capacity == 0 {
        0.0
    } else {
        active as f64 / capacity as f64
    }
}

/// Whether placing `placing` more requests pushes load to the scale-up ratio.
///
/// A pool without active workers never triggers proactive scale-up; dispatch
/// spawns on demand instead.
pub(crate) fn should_scale_up(
    samples: &[LoadSample],
    max_per_worker: usize,
    scale_up_ratio: f64,
    placing: usize,
) -> bool {
    let active: Vec<&LoadSample> = samples.iter().filter(|s| s.status.is_active()).collect();
    if active.is_empty() {
        return false;
    }
    let in_flight: usize = active.iter().map(|s| s.active_requests).sum::<usize>() + placing;
    let capacity = active.len() * max_per_worker;
    in_flight as f64 / capacity as f64 >= scale_up_ratio
}

/// Worker to retire when the pool is underused.
///
/// Only idle workers qualify, the pool never drops below `min_instances`,
/// and the one idle the longest goes first.
pub(crate) fn scale_down_candidate(
    samples: &[LoadSample],
    max_per_worker: usize,
    min_instances: usize,
    scale_down_ratio: f64,
) -> Option<usize> {
    let active = samples.iter().filter(|s| s.status.is_active()).count();
    if active <= min_instances {
        return None;
    }
    if load_ratio(samples, max_per_worker) >= scale_down_ratio {
        return None;
    }

    let mut oldest: Option<(usize, Instant)> = None;
    for (index, sample) in samples.iter().enumerate() {
        if !sample.status.is_active() || sample.active_requests > 0 {
            continue;
        }
        match oldest {
            Some((_, at)) if at <= sample.last_activity => {}
            _ => oldest = Some((index, sample.last_activity)),
        }
    }
    oldest.map(|(index, _)| index)
}
