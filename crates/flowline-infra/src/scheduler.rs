//! Thread-based resilience scheduler.
//!
//! Each registration spawns a detached worker thread that re-invokes the
//! instance driver up to `total_attempts` times, spaced by
//! `time_attempts`, giving up early once `retention_time` has elapsed.
//! The handle reports the current attempt (1-based) and whether the
//! attempts are exhausted; the final attempt already reports exhaustion
//! so a failing drive can mark the instance terminally failed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use flowline_core::services::{DriverFn, ResilienceHandle, ResilienceScheduler, RetrySpec};
use flowline_types::ContextMap;

struct RetryHandle {
    attempt: AtomicU32,
    total_attempts: u32,
}

impl ResilienceHandle for RetryHandle {
    fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    fn is_end(&self) -> bool {
        self.attempt() >= self.total_attempts
    }
}

/// Scheduler that runs every registration on its own thread.
#[derive(Default)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl ResilienceScheduler for ThreadScheduler {
    fn add_custom(
        &self,
        spec: RetrySpec,
        driver: DriverFn,
        seed_ctx: ContextMap,
    ) -> Arc<dyn ResilienceHandle> {
        let handle = Arc::new(RetryHandle {
            attempt: AtomicU32::new(0),
            total_attempts: spec.total_attempts,
        });
        let thread_handle = Arc::clone(&handle);

        std::thread::spawn(move || {
            let started = Instant::now();
            for attempt in 1..=spec.total_attempts {
                std::thread::sleep(spec.time_attempts);
                if started.elapsed() >= spec.retention_time {
                    tracing::warn!(
                        instance_id = spec.id.as_str(),
                        tag = spec.tag.as_str(),
                        "retention expired before attempts were exhausted"
                    );
                    thread_handle
                        .attempt
                        .store(spec.total_attempts, Ordering::SeqCst);
                    return;
                }

                thread_handle.attempt.store(attempt, Ordering::SeqCst);
                tracing::info!(
                    instance_id = spec.id.as_str(),
                    tag = spec.tag.as_str(),
                    attempt,
                    total = spec.total_attempts,
                    team = spec.team.as_str(),
                    level = spec.level.as_str(),
                    "re-driving instance"
                );

                match driver(seed_ctx.clone()) {
                    Ok(_) => {
                        tracing::info!(
                            instance_id = spec.id.as_str(),
                            attempt,
                            "instance recovered"
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            instance_id = spec.id.as_str(),
                            attempt,
                            error = %e,
                            "retry attempt failed"
                        );
                    }
                }
            }
            tracing::error!(
                instance_id = spec.id.as_str(),
                tag = spec.tag.as_str(),
                "attempts exhausted; instance is terminally failed"
            );
        });

        handle
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
