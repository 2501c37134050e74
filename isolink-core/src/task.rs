//! Task spawning for single-threaded runtimes.
//!
//! Every background loop (connection task, poll task, accept loop) is
//! spawned through a [`TaskProvider`]. The Tokio implementation uses
//! `spawn_local`, so callers must run inside a `LocalSet`.

use std::future::Future;

/// Provider for spawning local tasks.
pub trait TaskProvider: Clone {
    /// Spawn a named task on the current thread.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// Tokio task provider built on `spawn_local`.
#[derive(Clone, Debug, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!("Task {} starting", task_name);
            future.await;
            tracing::trace!("Task {} completed", task_name);
        })
    }
}
