//! Provider bundle.
//!
//! [`Providers`] groups the network, time and task providers behind one
//! type parameter so the client and server read `IsoClient<P, C>` rather
//! than carrying three provider parameters each.

use crate::{
    NetworkProvider, TaskProvider, TimeProvider, TokioNetworkProvider, TokioTaskProvider,
    TokioTimeProvider,
};

/// Bundle of all provider types for a runtime environment.
pub trait Providers: Clone + 'static {
    /// Network provider type for TCP connections and listeners.
    type Network: NetworkProvider + Clone + 'static;

    /// Time provider type for sleep, timeout and time queries.
    type Time: TimeProvider + Clone + 'static;

    /// Task provider type for spawning local tasks.
    type Task: TaskProvider + Clone + 'static;

    /// Get the network provider instance.
    fn network(&self) -> &Self::Network;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;
}

/// Production providers using the Tokio runtime.
///
/// ```rust
/// use isolink_core::{Providers, TimeProvider, TokioProviders};
///
/// let providers = TokioProviders::new();
/// let _elapsed = providers.time().now();
/// ```
#[derive(Clone, Debug)]
pub struct TokioProviders {
    network: TokioNetworkProvider,
    time: TokioTimeProvider,
    task: TokioTaskProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self {
            network: TokioNetworkProvider::new(),
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
        }
    }
}

impl Default for TokioProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl Providers for TokioProviders {
    type Network = TokioNetworkProvider;
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;

    fn network(&self) -> &Self::Network {
        &self.network
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}
