//! Timeout-bounded polling.
//!
//! Replies and session activation are observed by checking a condition at a
//! fixed interval rather than by parking on a signal. The condition is a
//! plain closure evaluated on the current task, so it may read shared state
//! freely as long as it does not hold a borrow across the interval sleep
//! (it cannot: the closure returns before the sleep starts).

use std::time::Duration;

use isolink_core::{TaskProvider, TimeProvider};
use tokio::task::JoinHandle;

/// How many times a condition is re-checked before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBudget {
    /// Give up after this many sleeps.
    Iterations(u64),
    /// Never give up.
    Unbounded,
}

impl PollBudget {
    /// Budget covering `timeout` at the given `interval`, at least one
    /// iteration.
    ///
    /// ```
    /// use std::time::Duration;
    /// use isolink_transport::PollBudget;
    ///
    /// let budget = PollBudget::from_timeout(Duration::from_secs(5), Duration::from_millis(200));
    /// assert_eq!(budget, PollBudget::Iterations(25));
    /// ```
    pub fn from_timeout(timeout: Duration, interval: Duration) -> Self {
        let iterations = timeout
            .as_nanos()
            .checked_div(interval.as_nanos())
            .unwrap_or(1)
            .max(1);
        PollBudget::Iterations(u64::try_from(iterations).unwrap_or(u64::MAX))
    }
}

/// The budget ran out before the condition held.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("condition not met after {iterations} polls at {interval:?}")]
pub struct PollTimeout {
    /// Number of sleeps performed.
    pub iterations: u64,
    /// Sleep between checks.
    pub interval: Duration,
}

/// Check `check` now and after every `interval` until it yields a value.
///
/// The condition is evaluated once up front and once after each sleep, so an
/// `Iterations(n)` budget evaluates it at most `n + 1` times and waits
/// roughly `n * interval` in total.
///
/// # Errors
///
/// Returns [`PollTimeout`] when the budget is exhausted, or when the time
/// provider stops serving sleeps.
pub async fn await_until<T, Tm, F>(
    time: &Tm,
    interval: Duration,
    budget: PollBudget,
    mut check: F,
) -> Result<T, PollTimeout>
where
    Tm: TimeProvider,
    F: FnMut() -> Option<T>,
{
    let mut iterations = 0u64;
    loop {
        if let Some(value) = check() {
            return Ok(value);
        }

        if let PollBudget::Iterations(max) = budget
            && iterations >= max
        {
            return Err(PollTimeout {
                iterations,
                interval,
            });
        }

        if time.sleep(interval).await.is_err() {
            return Err(PollTimeout {
                iterations,
                interval,
            });
        }
        iterations += 1;
    }
}

/// Run [`await_until`] on its own local task and hand the outcome to
/// `on_result`, exactly once.
pub fn spawn_await_until<T, Tm, Tp, F, R>(
    time: Tm,
    tasks: &Tp,
    interval: Duration,
    budget: PollBudget,
    check: F,
    on_result: R,
) -> JoinHandle<()>
where
    T: 'static,
    Tm: TimeProvider + 'static,
    Tp: TaskProvider,
    F: FnMut() -> Option<T> + 'static,
    R: FnOnce(Result<T, PollTimeout>) + 'static,
{
    tasks.spawn_task("await_until", async move {
        let result = await_until(&time, interval, budget, check).await;
        on_result(result);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolink_core::{TokioTaskProvider, TokioTimeProvider};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const INTERVAL: Duration = Duration::from_millis(200);

    #[test]
    fn test_budget_from_timeout() {
        assert_eq!(
            PollBudget::from_timeout(Duration::from_millis(600), INTERVAL),
            PollBudget::Iterations(3)
        );
        assert_eq!(
            PollBudget::from_timeout(Duration::from_millis(50), INTERVAL),
            PollBudget::Iterations(1)
        );
        assert_eq!(
            PollBudget::from_timeout(Duration::from_secs(1), Duration::ZERO),
            PollBudget::Iterations(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_condition_returns_without_sleeping() {
        let time = TokioTimeProvider::new();
        let value = await_until(&time, INTERVAL, PollBudget::Iterations(0), || Some(7))
            .await
            .expect("ready");
        assert_eq!(value, 7);
        assert_eq!(time.now(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_waits_the_full_timeout() {
        let time = TokioTimeProvider::new();
        let checks = Cell::new(0);
        let err = await_until(&time, INTERVAL, PollBudget::Iterations(3), || {
            checks.set(checks.get() + 1);
            None::<()>
        })
        .await
        .expect_err("never ready");

        assert_eq!(
            err,
            PollTimeout {
                iterations: 3,
                interval: INTERVAL
            }
        );
        assert_eq!(checks.get(), 4);
        assert!(time.now() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_met_midway() {
        let time = TokioTimeProvider::new();
        let checks = Cell::new(0);
        let value = await_until(&time, INTERVAL, PollBudget::Unbounded, || {
            checks.set(checks.get() + 1);
            (checks.get() == 5).then_some("done")
        })
        .await
        .expect("ready on fifth check");

        assert_eq!(value, "done");
        assert!(time.now() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_poll_reports_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let results = Rc::new(RefCell::new(Vec::new()));
                let sink = results.clone();
                let ready_at = Rc::new(Cell::new(0));
                let counter = ready_at.clone();

                let handle = spawn_await_until(
                    TokioTimeProvider::new(),
                    &TokioTaskProvider,
                    INTERVAL,
                    PollBudget::Iterations(10),
                    move || {
                        counter.set(counter.get() + 1);
                        (counter.get() > 2).then_some(counter.get())
                    },
                    move |result| sink.borrow_mut().push(result),
                );
                handle.await.expect("join");

                assert_eq!(*results.borrow(), vec![Ok(3)]);
            })
            .await;
    }
}
