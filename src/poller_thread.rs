//! A background poller thread that periodically requests configuration from the server and stores
//! it in a configuration store.
use std::{
    sync::{
        mpsc::{RecvTimeoutError, TryRecvError},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::configuration_fetcher::ConfigurationSource;
use crate::configuration_store::ConfigurationStore;
use crate::{Error, Result};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between requests for configuration.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration (added or subtracted) to wait between requests for
    /// configuration. This helps to avoid multiple server instances synchronizing and producing
    /// spiky network load.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
    /// Upper bound for the wait after the server asked us to slow down.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_MAX_BACKOFF`].
    pub max_backoff: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollerThreadConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);
    /// Default value for [`PollerThreadConfig::max_backoff`].
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }

    /// Update maximum backoff with `max_backoff`.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> PollerThreadConfig {
        self.max_backoff = max_backoff;
        self
    }

    /// Wait before the next poll. `rate_limited` is the number of consecutive rate-limited
    /// responses.
    fn next_wait(&self, rate_limited: u32) -> Duration {
        let wait = jitter(self.interval, self.jitter);
        if rate_limited == 0 {
            wait
        } else {
            backoff(wait, rate_limited, self.max_backoff)
        }
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
            max_backoff: PollerThreadConfig::DEFAULT_MAX_BACKOFF,
        }
    }
}

/// A configuration poller thread.
///
/// The poller thread polls the server periodically to fetch the latest configuration using a
/// [`ConfigurationSource`] and stores it in [`ConfigurationStore`].
///
/// A stopped poller cannot be resumed. To restart polling, start a new `PollerThread` over the
/// same store.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    result: Arc<PollerResult>,
}

/// Outcome of the poller thread, shared with [`PollerThread::wait_for_configuration`].
#[derive(Default)]
struct PollerResult {
    /// Holds `None` if configuration hasn't been fetched yet. Holds `Some(Ok(()))` if
    /// configuration has been fetched successfully. Holds `Some(Err(...))` if there was a fatal
    /// error or the thread exited before the first success.
    slot: Mutex<Option<Result<()>>>,
    changed: Condvar,
}

impl PollerResult {
    fn publish(&self, value: Result<()>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(value);
        }
        self.changed.notify_all();
    }

    /// Publish `value` only if nothing has been published yet.
    fn publish_if_pending(&self, value: Result<()>) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        self.changed.notify_all();
    }
}

impl PollerThread {
    /// Starts the configuration poller thread with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an IO error if poller thread failed to start.
    pub fn start(
        source: impl ConfigurationSource,
        store: Arc<ConfigurationStore>,
    ) -> std::io::Result<PollerThread> {
        PollerThread::start_with_config(source, store, PollerThreadConfig::default())
    }

    /// Starts the configuration poller thread with the provided configuration.
    ///
    /// The first fetch happens immediately. Its failure does not prevent the thread from starting.
    ///
    /// # Errors
    ///
    /// Returns an IO error if poller thread failed to start.
    pub fn start_with_config(
        mut source: impl ConfigurationSource,
        store: Arc<ConfigurationStore>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 should be enough for our use case as we're sending a stop
        // command, and we can simply `try_send()` and ignore if the buffer is full (another thread
        // has sent a stop command already).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new(PollerResult::default());

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);

            std::thread::Builder::new()
                .name("eppo-poller".to_owned())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let mut rate_limited = 0;
                        loop {
                            log::debug!(target: "eppo", "fetching new configuration");
                            let current = store.get_configuration();
                            let fetched = source.fetch_configuration(current.as_deref());

                            // A fetch in flight is allowed to complete, but its result is
                            // discarded if we were stopped meanwhile.
                            match stop_receiver.try_recv() {
                                Ok(()) | Err(TryRecvError::Disconnected) => {
                                    log::debug!(target: "eppo", "poller thread stopped during fetch, discarding result");
                                    return;
                                }
                                Err(TryRecvError::Empty) => {}
                            }

                            match fetched {
                                Ok(configuration) => {
                                    log::debug!(target: "eppo", "successfully fetched configuration");
                                    rate_limited = 0;
                                    store.set_configuration(Arc::new(configuration));
                                    result.publish(Ok(()));
                                }
                                Err(err) if !err.is_transient() => {
                                    // Unrecoverable errors
                                    log::warn!(target: "eppo", "stopping poller thread: {err}");
                                    result.publish(Err(err));
                                    return;
                                }
                                Err(err @ Error::RateLimited { .. }) => {
                                    rate_limited += 1;
                                    log::warn!(target: "eppo", rate_limited; "backing off: {err}");
                                }
                                Err(err) => {
                                    // Previous configuration stays active.
                                    rate_limited = 0;
                                    log::warn!(target: "eppo", "failed to fetch configuration: {err}");
                                }
                            }

                            let timeout = config.next_wait(rate_limited);
                            match stop_receiver.recv_timeout(timeout) {
                                Err(RecvTimeoutError::Timeout) => {
                                    // Timed out. Loop back to fetch a new configuration.
                                }
                                Ok(()) => {
                                    log::debug!(target: "eppo", "poller thread received stop command");
                                    // Stop command received, break out of the loop to end the thread.
                                    return;
                                }
                                Err(RecvTimeoutError::Disconnected) => {
                                    // When the other end of channel disconnects, calls to
                                    // .recv_timeout() return immediately.
                                    // Stop the thread.
                                    log::debug!(target: "eppo", "poller thread received disconnected");
                                    return;
                                }
                            }
                        }
                    }));

                    match outcome {
                        // Wake up waiters if the thread is leaving without any outcome.
                        Ok(()) => result.publish_if_pending(Err(Error::PollerThreadStopped)),
                        // If catch_unwind returns Err, it means a panic occurred.
                        Err(_) => result.publish(Err(Error::PollerThreadPanicked)),
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Waits for the configuration to be fetched.
    ///
    /// This method blocks until the poller thread has fetched the configuration, hit a fatal
    /// error, or exited.
    ///
    /// # Errors
    ///
    /// This method can fail with the following errors:
    ///
    /// - [`Error::PollerThreadPanicked`]
    /// - [`Error::PollerThreadStopped`] if the thread was stopped before the first success
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidBaseUrl`]
    ///
    /// # Example
    ///
    /// ```
    /// # fn test(mut poller_thread: eppo_evaluator::PollerThread) {
    /// match poller_thread.wait_for_configuration() {
    ///     Ok(()) => println!("Configuration fetched successfully."),
    ///     Err(err) => eprintln!("Cannot fetch configuration: {:?}", err),
    /// }
    /// # }
    /// ```
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .slot
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => {
                    // The poller has already fetched the configuration. Return Ok(()) or a possible
                    // error.
                    return result.clone();
                }
                None => {
                    // Block waiting for configuration to get fetched.
                    lock = self
                        .result
                        .changed
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop. Calling it more than once is
    /// harmless.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full. First case can be ignored as the thread is already stopped. Second case means
        // another thread already sent a stop command.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`PollerThread::stop`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        // Error means that the thread has panicked and there's nothing useful we can do in that
        // case.
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`, in either direction.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let mut rng = thread_rng();
    let delta = rng.gen_range(Duration::ZERO..=jitter);
    if rng.gen_bool(0.5) {
        interval.saturating_add(delta)
    } else {
        interval.saturating_sub(delta)
    }
}

/// Double `wait` for every consecutive rate-limited response, up to `max_backoff`.
fn backoff(wait: Duration, rate_limited: u32, max_backoff: Duration) -> Duration {
    let factor = 2u32.saturating_pow(rate_limited);
    wait.saturating_mul(factor).min(max_backoff.max(wait))
}

#[cfg(test)]
mod jitter_tests {
    use std::time::Duration;

    #[test]
    fn jitter_stays_within_bounds() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(3);

        for _ in 0..100 {
            let result = super::jitter(interval, jitter);
            assert!(
                Duration::from_secs(27) <= result && result <= Duration::from_secs(33),
                "{result:?} must be within 30s ± 3s"
            );
        }
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let interval = Duration::ZERO;
        let jitter = Duration::from_secs(30);

        for _ in 0..100 {
            assert!(super::jitter(interval, jitter) <= jitter);
        }
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::ZERO;

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::from_secs(30));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc,
        },
        thread::sleep,
        time::Duration,
    };

    use super::{backoff, PollerThread, PollerThreadConfig};
    use crate::{
        configuration_store::ConfigurationStore, ufc::UniversalFlagConfig, Configuration, Error,
        Result,
    };

    fn empty_configuration() -> Configuration {
        Configuration::from_server_response(
            UniversalFlagConfig {
                created_at: None,
                format: Default::default(),
                environment: None,
                flags: HashMap::new(),
                bandit_references: HashMap::new(),
            },
            None,
        )
    }

    /// A source that counts calls and answers with `respond(call_number)`.
    fn counting_source(
        calls: &Arc<AtomicUsize>,
        respond: impl Fn(usize) -> Result<Configuration> + Send + 'static,
    ) -> impl FnMut(Option<&Configuration>) -> Result<Configuration> + Send + 'static {
        let calls = Arc::clone(calls);
        move |_current: Option<&Configuration>| respond(calls.fetch_add(1, Ordering::SeqCst))
    }

    fn fast_config(interval: Duration) -> PollerThreadConfig {
        PollerThreadConfig::new()
            .with_interval(interval)
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn fetches_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(ConfigurationStore::new());
        let poller = PollerThread::start_with_config(
            counting_source(&calls, |_| Ok(empty_configuration())),
            store.clone(),
            fast_config(Duration::from_secs(60 * 60)),
        )
        .unwrap();

        poller.wait_for_configuration().unwrap();
        assert!(store.get_configuration().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        poller.shutdown().unwrap();
    }

    #[test]
    fn polls_periodically_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(ConfigurationStore::new());
        let poller = PollerThread::start_with_config(
            counting_source(&calls, |_| Ok(empty_configuration())),
            store,
            fast_config(Duration::from_millis(20)),
        )
        .unwrap();

        poller.wait_for_configuration().unwrap();
        sleep(Duration::from_millis(100));
        assert!(calls.load(Ordering::SeqCst) >= 2);

        poller.stop();
        // Stopping twice is fine.
        poller.stop();
        sleep(Duration::from_millis(30));
        let after_stop = calls.load(Ordering::SeqCst);
        sleep(Duration::from_millis(40));
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);

        poller.shutdown().unwrap();
    }

    #[test]
    fn unauthorized_stops_the_poller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(ConfigurationStore::new());
        let poller = PollerThread::start_with_config(
            counting_source(&calls, |_| Err(Error::Unauthorized)),
            store.clone(),
            fast_config(Duration::from_millis(5)),
        )
        .unwrap();

        assert!(matches!(
            poller.wait_for_configuration(),
            Err(Error::Unauthorized)
        ));
        sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.get_configuration().is_none());

        poller.shutdown().unwrap();
    }

    #[test]
    fn stop_before_first_success_wakes_waiters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(ConfigurationStore::new());
        let poller = Arc::new(
            PollerThread::start_with_config(
                counting_source(&calls, |_| Err(Error::UnexpectedStatus { status: 503 })),
                store.clone(),
                fast_config(Duration::from_millis(5)),
            )
            .unwrap(),
        );

        let (done_sender, done_receiver) = mpsc::channel();
        let waiter = {
            let poller = Arc::clone(&poller);
            std::thread::spawn(move || {
                let _ = done_sender.send(poller.wait_for_configuration());
            })
        };

        sleep(Duration::from_millis(30));
        poller.stop();

        let waited = done_receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("waiter must be released by stop");
        assert!(matches!(waited, Err(Error::PollerThreadStopped)));
        assert!(matches!(
            poller.wait_for_configuration(),
            Err(Error::PollerThreadStopped)
        ));
        assert!(store.get_configuration().is_none());
        waiter.join().unwrap();
    }

    #[test]
    fn stop_keeps_earlier_success() {
        let store = Arc::new(ConfigurationStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let poller = PollerThread::start_with_config(
            counting_source(&calls, |_| Ok(empty_configuration())),
            store,
            fast_config(Duration::from_secs(60 * 60)),
        )
        .unwrap();
        poller.wait_for_configuration().unwrap();

        poller.stop();
        sleep(Duration::from_millis(30));
        poller.wait_for_configuration().unwrap();
        poller.shutdown().unwrap();
    }

    #[test]
    fn retries_only_transient_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(ConfigurationStore::new());
        let poller = PollerThread::start_with_config(
            counting_source(&calls, |call| match call {
                0 => Err(Error::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                ))),
                1 => Err(Error::RateLimited { status: 429 }),
                _ => Err(Error::InvalidBaseUrl(url::ParseError::EmptyHost)),
            }),
            store.clone(),
            fast_config(Duration::from_millis(5)).with_max_backoff(Duration::from_millis(10)),
        )
        .unwrap();

        assert!(matches!(
            poller.wait_for_configuration(),
            Err(Error::InvalidBaseUrl(_))
        ));
        sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(store.get_configuration().is_none());

        poller.shutdown().unwrap();
    }

    #[test]
    fn keeps_previous_configuration_on_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(ConfigurationStore::new());
        let poller = PollerThread::start_with_config(
            counting_source(&calls, |call| match call {
                0 => Ok(empty_configuration()),
                _ => Err(Error::UnexpectedStatus { status: 503 }),
            }),
            store.clone(),
            fast_config(Duration::from_millis(5)),
        )
        .unwrap();

        poller.wait_for_configuration().unwrap();
        let first = store.get_configuration().unwrap();
        sleep(Duration::from_millis(50));

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(Arc::ptr_eq(&first, &store.get_configuration().unwrap()));

        poller.shutdown().unwrap();
    }

    #[test]
    fn discards_result_fetched_after_stop() {
        let store = Arc::new(ConfigurationStore::new());
        let (entered_sender, entered_receiver) = mpsc::channel();
        let mut call = 0;
        let source = move |_current: Option<&Configuration>| -> Result<Configuration> {
            call += 1;
            if call > 1 {
                let _ = entered_sender.send(());
                sleep(Duration::from_millis(200));
            }
            Ok(empty_configuration())
        };

        let poller = PollerThread::start_with_config(
            source,
            store.clone(),
            fast_config(Duration::from_millis(5)),
        )
        .unwrap();
        poller.wait_for_configuration().unwrap();
        let first = store.get_configuration().unwrap();

        entered_receiver.recv().unwrap();
        poller.stop();
        poller.shutdown().unwrap();

        assert!(Arc::ptr_eq(&first, &store.get_configuration().unwrap()));
    }

    #[test]
    fn can_restart_over_the_same_store() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(ConfigurationStore::new());

        let poller = PollerThread::start_with_config(
            counting_source(&calls, |_| Ok(empty_configuration())),
            store.clone(),
            fast_config(Duration::from_secs(60 * 60)),
        )
        .unwrap();
        poller.wait_for_configuration().unwrap();
        poller.shutdown().unwrap();
        let first = store.get_configuration().unwrap();

        let poller = PollerThread::start_with_config(
            counting_source(&calls, |_| Ok(empty_configuration())),
            store.clone(),
            fast_config(Duration::from_secs(60 * 60)),
        )
        .unwrap();
        poller.wait_for_configuration().unwrap();
        poller.shutdown().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &store.get_configuration().unwrap()));
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let wait = Duration::from_secs(30);
        let max = Duration::from_secs(5 * 60);

        assert_eq!(backoff(wait, 1, max), Duration::from_secs(60));
        assert_eq!(backoff(wait, 2, max), Duration::from_secs(120));
        assert_eq!(backoff(wait, 3, max), Duration::from_secs(240));
        assert_eq!(backoff(wait, 4, max), max);
        assert_eq!(backoff(wait, 100, max), max);
    }

    #[test]
    fn backoff_never_shortens_the_interval() {
        let wait = Duration::from_secs(30);
        assert_eq!(backoff(wait, 3, Duration::from_secs(10)), wait);
    }

    #[test]
    fn next_wait_applies_backoff_only_when_rate_limited() {
        let config = fast_config(Duration::from_secs(30));
        assert_eq!(config.next_wait(0), Duration::from_secs(30));
        assert_eq!(config.next_wait(1), Duration::from_secs(60));
    }
}
