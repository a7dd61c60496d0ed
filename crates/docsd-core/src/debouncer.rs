//! Build-request coalescing state machine (§4.2).
//!
//! Consumes [`BuildRequested`] off its inbound bus and emits at most one
//! [`BuildNow`] per coalesced burst, gated on a caller-supplied
//! `check_build_running` predicate so a burst arriving mid-build waits for
//! that build to finish instead of racing it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use docsd_types::{BuildNow, BuildRequested, DebounceCause};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::shutdown::ShutdownSignal;

/// Tuning knobs for one debouncer instance.
#[derive(Debug, Clone, Copy)]
pub struct DebouncerConfig {
    pub quiet_window: std::time::Duration,
    pub max_delay: std::time::Duration,
    pub poll_interval: std::time::Duration,
}

impl Default for DebouncerConfig {
    fn default() -> Self {
        Self {
            quiet_window: std::time::Duration::from_millis(200),
            max_delay: std::time::Duration::from_secs(2),
            poll_interval: std::time::Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
struct Burst {
    job_id: String,
    job_id_is_generated: bool,
    first_request: DateTime<Utc>,
    last_request: DateTime<Utc>,
    request_count: u64,
    last_reason: String,
    last_repo_url: String,
    last_branch: String,
}

#[derive(Debug, Clone)]
enum State {
    Idle,
    Coalescing(Burst),
    Deferred(Burst),
}

struct Shared {
    state: AsyncMutex<State>,
    ready: Notify,
}

/// Handle to a running debouncer task. Cloneable; all clones observe the
/// same underlying state machine.
#[derive(Clone)]
pub struct Debouncer {
    shared: Arc<Shared>,
}

fn generate_job_id() -> String {
    format!("orchestrated-build-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

impl Debouncer {
    /// The job id the debouncer will announce for its next `BuildNow`, if a
    /// burst is currently in flight. Lets later producers in the same burst
    /// piggyback on the already-announced id.
    pub async fn planned_job_id(&self) -> Option<String> {
        match &*self.shared.state.lock().await {
            State::Idle => None,
            State::Coalescing(b) | State::Deferred(b) => Some(b.job_id.clone()),
        }
    }

    /// Resolves once the debouncer's receive loop has started, so producers
    /// racing the spawn don't publish into a bus nobody is listening on yet.
    pub async fn wait_ready(&self) {
        self.shared.ready.notified().await;
    }

    /// Spawn the debouncer task. Returns the handle and its join handle.
    pub fn spawn(
        config: DebouncerConfig,
        bus_in: EventBus<BuildRequested>,
        bus_out: EventBus<BuildNow>,
        check_build_running: Arc<dyn Fn() -> bool + Send + Sync>,
        mut shutdown: ShutdownSignal,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            state: AsyncMutex::new(State::Idle),
            ready: Notify::new(),
        });
        let handle = Self {
            shared: Arc::clone(&shared),
        };

        let join = tokio::spawn(async move {
            let (mut rx, _unsub) = bus_in.subscribe(256);
            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            shared.ready.notify_waiters();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("debouncer shutting down");
                        return;
                    }
                    maybe_req = rx.recv() => {
                        let Some(req) = maybe_req else { return };
                        Self::on_request(&shared, &bus_out, &config, &check_build_running, req).await;
                    }
                    _ = ticker.tick() => {
                        Self::on_tick(&shared, &bus_out, &config, &check_build_running).await;
                    }
                }
            }
        });

        (handle, join)
    }

    async fn on_request(
        shared: &Arc<Shared>,
        bus_out: &EventBus<BuildNow>,
        config: &DebouncerConfig,
        check_build_running: &Arc<dyn Fn() -> bool + Send + Sync>,
        req: BuildRequested,
    ) {
        let now = Utc::now();

        if req.immediate {
            let mut state = shared.state.lock().await;
            if matches!(&*state, State::Idle) {
                let job_id = req.job_id.unwrap_or_else(generate_job_id);
                Self::emit(bus_out, job_id, 1, req.reason, req.repo_url, req.branch, now, now, DebounceCause::Immediate);
                return;
            }
            // An immediate request arriving mid-burst folds into the burst's
            // bookkeeping instead of double-emitting.
            Self::fold_into_burst(&mut state, req, now);
            return;
        }

        let mut state = shared.state.lock().await;
        match &mut *state {
            State::Idle => {
                let job_id_is_generated = req.job_id.is_none();
                let job_id = req.job_id.clone().unwrap_or_else(generate_job_id);
                *state = State::Coalescing(Burst {
                    job_id,
                    job_id_is_generated,
                    first_request: now,
                    last_request: now,
                    request_count: 1,
                    last_reason: req.reason,
                    last_repo_url: req.repo_url,
                    last_branch: req.branch,
                });
            }
            State::Coalescing(_) | State::Deferred(_) => {
                Self::fold_into_burst(&mut state, req, now);
            }
        }
        drop(state);
        Self::maybe_emit(shared, bus_out, config, check_build_running).await;
    }

    fn fold_into_burst(state: &mut State, req: BuildRequested, now: DateTime<Utc>) {
        let burst = match state {
            State::Coalescing(b) | State::Deferred(b) => b,
            State::Idle => return,
        };
        burst.last_request = now;
        burst.request_count += 1;
        burst.last_reason = req.reason;
        burst.last_repo_url = req.repo_url;
        burst.last_branch = req.branch;
        if burst.job_id_is_generated {
            if let Some(job_id) = req.job_id {
                burst.job_id = job_id;
                burst.job_id_is_generated = false;
            }
        }
    }

    async fn on_tick(
        shared: &Arc<Shared>,
        bus_out: &EventBus<BuildNow>,
        config: &DebouncerConfig,
        check_build_running: &Arc<dyn Fn() -> bool + Send + Sync>,
    ) {
        // Deferred state is purely a poll of check_build_running(); no
        // timer re-arming happens here regardless of elapsed time.
        let should_emit_deferred = matches!(&*shared.state.lock().await, State::Deferred(_))
            && !check_build_running();
        if should_emit_deferred {
            let mut state = shared.state.lock().await;
            if let State::Deferred(burst) = state.clone() {
                *state = State::Idle;
                drop(state);
                Self::emit(
                    bus_out,
                    burst.job_id,
                    burst.request_count,
                    burst.last_reason,
                    burst.last_repo_url,
                    burst.last_branch,
                    burst.first_request,
                    burst.last_request,
                    DebounceCause::AfterRunning,
                );
            }
            return;
        }
        Self::maybe_emit(shared, bus_out, config, check_build_running).await;
    }

    async fn maybe_emit(
        shared: &Arc<Shared>,
        bus_out: &EventBus<BuildNow>,
        config: &DebouncerConfig,
        check_build_running: &Arc<dyn Fn() -> bool + Send + Sync>,
    ) {
        let now = Utc::now();
        let mut state = shared.state.lock().await;
        let burst = match &*state {
            State::Coalescing(b) => b.clone(),
            _ => return,
        };

        let quiet_elapsed = now.signed_duration_since(burst.last_request).to_std().unwrap_or_default()
            >= config.quiet_window;
        let max_delay_elapsed = now.signed_duration_since(burst.first_request).to_std().unwrap_or_default()
            >= config.max_delay;

        if !quiet_elapsed && !max_delay_elapsed {
            return;
        }

        if check_build_running() {
            *state = State::Deferred(burst);
            return;
        }

        let cause = if quiet_elapsed {
            DebounceCause::Quiet
        } else {
            DebounceCause::MaxDelay
        };

        *state = State::Idle;
        drop(state);
        Self::emit(
            bus_out,
            burst.job_id,
            burst.request_count,
            burst.last_reason,
            burst.last_repo_url,
            burst.last_branch,
            burst.first_request,
            burst.last_request,
            cause,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        bus_out: &EventBus<BuildNow>,
        job_id: String,
        request_count: u64,
        last_reason: String,
        last_repo_url: String,
        last_branch: String,
        first_request: DateTime<Utc>,
        last_request: DateTime<Utc>,
        cause: DebounceCause,
    ) {
        let event = BuildNow {
            job_id,
            triggered_at: Utc::now(),
            request_count,
            last_reason,
            last_repo_url,
            last_branch,
            first_request,
            last_request,
            debounce_cause: cause,
        };
        if let Err(e) = bus_out.publish(event) {
            tracing::warn!(error = %e, "failed to publish BuildNow: bus closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn not_running() -> Arc<dyn Fn() -> bool + Send + Sync> {
        Arc::new(|| false)
    }

    fn request(reason: &str) -> BuildRequested {
        BuildRequested {
            job_id: None,
            immediate: false,
            reason: reason.to_string(),
            repo_url: "https://example.com/org/repo.git".to_string(),
            branch: "main".to_string(),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn burst_coalesces_to_one_build_now() {
        let bus_in: EventBus<BuildRequested> = EventBus::new();
        let bus_out: EventBus<BuildNow> = EventBus::new();
        let (mut out_rx, _h) = bus_out.subscribe(16);
        let (_handle, mut shutdown_rx) = crate::shutdown::ShutdownHandle::new();

        let (debouncer, _join) = Debouncer::spawn(
            DebouncerConfig {
                quiet_window: Duration::from_millis(25),
                max_delay: Duration::from_millis(500),
                poll_interval: Duration::from_millis(5),
            },
            bus_in.clone(),
            bus_out,
            not_running(),
            shutdown_rx.clone(),
        );
        debouncer.wait_ready().await;

        for i in 0..5 {
            bus_in.publish(request(&format!("req-{i}"))).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let event = tokio::time::timeout(Duration::from_millis(200), out_rx.recv())
            .await
            .expect("should emit within timeout")
            .expect("channel open");
        assert_eq!(event.debounce_cause, DebounceCause::Quiet);
        assert!(event.request_count >= 1);

        let second = tokio::time::timeout(Duration::from_millis(75), out_rx.recv()).await;
        assert!(second.is_err(), "no second BuildNow expected so soon");
        shutdown_rx.cancelled().await;
        let _ = shutdown_rx.is_cancelled();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn max_delay_forces_emission_under_continuous_load() {
        let bus_in: EventBus<BuildRequested> = EventBus::new();
        let bus_out: EventBus<BuildNow> = EventBus::new();
        let (mut out_rx, _h) = bus_out.subscribe(16);

        let (debouncer, _join) = Debouncer::spawn(
            DebouncerConfig {
                quiet_window: Duration::from_millis(200),
                max_delay: Duration::from_millis(60),
                poll_interval: Duration::from_millis(5),
            },
            bus_in.clone(),
            bus_out,
            not_running(),
            crate::shutdown::ShutdownHandle::new().1,
        );
        debouncer.wait_ready().await;

        let stop_at = tokio::time::Instant::now() + Duration::from_millis(150);
        while tokio::time::Instant::now() < stop_at {
            bus_in.publish(request("tick")).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let event = tokio::time::timeout(Duration::from_millis(300), out_rx.recv())
            .await
            .expect("should emit")
            .expect("channel open");
        assert_eq!(event.debounce_cause, DebounceCause::MaxDelay);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn build_running_defers_until_it_finishes() {
        let bus_in: EventBus<BuildRequested> = EventBus::new();
        let bus_out: EventBus<BuildNow> = EventBus::new();
        let (mut out_rx, _h) = bus_out.subscribe(16);
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let check: Arc<dyn Fn() -> bool + Send + Sync> =
            Arc::new(move || running_clone.load(Ordering::SeqCst));

        let (debouncer, _join) = Debouncer::spawn(
            DebouncerConfig {
                quiet_window: Duration::from_millis(10),
                max_delay: Duration::from_millis(500),
                poll_interval: Duration::from_millis(5),
            },
            bus_in.clone(),
            bus_out,
            check,
            crate::shutdown::ShutdownHandle::new().1,
        );
        debouncer.wait_ready().await;

        for _ in 0..10 {
            bus_in.publish(request("queued-while-running")).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let none_yet = tokio::time::timeout(Duration::from_millis(100), out_rx.recv()).await;
        assert!(none_yet.is_err(), "must not emit while build is running");

        running.store(false, Ordering::SeqCst);
        let event = tokio::time::timeout(Duration::from_millis(200), out_rx.recv())
            .await
            .expect("should emit after running flips false")
            .expect("channel open");
        assert_eq!(event.debounce_cause, DebounceCause::AfterRunning);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn immediate_request_emits_without_waiting() {
        let bus_in: EventBus<BuildRequested> = EventBus::new();
        let bus_out: EventBus<BuildNow> = EventBus::new();
        let (mut out_rx, _h) = bus_out.subscribe(16);

        let (debouncer, _join) = Debouncer::spawn(
            DebouncerConfig::default(),
            bus_in.clone(),
            bus_out,
            not_running(),
            crate::shutdown::ShutdownHandle::new().1,
        );
        debouncer.wait_ready().await;

        let mut req = request("urgent");
        req.immediate = true;
        bus_in.publish(req).unwrap();

        let event = tokio::time::timeout(Duration::from_millis(100), out_rx.recv())
            .await
            .expect("should emit immediately")
            .expect("channel open");
        assert_eq!(event.debounce_cause, DebounceCause::Immediate);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn planned_job_id_is_visible_during_a_burst() {
        let bus_in: EventBus<BuildRequested> = EventBus::new();
        let bus_out: EventBus<BuildNow> = EventBus::new();
        let (_out_rx, _h) = bus_out.subscribe(16);

        let (debouncer, _join) = Debouncer::spawn(
            DebouncerConfig {
                quiet_window: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                poll_interval: Duration::from_millis(5),
            },
            bus_in.clone(),
            bus_out,
            not_running(),
            crate::shutdown::ShutdownHandle::new().1,
        );
        debouncer.wait_ready().await;

        assert_eq!(debouncer.planned_job_id().await, None);

        let mut req = request("webhook");
        req.job_id = Some("webhook-123".to_string());
        bus_in.publish(req).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(debouncer.planned_job_id().await, Some("webhook-123".to_string()));
    }

    proptest::proptest! {
        // §8 debounce invariant: folding N extra requests into an in-flight
        // burst always grows request_count by exactly N and leaves the
        // burst's last_reason as whichever request folded in most recently,
        // regardless of how many requests arrive or what they say.
        #[test]
        fn fold_into_burst_accumulates_count_and_keeps_latest_reason(
            reasons in proptest::collection::vec("[a-z]{1,8}", 1..20),
        ) {
            let now = Utc::now();
            let mut state = State::Coalescing(Burst {
                job_id: "job".to_string(),
                job_id_is_generated: true,
                first_request: now,
                last_request: now,
                request_count: 1,
                last_reason: "initial".to_string(),
                last_repo_url: "https://example.com/org/repo.git".to_string(),
                last_branch: "main".to_string(),
            });

            for reason in &reasons {
                Debouncer::fold_into_burst(&mut state, request(reason), now);
            }

            let burst = match &state {
                State::Coalescing(b) => b,
                _ => unreachable!("fold_into_burst never changes the state variant"),
            };
            proptest::prop_assert_eq!(burst.request_count, 1 + reasons.len() as u64);
            proptest::prop_assert_eq!(&burst.last_reason, reasons.last().unwrap());
        }
    }
}
