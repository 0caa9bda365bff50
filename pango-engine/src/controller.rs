//! Tunnel lifecycle controller
//!
//! The controller owns the one authoritative lifecycle state of the engine:
//!
//! ```text
//!            start                 engine started
//! Stopped ──────────▶ Starting ─────────────────────▶ Running
//!    ▲                  │  │                            │  │
//!    │  apply/engine    │  │ stop                  stop │  │ engine exited
//!    ├──── failure ─────┘  ▼                            ▼  │
//!    │                  Stopping ◀──────────────────────┘  │
//!    │                     │                               │
//!    └─────────────────────┴───────────────────────────────┘
//! ```
//!
//! State, handle, background run and settings snapshot live together behind a
//! single mutex. The mutex is only held to check and flip state; every engine
//! call runs on the blocking pool with the lock released.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pango_tun::{
    ControlSocketScanner, HandleDiscovery, SettingsApplier, TunnelHandle, TunnelNetworkSettings,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::boundary::{EngineBoundary, EngineError, EngineInvoker, StartedHandle};
use crate::config::{ControllerConfig, EngineInitConfig, TunnelOptions};
use crate::error::{Error, Result};
use crate::event::{
    ControllerEvent, EventHandler, LifecycleState, LogLevel, LoggingEventHandler, StopReason,
};
use crate::shutdown::{CancelSignal, CancellableTask, JoinOutcome};
use crate::snapshot::{SettingsSnapshot, EMPTY_SETTINGS_JSON};

/// Everything needed to bring a tunnel up
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Settings for the virtual interface
    pub network: TunnelNetworkSettings,
    /// Options handed to the engine
    pub options: TunnelOptions,
}

impl StartRequest {
    pub fn new(network: TunnelNetworkSettings) -> Self {
        Self {
            network,
            options: TunnelOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }
}

/// State guarded by the controller lock
struct ControllerState {
    lifecycle: LifecycleState,
    handle: Option<TunnelHandle>,
    generation: u64,
    run: Option<CancellableTask>,
    snapshot: SettingsSnapshot,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            lifecycle: LifecycleState::Stopped,
            handle: None,
            generation: 0,
            run: None,
            snapshot: SettingsSnapshot::empty(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

struct Shared {
    state: Mutex<ControllerState>,
    state_tx: watch::Sender<LifecycleState>,
    engine: EngineInvoker,
    applier: Arc<dyn SettingsApplier>,
    discovery: Arc<dyn HandleDiscovery>,
    events: Arc<dyn EventHandler>,
    shutdown_timeout: Duration,
    poll_interval: Duration,
}

impl Shared {
    /// Move to `next`, publishing the new state; returns the previous one
    fn transition(&self, state: &mut ControllerState, next: LifecycleState) -> LifecycleState {
        let old = state.lifecycle;
        debug_assert!(
            old.can_transition_to(next),
            "illegal lifecycle transition {:?} -> {:?}",
            old,
            next
        );
        state.lifecycle = next;
        self.state_tx.send_replace(next);
        old
    }

    /// Tear down the current generation and return to `Stopped`
    ///
    /// Returns the previous state, or `None` if `generation` is no longer current
    /// or the controller is already stopped.
    fn finish(&self, generation: u64) -> Option<LifecycleState> {
        let mut state = self.state.lock();
        if !state.is_current(generation) || state.lifecycle == LifecycleState::Stopped {
            return None;
        }
        state.handle = None;
        state.run = None;
        state.snapshot.reset();
        Some(self.transition(&mut state, LifecycleState::Stopped))
    }

    /// Force `generation` to `Stopped` and retire it
    ///
    /// Whatever is still working on the retired generation sees it is no
    /// longer current and unwinds on its own.
    fn abandon(&self, generation: u64) -> Option<LifecycleState> {
        let mut state = self.state.lock();
        if !state.is_current(generation) || state.lifecycle == LifecycleState::Stopped {
            return None;
        }
        state.generation += 1;
        state.handle = None;
        state.run = None;
        state.snapshot.reset();
        Some(self.transition(&mut state, LifecycleState::Stopped))
    }

    async fn emit(&self, event: ControllerEvent) {
        self.events.on_event(event).await;
    }

    async fn emit_transition(&self, old: LifecycleState, new: LifecycleState) {
        if old != new {
            self.emit(ControllerEvent::StateChanged { old, new }).await;
        }
    }

    /// Stop the engine, bounded by the shutdown timeout
    ///
    /// Returns `false` if the engine did not answer in time.
    async fn stop_engine(&self) -> bool {
        let engine = self.engine.clone();
        match tokio::time::timeout(self.shutdown_timeout, blocking(move || engine.stop())).await {
            Ok(Ok(())) => true,
            Ok(Err(EngineError::NotRunning(status))) => {
                log::debug!("Engine already stopped: {}", status);
                true
            }
            Ok(Err(e)) => {
                log::warn!("Engine stop reported failure: {}", e);
                true
            }
            Err(_) => {
                log::warn!(
                    "Engine stop did not return within {:?}",
                    self.shutdown_timeout
                );
                false
            }
        }
    }
}

/// Run a blocking engine call off the async workers
async fn blocking<T, F>(call: F) -> std::result::Result<T, EngineError>
where
    F: FnOnce() -> std::result::Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| EngineError::Aborted(e.to_string()))?
}

/// Builder for [`TunnelController`]
pub struct ControllerBuilder {
    engine: Arc<dyn EngineBoundary>,
    applier: Arc<dyn SettingsApplier>,
    discovery: Option<Arc<dyn HandleDiscovery>>,
    events: Arc<dyn EventHandler>,
    config: ControllerConfig,
    shutdown_timeout: Option<Duration>,
    poll_interval: Option<Duration>,
}

impl ControllerBuilder {
    /// Use controller settings from a config file
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default descriptor scanner
    pub fn discovery(mut self, discovery: Arc<dyn HandleDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Set a custom event handler
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    /// Override the shutdown bound with sub-second precision
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Override the settings poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn build(self) -> TunnelController {
        let discovery: Arc<dyn HandleDiscovery> = match self.discovery {
            Some(discovery) => discovery,
            None => Arc::new(ControlSocketScanner::new().with_limit(self.config.scan_limit)),
        };
        let (state_tx, _) = watch::channel(LifecycleState::Stopped);

        TunnelController {
            shared: Arc::new(Shared {
                state: Mutex::new(ControllerState::new()),
                state_tx,
                engine: EngineInvoker::new(self.engine),
                applier: self.applier,
                discovery,
                events: self.events,
                shutdown_timeout: self
                    .shutdown_timeout
                    .unwrap_or_else(|| self.config.shutdown_timeout()),
                poll_interval: self
                    .poll_interval
                    .unwrap_or_else(|| self.config.settings_poll_interval()),
            }),
        }
    }
}

/// Tunnel lifecycle controller
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct TunnelController {
    shared: Arc<Shared>,
}

impl TunnelController {
    /// Start building a controller around an engine and a settings applier
    pub fn builder(
        engine: Arc<dyn EngineBoundary>,
        applier: Arc<dyn SettingsApplier>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            engine,
            applier,
            discovery: None,
            events: Arc::new(LoggingEventHandler),
            config: ControllerConfig::default(),
            shutdown_timeout: None,
            poll_interval: None,
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> LifecycleState {
        self.shared.state.lock().lifecycle
    }

    /// Handle passed to the running engine, if any
    pub fn handle(&self) -> Option<TunnelHandle> {
        let state = self.shared.state.lock();
        match state.lifecycle {
            LifecycleState::Starting | LifecycleState::Running => state.handle,
            _ => None,
        }
    }

    /// Watch lifecycle changes
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state_tx.subscribe()
    }

    /// Version of the relayed network settings; 0 unless running
    pub fn current_version(&self) -> i64 {
        let state = self.shared.state.lock();
        if state.lifecycle == LifecycleState::Running {
            state.snapshot.version()
        } else {
            0
        }
    }

    /// Relayed network settings JSON; `{}` unless running
    pub fn current_snapshot_json(&self) -> String {
        let state = self.shared.state.lock();
        if state.lifecycle == LifecycleState::Running {
            state.snapshot.json().to_string()
        } else {
            EMPTY_SETTINGS_JSON.to_string()
        }
    }

    /// Version and JSON read together
    pub fn snapshot(&self) -> SettingsSnapshot {
        let state = self.shared.state.lock();
        if state.lifecycle == LifecycleState::Running {
            state.snapshot.clone()
        } else {
            SettingsSnapshot::empty()
        }
    }

    /// Initialize the engine; call once before the first start
    pub async fn initialize_engine(&self, config: &EngineInitConfig) -> Result<()> {
        let engine = self.shared.engine.clone();
        let config = config.clone();
        let status = blocking(move || engine.init(&config))
            .await
            .map_err(|e| Error::EngineInvocationFailed(e.to_string()))?;

        log::info!("Engine initialized: {}", status);
        Ok(())
    }

    /// Forward a log level to the engine
    pub async fn set_log_level(&self, level: LogLevel) -> Result<()> {
        let engine = self.shared.engine.clone();
        blocking(move || {
            engine.set_log_level(level);
            Ok(())
        })
        .await
        .map_err(|e| Error::EngineInvocationFailed(e.to_string()))
    }

    /// Ask the running engine to rebind its socket
    pub async fn rebind_socket(&self) -> Result<()> {
        self.ensure_running()?;
        let engine = self.shared.engine.clone();
        let status = blocking(move || engine.rebind_socket())
            .await
            .map_err(engine_call_error)?;

        log::info!("{}", status);
        Ok(())
    }

    /// Switch the running engine's power profile
    pub async fn set_power_mode(&self, mode: &str) -> Result<()> {
        self.ensure_running()?;
        let engine = self.shared.engine.clone();
        let mode = mode.to_string();
        let status = blocking(move || engine.set_power_mode(&mode))
            .await
            .map_err(engine_call_error)?;

        log::info!("{}", status);
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status() != LifecycleState::Running {
            return Err(Error::NotRunning);
        }
        Ok(())
    }

    /// Bring the tunnel up
    ///
    /// Applies the network settings, discovers the utun handle, starts the
    /// engine on it and hands the engine run to a background task. A start
    /// while any generation is in flight fails with [`Error::AlreadyRunning`].
    pub async fn start(&self, request: StartRequest) -> Result<()> {
        let shared = &self.shared;

        let generation = {
            let mut state = shared.state.lock();
            if state.lifecycle != LifecycleState::Stopped {
                return Err(Error::AlreadyRunning);
            }
            state.generation += 1;
            state.handle = None;
            state.snapshot.reset();
            shared.transition(&mut state, LifecycleState::Starting);
            state.generation
        };
        shared
            .emit_transition(LifecycleState::Stopped, LifecycleState::Starting)
            .await;

        log::info!(
            "Starting tunnel to {} (generation {})",
            request.network.tunnel_remote_address,
            generation
        );

        if let Err(e) = shared.applier.apply(&request.network).await {
            let err = Error::SettingsApplyFailed(e);
            self.abort_start(generation, StopReason::StartFailed(err.to_string()))
                .await;
            return Err(err);
        }

        if self.stop_requested(generation) {
            self.abort_start(generation, StopReason::Requested).await;
            return Err(Error::StartAborted);
        }

        let handle = self.discover_handle().await;
        {
            let mut state = shared.state.lock();
            if state.is_current(generation) {
                state.handle = Some(handle);
            }
        }

        if self.stop_requested(generation) {
            self.abort_start(generation, StopReason::Requested).await;
            return Err(Error::StartAborted);
        }

        let engine = shared.engine.clone();
        let options = request.options.clone();
        let started = match blocking(move || engine.start(handle, &options)).await {
            Ok(started) => started,
            Err(e) => {
                log::error!("Engine refused to start on {}: {}", handle, e);
                // The engine may be half-started or out of sync with us
                shared.stop_engine().await;
                let err = Error::EngineInvocationFailed(e.to_string());
                self.abort_start(generation, StopReason::StartFailed(err.to_string()))
                    .await;
                return Err(err);
            }
        };

        self.enter_running(generation, started).await
    }

    async fn discover_handle(&self) -> TunnelHandle {
        let discovery = self.shared.discovery.clone();
        let found = tokio::task::spawn_blocking(move || discovery.discover())
            .await
            .unwrap_or_else(|e| {
                log::warn!("Handle discovery aborted: {}", e);
                None
            });

        match found {
            Some(handle) => {
                log::info!("Discovered tunnel interface on {}", handle);
                handle
            }
            None => {
                self.shared
                    .emit(ControllerEvent::HandleNotDiscovered {
                        scan_limit: self.shared.discovery.scan_limit(),
                    })
                    .await;
                TunnelHandle::SENTINEL
            }
        }
    }

    async fn enter_running(&self, generation: u64, started: StartedHandle) -> Result<()> {
        let shared = &self.shared;

        let promoted = {
            let mut state = shared.state.lock();
            if state.is_current(generation) && state.lifecycle == LifecycleState::Starting {
                let task_shared = shared.clone();
                state.run = Some(CancellableTask::spawn(move |cancel| {
                    supervise(task_shared, generation, cancel)
                }));
                shared.transition(&mut state, LifecycleState::Running);
                true
            } else {
                false
            }
        };

        if !promoted {
            // A stop arrived while the engine was starting
            log::info!("Start of generation {} cancelled by stop", generation);
            shared.stop_engine().await;
            self.abort_start(generation, StopReason::Requested).await;
            return Err(Error::StartAborted);
        }

        shared
            .emit(ControllerEvent::Started {
                handle: started.handle,
                status: started.status,
            })
            .await;
        shared
            .emit_transition(LifecycleState::Starting, LifecycleState::Running)
            .await;
        Ok(())
    }

    fn stop_requested(&self, generation: u64) -> bool {
        let state = self.shared.state.lock();
        !state.is_current(generation) || state.lifecycle == LifecycleState::Stopping
    }

    async fn abort_start(&self, generation: u64, reason: StopReason) {
        if let Some(old) = self.shared.finish(generation) {
            self.shared
                .emit_transition(old, LifecycleState::Stopped)
                .await;
            self.shared.emit(ControllerEvent::Stopped { reason }).await;
        }
    }

    /// Bring the tunnel down
    ///
    /// Signals the background task, waits for it at most the shutdown timeout,
    /// then stops the engine. The controller ends in `Stopped` even when the
    /// wait times out; that case is reported as [`Error::ShutdownTimeout`].
    pub async fn stop(&self) -> Result<()> {
        let shared = &self.shared;

        let (old, generation, run) = {
            let mut state = shared.state.lock();
            if !state.lifecycle.is_stoppable() {
                return Err(Error::NotRunning);
            }
            let run = state.run.take();
            let old = shared.transition(&mut state, LifecycleState::Stopping);
            (old, state.generation, run)
        };
        shared
            .emit_transition(old, LifecycleState::Stopping)
            .await;

        if old == LifecycleState::Starting {
            return self.await_aborted_start(generation).await;
        }

        let mut timed_out = false;
        if let Some(run) = run {
            match run.cancel_and_join(shared.shutdown_timeout).await {
                JoinOutcome::Joined => {}
                JoinOutcome::Panicked(msg) => {
                    log::warn!("Background engine task panicked: {}", msg);
                }
                JoinOutcome::TimedOut => timed_out = true,
            }
        }

        if !shared.stop_engine().await {
            timed_out = true;
        }

        if let Some(old) = shared.finish(generation) {
            shared.emit_transition(old, LifecycleState::Stopped).await;
            shared
                .emit(ControllerEvent::Stopped {
                    reason: StopReason::Requested,
                })
                .await;
        }

        if timed_out {
            let err = Error::ShutdownTimeout(shared.shutdown_timeout);
            shared
                .emit(ControllerEvent::Degraded {
                    message: format!("tunnel stopped without a clean shutdown: {}", err),
                })
                .await;
            return Err(err);
        }

        log::info!("Tunnel stopped");
        Ok(())
    }

    /// Wait for an in-flight start to notice the stop and unwind
    ///
    /// If it does not unwind in time the generation is abandoned: the
    /// controller moves to `Stopped` now and the late start path stops the
    /// engine itself if it ever gets that far.
    async fn await_aborted_start(&self, generation: u64) -> Result<()> {
        let mut rx = self.shared.state_tx.subscribe();
        let unwound = matches!(
            tokio::time::timeout(
                self.shared.shutdown_timeout,
                rx.wait_for(|state| *state == LifecycleState::Stopped),
            )
            .await,
            Ok(Ok(_))
        );

        if unwound {
            log::info!("Tunnel start cancelled");
            Ok(())
        } else {
            let err = Error::ShutdownTimeout(self.shared.shutdown_timeout);
            if let Some(old) = self.shared.abandon(generation) {
                self.shared
                    .emit_transition(old, LifecycleState::Stopped)
                    .await;
                self.shared
                    .emit(ControllerEvent::Stopped {
                        reason: StopReason::Requested,
                    })
                    .await;
            }
            self.shared
                .emit(ControllerEvent::Degraded {
                    message: format!("start abandoned while still unwinding: {}", err),
                })
                .await;
            Err(err)
        }
    }
}

fn engine_call_error(err: EngineError) -> Error {
    match err {
        EngineError::NotRunning(_) => Error::NotRunning,
        other => Error::EngineInvocationFailed(other.to_string()),
    }
}

/// Background task owning a running engine generation
///
/// Polls the engine for liveness and settings updates until cancelled. If the
/// engine exits on its own, the controller returns to `Stopped`.
async fn supervise(shared: Arc<Shared>, generation: u64, mut cancel: CancelSignal) {
    let mut ticker = tokio::time::interval(shared.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let engine = shared.engine.clone();
        let polled = blocking(move || {
            if engine.is_running() {
                Ok(Some(engine.settings_version()))
            } else {
                Ok(None)
            }
        })
        .await;

        if cancel.is_cancelled() {
            break;
        }

        let version = match polled {
            Ok(Some(version)) => version,
            Ok(None) => {
                engine_exited(&shared, generation).await;
                break;
            }
            Err(e) => {
                log::warn!("Engine poll failed: {}", e);
                continue;
            }
        };

        let cached = shared.state.lock().snapshot.version();
        if version <= cached {
            continue;
        }

        let engine = shared.engine.clone();
        let json = match blocking(move || Ok(engine.settings_json())).await {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to read engine settings: {}", e);
                continue;
            }
        };

        let updated = {
            let mut state = shared.state.lock();
            state.is_current(generation)
                && state.lifecycle == LifecycleState::Running
                && state.snapshot.update(version, json)
        };
        if updated {
            shared
                .emit(ControllerEvent::SettingsUpdated { version })
                .await;
        }
    }

    log::debug!("Engine supervisor for generation {} exiting", generation);
}

async fn engine_exited(shared: &Shared, generation: u64) {
    let old = {
        let mut state = shared.state.lock();
        if !state.is_current(generation) || state.lifecycle != LifecycleState::Running {
            // A stop is already tearing this generation down
            return;
        }
        state.handle = None;
        state.snapshot.reset();
        // Our own task handle; dropping it detaches this task
        state.run = None;
        shared.transition(&mut state, LifecycleState::Stopped)
    };

    log::info!("Engine exited on its own (generation {})", generation);
    shared.emit_transition(old, LifecycleState::Stopped).await;
    shared
        .emit(ControllerEvent::Stopped {
            reason: StopReason::EngineExited,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::DryRunEngine;
    use pango_tun::LoggingApplier;

    struct NoHandle;

    impl HandleDiscovery for NoHandle {
        fn discover(&self) -> Option<TunnelHandle> {
            None
        }

        fn scan_limit(&self) -> i32 {
            1024
        }
    }

    fn controller(engine: Arc<DryRunEngine>) -> TunnelController {
        TunnelController::builder(engine, Arc::new(LoggingApplier))
            .discovery(Arc::new(NoHandle))
            .poll_interval(Duration::from_millis(10))
            .shutdown_timeout(Duration::from_millis(500))
            .build()
    }

    fn request() -> StartRequest {
        StartRequest::new(TunnelNetworkSettings::new("127.0.0.1").with_mtu(1500))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_stop_cycle() {
        let engine = Arc::new(DryRunEngine::initialized());
        let controller = controller(engine.clone());

        assert_eq!(controller.status(), LifecycleState::Stopped);
        controller.start(request()).await.unwrap();
        assert_eq!(controller.status(), LifecycleState::Running);
        assert_eq!(controller.handle(), Some(TunnelHandle::SENTINEL));
        assert!(engine.is_tunnel_running());

        controller.stop().await.unwrap();
        assert_eq!(controller.status(), LifecycleState::Stopped);
        assert_eq!(controller.handle(), None);
        assert!(!engine.is_tunnel_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_when_stopped() {
        let controller = controller(Arc::new(DryRunEngine::initialized()));
        assert!(matches!(controller.stop().await, Err(Error::NotRunning)));
        assert_eq!(controller.status(), LifecycleState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runtime_ops_require_running() {
        let controller = controller(Arc::new(DryRunEngine::initialized()));
        assert!(matches!(controller.rebind_socket().await, Err(Error::NotRunning)));
        assert!(matches!(
            controller.set_power_mode("low").await,
            Err(Error::NotRunning)
        ));

        controller.start(request()).await.unwrap();
        controller.rebind_socket().await.unwrap();
        controller.set_power_mode("low").await.unwrap();
        controller.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribe_sees_running() {
        let controller = controller(Arc::new(DryRunEngine::initialized()));
        let mut rx = controller.subscribe();

        controller.start(request()).await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LifecycleState::Running);

        controller.stop().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LifecycleState::Stopped);
    }
}
