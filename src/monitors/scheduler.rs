// SPDX-License-Identifier: Apache-2.0

//! Monitor scheduler.
//!
//! Each configured instance runs on its own tokio task with an
//! independent, jittered interval. A tick runs the plugin's `sample` on
//! the blocking pool under the instance's interval as a timeout, so a
//! stalled plugin costs itself a tick but can never starve other
//! instances or the scheduler. Consecutive tick failures past the
//! configured limit park the instance in `Failed` until an explicit
//! reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;

use super::emitter::MetricEmitter;
use super::{configure, Monitor, MonitorError, Sample, SampleValue};

/// Per-tick jitter, as a fraction of the sampling interval. Spreads many
/// instances with the same interval apart so they don't sample in lockstep.
const JITTER_FRACTION: f64 = 0.10;

/// How long `stop` waits for in-flight ticks before aborting their tasks.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    SamplingTick,
    Failed,
}

type SharedState = Arc<Mutex<InstanceState>>;

fn set_state(state: &SharedState, next: InstanceState) {
    *state.lock().unwrap() = next;
}

struct InstanceSlot {
    output_path: PathBuf,
    state: SharedState,
}

pub struct MonitorScheduler {
    monitor_log_dir: PathBuf,
    instances: HashMap<String, InstanceSlot>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl MonitorScheduler {
    pub fn new(monitor_log_dir: impl Into<PathBuf>) -> Self {
        Self {
            monitor_log_dir: monitor_log_dir.into(),
            instances: HashMap::new(),
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start one scheduling task per configured instance. A duplicate
    /// instance id is a configuration error: it is logged and the
    /// duplicate is not scheduled; the first occurrence keeps running.
    pub fn start(&mut self, configs: &[MonitorConfig]) {
        for config in configs {
            if self.instances.contains_key(&config.id) {
                error!(
                    id = %config.id,
                    module = %config.module,
                    "duplicate monitor instance id, not scheduling"
                );
                continue;
            }

            let output_path = self.output_path_for(config);
            let state: SharedState = Arc::new(Mutex::new(InstanceState::Stopped));

            self.instances.insert(
                config.id.clone(),
                InstanceSlot {
                    output_path: output_path.clone(),
                    state: state.clone(),
                },
            );

            let config = config.clone();
            let cancel = self.cancel.child_token();
            self.tasks
                .spawn(async move { run_instance(config, output_path, state, cancel).await });
        }
    }

    /// Signal every instance to stop and wait (bounded) for in-flight
    /// ticks to finish; tasks still running after the wait are aborted.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        let timed_out = tokio::time::timeout(SHUTDOWN_WAIT, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await
        .is_err();
        if timed_out {
            warn!("timed out waiting for monitor tasks, aborting remainder");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        for slot in self.instances.values() {
            set_state(&slot.state, InstanceState::Stopped);
        }
        self.instances.clear();
        self.cancel = CancellationToken::new();
    }

    /// Replace the running instance set with a new configuration. This is
    /// the only path that revives a `Failed` instance.
    pub async fn reload(&mut self, configs: &[MonitorConfig]) {
        info!(instances = configs.len(), "reloading monitor configuration");
        self.stop().await;
        self.start(configs);
    }

    pub fn instance_state(&self, id: &str) -> Option<InstanceState> {
        self.instances.get(id).map(|s| *s.state.lock().unwrap())
    }

    /// Output files of all scheduled instances; the copying manager tails
    /// these alongside any other configured logs.
    pub fn output_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .instances
            .values()
            .map(|s| s.output_path.clone())
            .collect();
        paths.sort();
        paths
    }

    fn output_path_for(&self, config: &MonitorConfig) -> PathBuf {
        self.monitor_log_dir.join(format!("{}.log", config.id))
    }
}

fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(1.0 + rand::random::<f64>() * JITTER_FRACTION)
}

async fn run_instance(
    config: MonitorConfig,
    output_path: PathBuf,
    state: SharedState,
    cancel: CancellationToken,
) {
    set_state(&state, InstanceState::Starting);

    let mut emitter = match MetricEmitter::open(&config.module, &config.id, &output_path) {
        Ok(e) => e,
        Err(e) => {
            error!(
                id = %config.id,
                path = ?output_path,
                "failed to open monitor output file: {}",
                e
            );
            set_state(&state, InstanceState::Stopped);
            return;
        }
    };

    // A configure failure leaves the instance Stopped; it never ticks.
    let mut monitor: Option<Box<dyn Monitor>> = match configure(&config) {
        Ok(m) => Some(m),
        Err(e) => {
            error!(id = %config.id, module = %config.module, "monitor configuration failed: {}", e);
            set_state(&state, InstanceState::Stopped);
            return;
        }
    };

    set_state(&state, InstanceState::Running);
    info!(
        id = %config.id,
        module = %config.module,
        interval = ?config.sample_interval(),
        "monitor instance started"
    );

    let interval = config.sample_interval();
    let mut consecutive_failures = 0u32;
    let mut failed = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(jittered(interval)) => {}
        }

        set_state(&state, InstanceState::SamplingTick);

        match run_tick(&mut monitor, &config, interval).await {
            Ok(samples) => {
                consecutive_failures = 0;
                if let Err(e) = emitter.emit_all(&samples) {
                    warn!(id = %config.id, "failed to write monitor output: {}", e);
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    id = %config.id,
                    module = %config.module,
                    failures = consecutive_failures,
                    "monitor tick failed: {}",
                    e
                );
                let err_sample = Sample::now(
                    "monitor.errors",
                    SampleValue::I64(consecutive_failures as i64),
                );
                if let Err(e) = emitter.emit(&err_sample) {
                    warn!(id = %config.id, "failed to write error metric: {}", e);
                }

                if consecutive_failures >= config.consecutive_failure_limit {
                    error!(
                        id = %config.id,
                        module = %config.module,
                        "monitor exceeded failure limit, disabled until reload"
                    );
                    set_state(&state, InstanceState::Failed);
                    failed = true;
                    // Stay parked until shutdown; only reload revives us.
                    cancel.cancelled().await;
                    break;
                }
            }
        }

        set_state(&state, InstanceState::Running);
    }

    if let Some(mut m) = monitor.take() {
        m.close();
    }
    set_state(&state, InstanceState::Stopped);
    debug!(id = %config.id, failed = failed, "monitor instance stopped");
}

/// Run one sampling tick on the blocking pool, bounded by the instance's
/// interval. On timeout the tick is abandoned: the blocked task keeps the
/// plugin instance, and the next tick configures a fresh one.
async fn run_tick(
    slot: &mut Option<Box<dyn Monitor>>,
    config: &MonitorConfig,
    tick_timeout: Duration,
) -> Result<Vec<Sample>, MonitorError> {
    let monitor = match slot.take() {
        Some(m) => m,
        None => configure(config)?,
    };

    let join = tokio::task::spawn_blocking(move || {
        let mut monitor = monitor;
        let result = monitor.sample();
        (monitor, result)
    });

    match tokio::time::timeout(tick_timeout, join).await {
        Ok(Ok((monitor, result))) => {
            *slot = Some(monitor);
            result
        }
        Ok(Err(join_err)) => Err(MonitorError::Sample(format!(
            "sample task panicked: {}",
            join_err
        ))),
        Err(_) => Err(MonitorError::Timeout(tick_timeout)),
    }
}
