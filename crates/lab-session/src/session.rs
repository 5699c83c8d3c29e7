//! Measurement-session orchestration.
//!
//! A session binds instruments, an ordered parameter list, named acquisition
//! functions, and optional background tasks, then runs in one of two modes:
//!
//! - **Sweep**: enumerate the Cartesian product of the parameter values in
//!   declared order (first parameter outermost) and invoke every acquisition
//!   sequentially at each point.
//! - **Concurrent**: tick the acquisitions every `interval` for `duration`
//!   while background tasks run alongside, cancellation-token controlled.
//!
//! Registration is explicit - named functions handed to the builder - and
//! the output is an [`Experiment`] whose frame is the parameter columns plus
//! the union of acquisition keys.

use crate::experiment::{Experiment, ParameterMeta};
use futures::future::BoxFuture;
use lab_core::{Cell, DataFrame, LabError, MonotonicClock, SessionError};
use lab_instruments::{
    Bench, Device, DcLoad, Multimeter, Oscilloscope, PowerMeter, PowerSupply,
    SpectrumAnalyzer, Vna, WaveformGenerator,
};
use lab_core::ConfigError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Key→cell map returned by one acquisition at one point.
pub type AcquireResult = BTreeMap<String, Cell>;

type AcquireFn =
    Arc<dyn Fn(AcquireContext) -> BoxFuture<'static, Result<AcquireResult, LabError>> + Send + Sync>;

type TaskFn =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<(), LabError>> + Send + Sync>;

#[derive(Debug, Clone)]
struct Parameter {
    name: String,
    values: Vec<f64>,
    unit: Option<String>,
}

// =============================================================================
// Contexts handed to user callables
// =============================================================================

#[derive(Clone, Default)]
struct DeviceSet(Arc<BTreeMap<String, Device>>);

impl DeviceSet {
    fn device(&self, alias: &str) -> Result<Device, LabError> {
        self.0.get(alias).cloned().ok_or_else(|| {
            ConfigError::UnknownAlias {
                alias: alias.to_string(),
            }
            .into()
        })
    }
}

macro_rules! typed_device_accessor {
    ($fn_name:ident, $variant:ident, $driver:ty, $label:literal) => {
        pub fn $fn_name(&self, alias: &str) -> Result<Arc<$driver>, LabError> {
            match self.devices.device(alias)? {
                Device::$variant(d) => Ok(d),
                other => Err(ConfigError::WrongDeviceType {
                    alias: alias.to_string(),
                    requested: $label.to_string(),
                    actual: other.device_type().to_string(),
                }
                .into()),
            }
        }
    };
}

/// Context passed to acquisition functions: the current parameter point and
/// the session's instruments.
#[derive(Clone)]
pub struct AcquireContext {
    params: BTreeMap<String, f64>,
    devices: DeviceSet,
}

impl AcquireContext {
    /// Value of a sweep parameter at the current point. Concurrent mode has
    /// no parameters; this returns `None` there.
    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    pub fn params(&self) -> &BTreeMap<String, f64> {
        &self.params
    }

    pub fn device(&self, alias: &str) -> Result<Device, LabError> {
        self.devices.device(alias)
    }

    typed_device_accessor!(oscilloscope, Oscilloscope, Oscilloscope, "oscilloscope");
    typed_device_accessor!(power_supply, PowerSupply, PowerSupply, "power_supply");
    typed_device_accessor!(multimeter, Multimeter, Multimeter, "multimeter");
    typed_device_accessor!(
        waveform_generator,
        WaveformGenerator,
        WaveformGenerator,
        "waveform_generator"
    );
    typed_device_accessor!(dc_load, DcLoad, DcLoad, "dc_load");
    typed_device_accessor!(
        spectrum_analyzer,
        SpectrumAnalyzer,
        SpectrumAnalyzer,
        "spectrum_analyzer"
    );
    typed_device_accessor!(vna, Vna, Vna, "vna");
    typed_device_accessor!(power_meter, PowerMeter, PowerMeter, "power_meter");
}

/// Context passed to background tasks: instruments, the cancellation token,
/// and the session clock.
#[derive(Clone)]
pub struct TaskContext {
    cancel: CancellationToken,
    devices: DeviceSet,
    clock: MonotonicClock,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Sleep for `duration`, waking early on cancellation. Returns `false`
    /// when the sleep was interrupted by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Seconds since the session started.
    pub fn elapsed_s(&self) -> f64 {
        self.clock.elapsed_s()
    }

    pub fn device(&self, alias: &str) -> Result<Device, LabError> {
        self.devices.device(alias)
    }

    typed_device_accessor!(power_supply, PowerSupply, PowerSupply, "power_supply");
    typed_device_accessor!(multimeter, Multimeter, Multimeter, "multimeter");
    typed_device_accessor!(dc_load, DcLoad, DcLoad, "dc_load");
}

// =============================================================================
// MeasurementSession
// =============================================================================

/// Builder and runner for one measurement session.
pub struct MeasurementSession {
    name: String,
    description: String,
    operator: Option<String>,
    parameters: Vec<Parameter>,
    acquisitions: Vec<(String, AcquireFn)>,
    tasks: Vec<(String, TaskFn)>,
    devices: BTreeMap<String, Device>,
    fatal_acquisition_errors: bool,
    grace: Duration,
    cancel: CancellationToken,
}

impl MeasurementSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            operator: None,
            parameters: Vec::new(),
            acquisitions: Vec::new(),
            tasks: Vec::new(),
            devices: BTreeMap::new(),
            fatal_acquisition_errors: false,
            grace: Duration::from_secs(2),
            cancel: CancellationToken::new(),
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn operator(mut self, name: impl Into<String>) -> Self {
        self.operator = Some(name.into());
        self
    }

    /// Declare a sweep parameter. Declaration order is sweep order: the
    /// first parameter is the outermost loop.
    pub fn parameter(
        mut self,
        name: impl Into<String>,
        values: impl Into<Vec<f64>>,
        unit: Option<&str>,
    ) -> Result<Self, LabError> {
        let name = name.into();
        if self.parameters.iter().any(|p| p.name == name) {
            return Err(SessionError::DuplicateParameter(name).into());
        }
        self.parameters.push(Parameter {
            name,
            values: values.into(),
            unit: unit.map(str::to_string),
        });
        Ok(self)
    }

    /// Register a named acquisition. Acquisitions run sequentially in
    /// registration order at every point/tick.
    pub fn acquire<F, Fut>(mut self, name: impl Into<String>, f: F) -> Result<Self, LabError>
    where
        F: Fn(AcquireContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<AcquireResult, LabError>> + Send + 'static,
    {
        let name = name.into();
        if self.acquisitions.iter().any(|(n, _)| *n == name) {
            return Err(SessionError::DuplicateAcquisition(name).into());
        }
        self.acquisitions
            .push((name, Arc::new(move |ctx| Box::pin(f(ctx)))));
        Ok(self)
    }

    /// Register a named background task for concurrent mode. Tasks must
    /// check the cancellation signal cooperatively.
    pub fn task<F, Fut>(mut self, name: impl Into<String>, f: F) -> Result<Self, LabError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), LabError>> + Send + 'static,
    {
        let name = name.into();
        if self.tasks.iter().any(|(n, _)| *n == name) {
            return Err(SessionError::DuplicateTask(name).into());
        }
        self.tasks
            .push((name, Arc::new(move |ctx| Box::pin(f(ctx)))));
        Ok(self)
    }

    /// Bind one instrument under an alias.
    pub fn instrument(mut self, alias: impl Into<String>, device: Device) -> Self {
        self.devices.insert(alias.into(), device);
        self
    }

    /// Borrow every instrument of a bench.
    pub fn instruments_from(mut self, bench: &Bench) -> Self {
        for alias in bench.aliases() {
            if let Ok(device) = bench.device(alias) {
                self.devices.insert(alias.to_string(), device.clone());
            }
        }
        self
    }

    /// Fail the whole run on the first acquisition error instead of
    /// recording a null row.
    pub fn fatal_acquisition_errors(mut self, fatal: bool) -> Self {
        self.fatal_acquisition_errors = fatal;
        self
    }

    /// Grace period granted to background tasks after cancellation.
    pub fn task_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Token that cancels a running session from outside.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn device_set(&self) -> DeviceSet {
        DeviceSet(Arc::new(self.devices.clone()))
    }

    /// First-point key bookkeeping: every key must come from exactly one
    /// acquisition and must not shadow a parameter column.
    fn check_keys(
        &self,
        owner: &mut BTreeMap<String, String>,
        acquisition: &str,
        keys: &AcquireResult,
    ) -> Result<(), LabError> {
        for key in keys.keys() {
            if self.parameters.iter().any(|p| p.name == *key) {
                return Err(SessionError::AcquisitionKeyConflict {
                    key: key.clone(),
                    first: "parameters".to_string(),
                    second: acquisition.to_string(),
                }
                .into());
            }
            if let Some(first) = owner.get(key) {
                if first != acquisition {
                    return Err(SessionError::AcquisitionKeyConflict {
                        key: key.clone(),
                        first: first.clone(),
                        second: acquisition.to_string(),
                    }
                    .into());
                }
            } else {
                owner.insert(key.clone(), acquisition.to_string());
            }
        }
        Ok(())
    }

    fn base_experiment(&self) -> Experiment {
        let mut experiment = Experiment::new(self.name.clone(), self.description.clone());
        experiment.operator = self.operator.clone();
        experiment.parameters = self
            .parameters
            .iter()
            .map(|p| ParameterMeta {
                name: p.name.clone(),
                unit: p.unit.clone(),
                points: p.values.len(),
            })
            .collect();
        experiment
    }

    // =========================================================================
    // Sweep mode
    // =========================================================================

    /// Enumerate the Cartesian product of the declared parameters and run
    /// every acquisition at each point.
    pub async fn run_sweep(self) -> Result<Experiment, LabError> {
        if self.parameters.is_empty() {
            return Err(SessionError::NoParameters.into());
        }
        if self.acquisitions.is_empty() {
            return Err(SessionError::NoAcquisitions.into());
        }

        let mut experiment = self.base_experiment();
        let devices = self.device_set();

        let mut frame = DataFrame::new();
        for parameter in &self.parameters {
            frame.declare_column(&parameter.name, parameter.unit.as_deref());
        }

        let total: usize = self.parameters.iter().map(|p| p.values.len()).product();
        let sizes: Vec<usize> = self.parameters.iter().map(|p| p.values.len()).collect();
        tracing::info!(session = %self.name, points = total, "sweep started");

        let mut key_owner: BTreeMap<String, String> = BTreeMap::new();

        for linear in 0..total {
            // first declared parameter is the outermost loop
            let mut remainder = linear;
            let mut point: BTreeMap<String, f64> = BTreeMap::new();
            let mut row: BTreeMap<String, Cell> = BTreeMap::new();
            for (i, parameter) in self.parameters.iter().enumerate() {
                let stride: usize = sizes[i + 1..].iter().product();
                let index = remainder / stride;
                remainder %= stride;
                let value = parameter.values[index];
                point.insert(parameter.name.clone(), value);
                row.insert(parameter.name.clone(), Cell::Float(value));
            }

            for (name, acquire) in &self.acquisitions {
                let ctx = AcquireContext {
                    params: point.clone(),
                    devices: devices.clone(),
                };
                match acquire(ctx).await {
                    Ok(keys) => {
                        if linear == 0 {
                            self.check_keys(&mut key_owner, name, &keys)?;
                        }
                        row.extend(keys);
                    }
                    Err(e) if self.fatal_acquisition_errors => {
                        return Err(SessionError::AcquisitionFailed {
                            name: name.clone(),
                            source: Box::new(e),
                        }
                        .into());
                    }
                    Err(e) => {
                        // missing keys become nulls in this row
                        tracing::warn!(
                            session = %self.name,
                            acquisition = %name,
                            error = %e,
                            "acquisition failed, recording nulls"
                        );
                    }
                }
            }

            frame.push_row(row);
        }

        experiment.frame = frame;
        experiment.finished = chrono::Utc::now();
        tracing::info!(session = %self.name, rows = experiment.frame.len(), "sweep finished");
        Ok(experiment)
    }

    // =========================================================================
    // Concurrent mode
    // =========================================================================

    /// Run the acquisition loop every `interval` for `duration` while the
    /// registered background tasks run alongside.
    pub async fn run_concurrent(
        self,
        duration: Duration,
        interval: Duration,
    ) -> Result<Experiment, LabError> {
        if self.acquisitions.is_empty() {
            return Err(SessionError::NoAcquisitions.into());
        }

        let mut experiment = self.base_experiment();
        let devices = self.device_set();
        let clock = MonotonicClock::new();
        let task_cancel = self.cancel.child_token();

        let mut handles = Vec::with_capacity(self.tasks.len());
        for (name, task) in &self.tasks {
            let ctx = TaskContext {
                cancel: task_cancel.clone(),
                devices: devices.clone(),
                clock,
            };
            let future = task(ctx);
            handles.push((name.clone(), tokio::spawn(future)));
        }

        let mut frame = DataFrame::new();
        frame.declare_column("time", None);
        frame.declare_column("elapsed", Some("s"));
        frame.declare_column("skew", Some("s"));

        let mut ticker = tokio::time::interval(interval);
        // a slow tick delays later ticks instead of overlapping them
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut key_owner: BTreeMap<String, String> = BTreeMap::new();
        let mut tick_index: u64 = 0;
        let mut externally_cancelled = false;

        loop {
            ticker.tick().await;
            let elapsed = clock.elapsed_s();
            if elapsed >= duration.as_secs_f64() {
                break;
            }
            if self.cancel.is_cancelled() {
                externally_cancelled = true;
                break;
            }

            let expected = interval.as_secs_f64() * tick_index as f64;
            let skew = (elapsed - expected).max(0.0);
            if skew >= interval.as_secs_f64() {
                tracing::warn!(
                    session = %self.name,
                    tick = tick_index,
                    skew_s = skew,
                    "tick running behind schedule"
                );
            }

            let mut row: BTreeMap<String, Cell> = BTreeMap::new();
            row.insert("time".to_string(), Cell::Time(chrono::Utc::now()));
            row.insert("elapsed".to_string(), Cell::Float(elapsed));
            row.insert("skew".to_string(), Cell::Float(skew));

            for (name, acquire) in &self.acquisitions {
                let ctx = AcquireContext {
                    params: BTreeMap::new(),
                    devices: devices.clone(),
                };
                match acquire(ctx).await {
                    Ok(keys) => {
                        if tick_index == 0 {
                            self.check_keys(&mut key_owner, name, &keys)?;
                        }
                        row.extend(keys);
                    }
                    Err(e) if self.fatal_acquisition_errors => {
                        task_cancel.cancel();
                        return Err(SessionError::AcquisitionFailed {
                            name: name.clone(),
                            source: Box::new(e),
                        }
                        .into());
                    }
                    Err(e) => {
                        tracing::warn!(
                            session = %self.name,
                            acquisition = %name,
                            error = %e,
                            "acquisition failed, recording nulls"
                        );
                    }
                }
            }

            frame.push_row(row);
            tick_index += 1;
        }

        // signal cancellation, then grant the grace period
        task_cancel.cancel();
        for (name, mut handle) in handles {
            match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    tracing::warn!(task = %name, error = %e, "background task failed");
                    experiment.task_errors.push(format!("{}: {}", name, e));
                }
                Ok(Err(join_error)) => {
                    tracing::warn!(task = %name, error = %join_error, "background task panicked");
                    experiment
                        .task_errors
                        .push(format!("{}: {}", name, join_error));
                }
                Err(_) => {
                    handle.abort();
                    tracing::warn!(
                        task = %name,
                        grace_s = self.grace.as_secs_f64(),
                        "background task abandoned after grace period"
                    );
                    experiment.abandoned_tasks.push(name);
                }
            }
        }

        if externally_cancelled {
            return Err(SessionError::Cancelled.into());
        }

        experiment.frame = frame;
        experiment.finished = chrono::Utc::now();
        tracing::info!(
            session = %self.name,
            ticks = experiment.frame.len(),
            "concurrent run finished"
        );
        Ok(experiment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::Settings;
    use lab_instruments::BenchOptions;
    use lab_profiles::BenchDescriptor;
    use std::sync::atomic::{AtomicU32, Ordering};

    const BENCH: &str = r#"
bench_name: session_rig
simulate: true
instruments:
  psu:
    profile: keysight/EDU36311A
  dmm:
    profile: keysight/EDU34450A
"#;

    async fn open_bench() -> Bench {
        let descriptor = BenchDescriptor::from_yaml_str(BENCH).unwrap();
        Bench::open_with(
            descriptor,
            Settings::default(),
            BenchOptions {
                sim_seed: Some(99),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    fn measure_psu() -> impl Fn(AcquireContext) -> BoxFuture<'static, Result<AcquireResult, LabError>>
           + Send
           + Sync
           + 'static {
        |ctx: AcquireContext| {
            Box::pin(async move {
                let psu = ctx.power_supply("psu")?;
                let channel = psu.channel(1)?;
                if let Some(voltage) = ctx.param("voltage") {
                    channel.set_voltage(voltage).await?;
                }
                let measured = channel.measure_voltage().await?;
                let mut out = AcquireResult::new();
                out.insert(
                    "measured_voltage".to_string(),
                    Cell::Float(measured.scalar().map(|m| m.value).unwrap_or(f64::NAN)),
                );
                Ok(out)
            }) as BoxFuture<'static, Result<AcquireResult, LabError>>
        }
    }

    #[tokio::test]
    async fn sweep_produces_the_full_cartesian_product_in_order() {
        let bench = open_bench().await;
        bench
            .power_supply("psu")
            .unwrap()
            .channel(1)
            .unwrap()
            .on()
            .await
            .unwrap();

        let experiment = MeasurementSession::new("grid")
            .instruments_from(&bench)
            .parameter("voltage", vec![1.0, 2.0, 3.0], Some("V"))
            .unwrap()
            .parameter("delay", vec![0.1, 0.5], Some("s"))
            .unwrap()
            .acquire("psu_readback", measure_psu())
            .unwrap()
            .run_sweep()
            .await
            .unwrap();

        let frame = &experiment.frame;
        assert_eq!(frame.len(), 6);
        assert_eq!(
            frame.column_names(),
            vec!["voltage", "delay", "measured_voltage"]
        );

        // first declared parameter is outermost
        let voltages: Vec<f64> = frame.column("voltage").unwrap().f64_values();
        assert_eq!(voltages, vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let delays: Vec<f64> = frame.column("delay").unwrap().f64_values();
        assert_eq!(delays, vec![0.1, 0.5, 0.1, 0.5, 0.1, 0.5]);
        // simulated PSU echoes the programmed voltage
        let measured: Vec<f64> = frame.column("measured_voltage").unwrap().f64_values();
        assert_eq!(measured, voltages);

        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn two_sweeps_with_deterministic_sim_are_identical() {
        let run = || async {
            let bench = open_bench().await;
            bench
                .power_supply("psu")
                .unwrap()
                .channel(1)
                .unwrap()
                .on()
                .await
                .unwrap();
            let experiment = MeasurementSession::new("repeat")
                .instruments_from(&bench)
                .parameter("voltage", vec![1.0, 2.0], Some("V"))
                .unwrap()
                .acquire("psu_readback", measure_psu())
                .unwrap()
                .run_sweep()
                .await
                .unwrap();
            bench.close().await.unwrap();
            experiment.frame
        };

        let first = run().await;
        let second = run().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn conflicting_acquisition_keys_fail_the_run() {
        let bench = open_bench().await;
        let make = |_: AcquireContext| {
            Box::pin(async move {
                let mut out = AcquireResult::new();
                out.insert("same_key".to_string(), Cell::Float(1.0));
                Ok(out)
            }) as BoxFuture<'static, Result<AcquireResult, LabError>>
        };

        let err = MeasurementSession::new("conflict")
            .instruments_from(&bench)
            .parameter("x", vec![1.0], None)
            .unwrap()
            .acquire("first", make)
            .unwrap()
            .acquire("second", make)
            .unwrap()
            .run_sweep()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LabError::Session(SessionError::AcquisitionKeyConflict { .. })
        ));
        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_acquisitions_record_nulls_and_continue() {
        let bench = open_bench().await;
        let flaky = |ctx: AcquireContext| {
            Box::pin(async move {
                if ctx.param("x") == Some(2.0) {
                    return Err(LabError::from(SessionError::Cancelled));
                }
                let mut out = AcquireResult::new();
                out.insert("y".to_string(), Cell::Float(1.0));
                Ok(out)
            }) as BoxFuture<'static, Result<AcquireResult, LabError>>
        };

        let experiment = MeasurementSession::new("flaky")
            .instruments_from(&bench)
            .parameter("x", vec![1.0, 2.0, 3.0], None)
            .unwrap()
            .acquire("maybe", flaky)
            .unwrap()
            .run_sweep()
            .await
            .unwrap();

        let frame = &experiment.frame;
        assert_eq!(frame.len(), 3);
        assert!(!frame.cell(0, "y").unwrap().is_null());
        assert!(frame.cell(1, "y").unwrap().is_null());
        assert!(!frame.cell(2, "y").unwrap().is_null());
        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_mode_paces_ticks_and_cancels_tasks() {
        let bench = open_bench().await;
        bench
            .power_supply("psu")
            .unwrap()
            .channel(1)
            .unwrap()
            .set(1.0, 0.5)
            .await
            .unwrap()
            .on()
            .await
            .unwrap();

        let ramp_steps = Arc::new(AtomicU32::new(0));
        let ramp_counter = Arc::clone(&ramp_steps);

        let experiment = MeasurementSession::new("soak")
            .instruments_from(&bench)
            .task("ramp", move |ctx: TaskContext| {
                let counter = Arc::clone(&ramp_counter);
                Box::pin(async move {
                    let psu = ctx.power_supply("psu")?;
                    let mut voltage = 1.0;
                    while !ctx.is_cancelled() && voltage < 5.0 {
                        voltage += 0.1;
                        psu.channel(1)?.set_voltage(voltage).await?;
                        counter.fetch_add(1, Ordering::SeqCst);
                        if !ctx.sleep(Duration::from_millis(20)).await {
                            break;
                        }
                    }
                    Ok(())
                }) as BoxFuture<'static, Result<(), LabError>>
            })
            .unwrap()
            .acquire("psu_readback", measure_psu())
            .unwrap()
            .run_concurrent(Duration::from_millis(500), Duration::from_millis(50))
            .await
            .unwrap();

        let frame = &experiment.frame;
        // ⌊500/50⌋ = 10 ticks, ± 1 for scheduling slop
        assert!(
            (9..=11).contains(&frame.len()),
            "expected ~10 ticks, got {}",
            frame.len()
        );

        // monotonic offsets are non-decreasing with ≥ interval spacing
        let elapsed = frame.column("elapsed").unwrap().f64_values();
        for pair in elapsed.windows(2) {
            assert!(pair[1] > pair[0]);
            assert!(pair[1] - pair[0] >= 0.045, "ticks too close: {:?}", pair);
        }

        // the ramp made progress and was cancelled cooperatively
        assert!(ramp_steps.load(Ordering::SeqCst) > 0);
        assert!(experiment.abandoned_tasks.is_empty());
        assert!(experiment.task_errors.is_empty());

        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn stubborn_tasks_are_abandoned_after_the_grace_period() {
        let bench = open_bench().await;
        let experiment = MeasurementSession::new("stuck")
            .instruments_from(&bench)
            .task_grace(Duration::from_millis(50))
            .task("ignores_cancel", |_ctx: TaskContext| {
                Box::pin(async move {
                    // never observes the token
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }) as BoxFuture<'static, Result<(), LabError>>
            })
            .unwrap()
            .acquire("noop", |_ctx: AcquireContext| {
                Box::pin(async move { Ok(AcquireResult::new()) })
                    as BoxFuture<'static, Result<AcquireResult, LabError>>
            })
            .unwrap()
            .run_concurrent(Duration::from_millis(100), Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(experiment.abandoned_tasks, vec!["ignores_cancel".to_string()]);
        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn external_cancellation_surfaces_as_a_typed_error() {
        let bench = open_bench().await;
        let session = MeasurementSession::new("cancelled")
            .instruments_from(&bench)
            .acquire("noop", |_ctx: AcquireContext| {
                Box::pin(async move { Ok(AcquireResult::new()) })
                    as BoxFuture<'static, Result<AcquireResult, LabError>>
            })
            .unwrap();

        let cancel = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            cancel.cancel();
        });

        let err = session
            .run_concurrent(Duration::from_secs(10), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Session(SessionError::Cancelled)));
        bench.close().await.unwrap();
    }
}
