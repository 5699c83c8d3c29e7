//! Bench composition and lifecycle.
//!
//! A bench turns a descriptor into live instruments: resolve each profile,
//! pick a transport (replay > record > explicit backend > simulate flags >
//! address), merge safety limits, build the typed driver, connect, and
//! install it under its alias. On close, instruments shut down in reverse
//! construction order; each close is best-effort and failures are collected
//! into one composite report.

use crate::dc_load::DcLoad;
use crate::instrument::{ErrorSweep, InstrumentCore};
use crate::multimeter::Multimeter;
use crate::oscilloscope::Oscilloscope;
use crate::power_meter::PowerMeter;
use crate::power_supply::PowerSupply;
use crate::safety::SafetyOverlay;
use crate::spectrum_analyzer::SpectrumAnalyzer;
use crate::vna::Vna;
use crate::waveform_generator::WaveformGenerator;
use lab_core::{ConfigError, LabError, LabResult, Settings};
use lab_profiles::{
    BackendType, BenchDescriptor, DeviceType, InstrumentEntry, ProfileCatalog, ProfileSpec,
};
use lab_transport::{
    InstrumentSession, RecordingTransport, ReplayTransport, SessionDocument,
    SessionLogHandle, SimTransport, Transport, VisaTransport,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One live instrument, tagged by device type. Cross-type operations are
/// unrepresentable: each accessor hands out the concrete driver.
#[derive(Debug, Clone)]
pub enum Device {
    Oscilloscope(Arc<Oscilloscope>),
    PowerSupply(Arc<PowerSupply>),
    Multimeter(Arc<Multimeter>),
    WaveformGenerator(Arc<WaveformGenerator>),
    DcLoad(Arc<DcLoad>),
    SpectrumAnalyzer(Arc<SpectrumAnalyzer>),
    Vna(Arc<Vna>),
    PowerMeter(Arc<PowerMeter>),
}

impl Device {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Device::Oscilloscope(_) => DeviceType::Oscilloscope,
            Device::PowerSupply(_) => DeviceType::PowerSupply,
            Device::Multimeter(_) => DeviceType::Multimeter,
            Device::WaveformGenerator(_) => DeviceType::WaveformGenerator,
            Device::DcLoad(_) => DeviceType::DcLoad,
            Device::SpectrumAnalyzer(_) => DeviceType::SpectrumAnalyzer,
            Device::Vna(_) => DeviceType::Vna,
            Device::PowerMeter(_) => DeviceType::PowerMeter,
        }
    }

    pub fn core(&self) -> &InstrumentCore {
        match self {
            Device::Oscilloscope(d) => d.core(),
            Device::PowerSupply(d) => d.core(),
            Device::Multimeter(d) => d.core(),
            Device::WaveformGenerator(d) => d.core(),
            Device::DcLoad(d) => d.core(),
            Device::SpectrumAnalyzer(d) => d.core(),
            Device::Vna(d) => d.core(),
            Device::PowerMeter(d) => d.core(),
        }
    }

    async fn connect(&self) -> Result<(), LabError> {
        match self {
            Device::Oscilloscope(d) => d.connect().await,
            Device::PowerSupply(d) => d.connect().await,
            Device::Multimeter(d) => d.connect().await,
            Device::WaveformGenerator(d) => d.connect().await,
            Device::DcLoad(d) => d.connect().await,
            Device::SpectrumAnalyzer(d) => d.connect().await,
            Device::Vna(d) => d.connect().await,
            Device::PowerMeter(d) => d.connect().await,
        }
    }

    async fn close(&self) -> Result<(), LabError> {
        match self {
            Device::Oscilloscope(d) => d.close().await,
            Device::PowerSupply(d) => d.close().await,
            Device::Multimeter(d) => d.close().await,
            Device::WaveformGenerator(d) => d.close().await,
            Device::DcLoad(d) => d.close().await,
            Device::SpectrumAnalyzer(d) => d.close().await,
            Device::Vna(d) => d.close().await,
            Device::PowerMeter(d) => d.close().await,
        }
    }
}

/// Options that do not live in the descriptor: the replay source, the
/// simulator seed, and the error-sweep strategy.
#[derive(Default)]
pub struct BenchOptions {
    /// Session document for entries whose backend is `replay`.
    pub replay_session: Option<SessionDocument>,
    /// Seed for every simulator on the bench (reproducible CI runs).
    pub sim_seed: Option<u64>,
    /// Error sweep applied to every instrument.
    pub error_sweep: ErrorSweep,
    /// Profile catalog (override directory support).
    pub catalog: ProfileCatalog,
}

/// A named, connected set of instruments.
#[derive(Debug)]
pub struct Bench {
    name: String,
    descriptor: BenchDescriptor,
    settings: Settings,
    devices: Vec<(String, Device)>,
    recorders: Vec<(String, String, SessionLogHandle)>,
    closed: bool,
}

enum TransportChoice {
    Visa(String),
    Sim,
    Record(Box<TransportChoice>),
    Replay,
}

impl Bench {
    /// Open a bench from a descriptor file with freshly resolved settings.
    pub async fn open(path: impl AsRef<Path>) -> LabResult<Bench> {
        let descriptor = BenchDescriptor::from_yaml(path)?;
        let settings = Settings::load()?;
        Self::open_with(descriptor, settings, BenchOptions::default()).await
    }

    /// Open a bench from an in-memory descriptor.
    pub async fn open_with(
        descriptor: BenchDescriptor,
        settings: Settings,
        options: BenchOptions,
    ) -> LabResult<Bench> {
        let mut bench = Bench {
            name: descriptor.bench_name.clone(),
            descriptor: descriptor.clone(),
            settings,
            devices: Vec::new(),
            recorders: Vec::new(),
            closed: false,
        };

        for (alias, entry) in descriptor.instruments.iter() {
            match bench.build_instrument(alias, entry, &options).await {
                Ok(()) => {}
                Err(e) => {
                    // tear down whatever connected before the failure
                    let _ = bench.close_internal().await;
                    return Err(e);
                }
            }
        }

        bench.run_hooks(true).await?;
        Ok(bench)
    }

    async fn build_instrument(
        &mut self,
        alias: &str,
        entry: &InstrumentEntry,
        options: &BenchOptions,
    ) -> LabResult<()> {
        let profile = options.catalog.load(&entry.profile)?;
        let backend = self.descriptor.effective_backend(entry);
        let choice = self.choose_transport(alias, entry, backend.backend_type)?;
        let transport = self.instantiate_transport(
            alias,
            entry,
            &profile,
            choice,
            Duration::from_millis(backend.timeout_ms),
            options,
        )?;

        let safety = SafetyOverlay::build(
            &self.name,
            alias,
            &profile.safety_schema,
            entry.safety_limits.as_ref(),
        )?;

        let core = InstrumentCore::new(profile.clone(), transport, alias, safety)
            .with_error_sweep(options.error_sweep)
            .with_actor(self.settings.actor.clone());

        let device = match profile.device_type {
            DeviceType::Oscilloscope => Device::Oscilloscope(Arc::new(Oscilloscope::new(core))),
            DeviceType::PowerSupply => Device::PowerSupply(Arc::new(PowerSupply::new(core))),
            DeviceType::Multimeter => Device::Multimeter(Arc::new(Multimeter::new(core))),
            DeviceType::WaveformGenerator => {
                Device::WaveformGenerator(Arc::new(WaveformGenerator::new(core)))
            }
            DeviceType::DcLoad => Device::DcLoad(Arc::new(DcLoad::new(core))),
            DeviceType::SpectrumAnalyzer => {
                Device::SpectrumAnalyzer(Arc::new(SpectrumAnalyzer::new(core)))
            }
            DeviceType::Vna => Device::Vna(Arc::new(Vna::new(core))),
            DeviceType::PowerMeter => Device::PowerMeter(Arc::new(PowerMeter::new(core))),
        };

        device.connect().await?;
        tracing::info!(bench = %self.name, alias, device_type = %profile.device_type, "instrument installed");
        self.devices.push((alias.to_string(), device));
        Ok(())
    }

    /// Backend resolution order: forced simulation > replay > record >
    /// simulate flags > explicit sim backend > address.
    fn choose_transport(
        &self,
        alias: &str,
        entry: &InstrumentEntry,
        backend_type: BackendType,
    ) -> Result<TransportChoice, LabError> {
        let simulate = entry.simulate.unwrap_or(self.descriptor.simulate);

        if self.settings.force_simulate {
            return Ok(TransportChoice::Sim);
        }
        match backend_type {
            BackendType::Replay => Ok(TransportChoice::Replay),
            BackendType::Record => {
                let inner = if simulate || entry.address.is_none() {
                    TransportChoice::Sim
                } else {
                    TransportChoice::Visa(entry.address.clone().unwrap_or_default())
                };
                Ok(TransportChoice::Record(Box::new(inner)))
            }
            BackendType::Sim => Ok(TransportChoice::Sim),
            BackendType::Visa => {
                if simulate {
                    return Ok(TransportChoice::Sim);
                }
                match &entry.address {
                    Some(address) => Ok(TransportChoice::Visa(address.clone())),
                    // absent address implies simulation
                    None => {
                        tracing::debug!(alias, "no address declared, simulating");
                        Ok(TransportChoice::Sim)
                    }
                }
            }
        }
    }

    fn instantiate_transport(
        &mut self,
        alias: &str,
        entry: &InstrumentEntry,
        profile: &ProfileSpec,
        choice: TransportChoice,
        timeout: Duration,
        options: &BenchOptions,
    ) -> Result<Box<dyn Transport>, LabError> {
        match choice {
            TransportChoice::Visa(address) => {
                let transport = VisaTransport::new(&address)?.with_timeouts(
                    timeout,
                    Duration::from_millis(self.settings.connect_timeout_ms),
                );
                Ok(Box::new(transport))
            }
            TransportChoice::Sim => {
                let transport = SimTransport::from_profile(
                    profile,
                    self.settings.sim_strict,
                    options.sim_seed,
                )?;
                Ok(Box::new(transport))
            }
            TransportChoice::Record(inner) => {
                let inner = self.instantiate_transport(
                    alias, entry, profile, *inner, timeout, options,
                )?;
                let log = SessionLogHandle::new();
                self.recorders
                    .push((alias.to_string(), entry.profile.clone(), log.clone()));
                Ok(Box::new(RecordingTransport::new(inner, log)))
            }
            TransportChoice::Replay => {
                let session = options
                    .replay_session
                    .as_ref()
                    .ok_or_else(|| ConfigError::Invalid {
                        message: format!(
                            "instrument '{}' wants replay but no session document was supplied",
                            alias
                        ),
                    })?;
                let recorded = session.instrument(alias).ok_or_else(|| {
                    ConfigError::Invalid {
                        message: format!(
                            "session document has no recording for alias '{}'",
                            alias
                        ),
                    }
                })?;
                Ok(Box::new(ReplayTransport::new(
                    recorded.clone(),
                    self.settings.replay_strict_trailing,
                )))
            }
        }
    }

    async fn run_hooks(&self, pre: bool) -> LabResult<()> {
        let Some(automation) = &self.descriptor.automation else {
            return Ok(());
        };
        let steps = if pre {
            &automation.pre_run
        } else {
            &automation.post_run
        };
        for step in steps {
            let device = self.device(&step.alias)?;
            device.core().write_raw_command(&step.write).await?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &BenchDescriptor {
        &self.descriptor
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.devices.iter().map(|(alias, _)| alias.as_str()).collect()
    }

    pub fn device(&self, alias: &str) -> Result<&Device, LabError> {
        self.devices
            .iter()
            .find(|(name, _)| name == alias)
            .map(|(_, device)| device)
            .ok_or_else(|| {
                ConfigError::UnknownAlias {
                    alias: alias.to_string(),
                }
                .into()
            })
    }

    fn typed_error(&self, alias: &str, requested: &str, actual: DeviceType) -> LabError {
        ConfigError::WrongDeviceType {
            alias: alias.to_string(),
            requested: requested.to_string(),
            actual: actual.to_string(),
        }
        .into()
    }

    pub fn oscilloscope(&self, alias: &str) -> Result<Arc<Oscilloscope>, LabError> {
        match self.device(alias)? {
            Device::Oscilloscope(d) => Ok(Arc::clone(d)),
            other => Err(self.typed_error(alias, "oscilloscope", other.device_type())),
        }
    }

    pub fn power_supply(&self, alias: &str) -> Result<Arc<PowerSupply>, LabError> {
        match self.device(alias)? {
            Device::PowerSupply(d) => Ok(Arc::clone(d)),
            other => Err(self.typed_error(alias, "power_supply", other.device_type())),
        }
    }

    pub fn multimeter(&self, alias: &str) -> Result<Arc<Multimeter>, LabError> {
        match self.device(alias)? {
            Device::Multimeter(d) => Ok(Arc::clone(d)),
            other => Err(self.typed_error(alias, "multimeter", other.device_type())),
        }
    }

    pub fn waveform_generator(&self, alias: &str) -> Result<Arc<WaveformGenerator>, LabError> {
        match self.device(alias)? {
            Device::WaveformGenerator(d) => Ok(Arc::clone(d)),
            other => Err(self.typed_error(alias, "waveform_generator", other.device_type())),
        }
    }

    pub fn dc_load(&self, alias: &str) -> Result<Arc<DcLoad>, LabError> {
        match self.device(alias)? {
            Device::DcLoad(d) => Ok(Arc::clone(d)),
            other => Err(self.typed_error(alias, "dc_load", other.device_type())),
        }
    }

    pub fn spectrum_analyzer(&self, alias: &str) -> Result<Arc<SpectrumAnalyzer>, LabError> {
        match self.device(alias)? {
            Device::SpectrumAnalyzer(d) => Ok(Arc::clone(d)),
            other => Err(self.typed_error(alias, "spectrum_analyzer", other.device_type())),
        }
    }

    pub fn vna(&self, alias: &str) -> Result<Arc<Vna>, LabError> {
        match self.device(alias)? {
            Device::Vna(d) => Ok(Arc::clone(d)),
            other => Err(self.typed_error(alias, "vna", other.device_type())),
        }
    }

    pub fn power_meter(&self, alias: &str) -> Result<Arc<PowerMeter>, LabError> {
        match self.device(alias)? {
            Device::PowerMeter(d) => Ok(Arc::clone(d)),
            other => Err(self.typed_error(alias, "power_meter", other.device_type())),
        }
    }

    /// Session document assembled from the bench's recording transports.
    /// Empty when nothing records.
    pub fn recorded_session(&self) -> SessionDocument {
        let mut document = SessionDocument::default();
        for (alias, profile_ref, log) in &self.recorders {
            document.insert(
                alias.clone(),
                InstrumentSession {
                    profile: profile_ref.clone(),
                    log: log.snapshot(),
                },
            );
        }
        document
    }

    async fn close_internal(&mut self) -> Vec<LabError> {
        let mut failures = Vec::new();
        // post-run hooks run while everything is still connected
        if let Err(e) = self.run_hooks(false).await {
            failures.push(e);
        }
        for (alias, device) in self.devices.iter().rev() {
            if let Err(e) = device.close().await {
                tracing::warn!(alias = %alias, error = %e, "instrument close failed");
                failures.push(e);
            }
        }
        self.devices.clear();
        self.closed = true;
        failures
    }

    /// Close every instrument in reverse construction order. Failures are
    /// collected and reported together; the bench is unusable afterwards.
    pub async fn close(mut self) -> LabResult<()> {
        let failures = self.close_internal().await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LabError::ShutdownFailed(failures))
        }
    }
}

impl Drop for Bench {
    fn drop(&mut self) {
        if !self.closed && !self.devices.is_empty() {
            // close() not awaited; sim/replay sessions hold no OS resources,
            // but hardware links deserve a loud note
            tracing::warn!(bench = %self.name, "bench dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIM_BENCH: &str = r#"
bench_name: sim_rig
simulate: true
instruments:
  scope:
    profile: keysight/DSOX1204G
  psu:
    profile: keysight/EDU36311A
    safety_limits:
      channels:
        1: { voltage: { max: 6.0 } }
  dmm:
    profile: keysight/EDU34450A
"#;

    async fn open_sim_bench() -> Bench {
        let descriptor = BenchDescriptor::from_yaml_str(SIM_BENCH).unwrap();
        let options = BenchOptions {
            sim_seed: Some(1234),
            ..Default::default()
        };
        Bench::open_with(descriptor, Settings::default(), options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bench_connects_every_instrument_before_user_code_sees_it() {
        let bench = open_sim_bench().await;
        assert_eq!(bench.aliases(), vec!["scope", "psu", "dmm"]);
        for alias in bench.aliases() {
            assert!(bench.device(alias).unwrap().core().idn().is_some());
        }
        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn typed_accessors_reject_cross_type_use() {
        let bench = open_sim_bench().await;
        assert!(bench.power_supply("psu").is_ok());
        let err = bench.oscilloscope("psu").unwrap_err();
        assert!(matches!(
            err,
            LabError::Config(ConfigError::WrongDeviceType { .. })
        ));
        let err = bench.multimeter("nope").unwrap_err();
        assert!(matches!(
            err,
            LabError::Config(ConfigError::UnknownAlias { .. })
        ));
        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn bench_safety_limits_reach_the_driver() {
        let bench = open_sim_bench().await;
        let psu = bench.power_supply("psu").unwrap();
        let err = psu.channel(1).unwrap().set(7.0, 0.5).await.unwrap_err();
        assert!(matches!(err, LabError::Safety(_)));
        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn widened_limits_fail_bench_open() {
        let yaml = r#"
bench_name: bad
simulate: true
instruments:
  psu:
    profile: keysight/EDU36311A
    safety_limits:
      channels:
        1: { voltage: { max: 600.0 } }
"#;
        let descriptor = BenchDescriptor::from_yaml_str(yaml).unwrap();
        let err = Bench::open_with(descriptor, Settings::default(), BenchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::Config(ConfigError::LimitWidened { .. })
        ));
    }

    #[tokio::test]
    async fn force_simulate_overrides_addresses() {
        let yaml = r#"
bench_name: forced
instruments:
  psu:
    profile: keysight/EDU36311A
    address: "TCPIP0::192.0.2.1::5025::SOCKET"
"#;
        let descriptor = BenchDescriptor::from_yaml_str(yaml).unwrap();
        let settings = Settings {
            force_simulate: true,
            ..Default::default()
        };
        // connecting to 192.0.2.1 would hang; forced simulation never dials
        let bench = Bench::open_with(descriptor, settings, BenchOptions::default())
            .await
            .unwrap();
        assert!(bench
            .device("psu")
            .unwrap()
            .core()
            .idn()
            .unwrap()
            .contains("EDU36311A"));
        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn record_mode_collects_a_session_document() {
        let yaml = r#"
bench_name: recorded
simulate: true
backend_defaults: { type: record }
instruments:
  psu:
    profile: keysight/EDU36311A
"#;
        let descriptor = BenchDescriptor::from_yaml_str(yaml).unwrap();
        let bench = Bench::open_with(
            descriptor,
            Settings::default(),
            BenchOptions {
                sim_seed: Some(7),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let psu = bench.power_supply("psu").unwrap();
        psu.channel(1).unwrap().set(2.0, 0.1).await.unwrap();

        let document = bench.recorded_session().clone();
        let session = document.instrument("psu").unwrap();
        // *IDN? from connect, then the two programming writes
        assert!(session.log.len() >= 3);
        assert_eq!(session.log[0].command, "*IDN?");
        assert_eq!(session.profile, "keysight/EDU36311A");
        bench.close().await.unwrap();
    }

    #[tokio::test]
    async fn automation_hooks_run_against_named_instruments() {
        let yaml = r#"
bench_name: hooked
simulate: true
instruments:
  psu:
    profile: keysight/EDU36311A
automation:
  pre_run:
    - { alias: psu, write: "*RST" }
"#;
        let descriptor = BenchDescriptor::from_yaml_str(yaml).unwrap();
        let bench = Bench::open_with(descriptor, Settings::default(), BenchOptions::default())
            .await
            .unwrap();
        bench.close().await.unwrap();
    }
}
