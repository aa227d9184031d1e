//! The lab actor.
//!
//! [`Lab`] owns the executor, the scan orchestrator, the camera manager, the
//! live power monitor, the piezo aligner and the exporter. All state changes
//! requested by the interactive side go through a single task that processes
//! [`LabCommand`]s in order; the interactive side holds a [`LabClient`] and reads results
//! from the event bus.

use crate::alignment::{Aligner, AlignmentSettings, MappingSettings};
use crate::bus::{Component, ErrorReport, Event, EventSender, Producer, Publisher};
use crate::camera::{CameraManager, CameraSession};
use crate::config::{AppConfig, CameraConfig, PiezoConfig};
use crate::device::mock::{
    MockCameraBackend, MockControl, MockCoupling, MockPiezo, MockPowerMonitor, MockScanUnit,
};
use crate::device::{
    CameraBackend, CameraParameter, Connection, DeviceId, Instrument, PiezoStage, PowerMonitor, PowerSample,
    ScanUnit,
};
use crate::error::{AlignmentError, ExportError, LabError, LabResult};
use crate::executor::TaskExecutor;
use crate::export::{ExportEvent, Exporter};
use crate::messages::{ExportRequest, LabCommand};
use crate::monitor::PowerMonitorService;
use crate::scan::{ScanConfig, ScanOrchestrator, ScanRun};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Commands queued before the sender waits.
pub const COMMAND_CAPACITY: usize = 64;

/// Drivers handed to the lab. `None` leaves the instrument out.
pub struct Instruments {
    /// Wavelength scan unit.
    pub scan_unit: Option<Box<dyn ScanUnit>>,
    /// Power monitor, shared by scans, the live monitor and alignment.
    pub power_monitor: Option<Box<dyn PowerMonitor>>,
    /// Camera discovery and drivers.
    pub cameras: Arc<dyn CameraBackend>,
    /// Input-side piezo stage.
    pub piezo_left: Option<Box<dyn PiezoStage>>,
    /// Output-side piezo stage.
    pub piezo_right: Option<Box<dyn PiezoStage>>,
}

impl Instruments {
    /// Simulated instruments at the configured addresses.
    ///
    /// Detector 1 of the simulated monitor follows the simulated stages,
    /// which start slightly off their best coupling.
    pub fn simulated(config: &AppConfig) -> Self {
        let unit = &config.instruments.scan_unit;
        let monitor = &config.instruments.power_monitor;
        let mut backend = MockCameraBackend::new();
        for camera in &config.cameras {
            backend.add_camera(camera.identifier.as_str(), camera.spec().name);
        }
        let coupling = MockCoupling::new(-12.0, 2.0);
        let piezo = |piezo: &PiezoConfig, optimum: [f64; 3]| {
            piezo.enabled.then(|| {
                let id = DeviceId::new(piezo.address.clone());
                coupling.set_optimum(&id, optimum);
                Box::new(MockPiezo::new(id, MockControl::new()).with_coupling(coupling.clone()))
                    as Box<dyn PiezoStage>
            })
        };
        Self {
            scan_unit: unit
                .enabled
                .then(|| Box::new(MockScanUnit::new(unit.address.as_str())) as Box<dyn ScanUnit>),
            power_monitor: monitor.enabled.then(|| {
                Box::new(MockPowerMonitor::new(monitor.address.as_str()).with_coupling(coupling.clone()))
                    as Box<dyn PowerMonitor>
            }),
            cameras: Arc::new(backend),
            piezo_left: piezo(&config.instruments.piezo_left, [38.0, 37.5, 38.5]),
            piezo_right: piezo(&config.instruments.piezo_right, [37.5, 37.0, 37.5]),
        }
    }
}

/// Actor that owns every core component.
pub struct Lab {
    config: AppConfig,
    runtime: Handle,
    executor: TaskExecutor,
    events: Publisher,
    scans: Option<ScanOrchestrator>,
    monitor: Option<PowerMonitorService>,
    aligner: Option<Aligner>,
    cameras: CameraManager,
    exporter: Arc<Exporter>,
    stopped: bool,
}

impl Lab {
    /// Registers a device lane for every instrument and builds the components.
    pub fn new(runtime: Handle, bus: EventSender, config: AppConfig, instruments: Instruments) -> LabResult<Self> {
        let executor = TaskExecutor::new(runtime.clone(), bus.clone(), config.runtime.executor());

        let monitor_cfg = &config.instruments.power_monitor;
        let monitor_lane = match instruments.power_monitor {
            Some(device) if monitor_cfg.enabled => {
                let id = device.id().clone();
                Some(executor.register(id, Connection::new(device, monitor_cfg.address.clone()))?)
            }
            _ => None,
        };

        let unit_cfg = &config.instruments.scan_unit;
        let scans = match instruments.scan_unit {
            Some(device) if unit_cfg.enabled => {
                let id = device.id().clone();
                let lane = executor.register(id, Connection::new(device, unit_cfg.address.clone()))?;
                Some(ScanOrchestrator::new(
                    runtime.clone(),
                    bus.clone(),
                    lane,
                    monitor_lane.clone(),
                    config.scan_settings(),
                ))
            }
            _ => None,
        };

        let mut piezo_lanes = Vec::new();
        for (device, piezo_cfg) in [
            (instruments.piezo_left, &config.instruments.piezo_left),
            (instruments.piezo_right, &config.instruments.piezo_right),
        ] {
            let lane = match device {
                Some(device) if piezo_cfg.enabled => {
                    let id = device.id().clone();
                    Some(executor.register(id, Connection::new(device, piezo_cfg.address.clone()))?)
                }
                _ => None,
            };
            piezo_lanes.push(lane);
        }
        let right = piezo_lanes.pop().flatten();
        let left = piezo_lanes.pop().flatten();
        let aligner = match (&monitor_lane, left.is_some() || right.is_some()) {
            (Some(monitor), true) => Some(Aligner::new(
                runtime.clone(),
                left,
                right,
                monitor.clone(),
                bus.publisher(Producer::Alignment),
                config.alignment.options(),
            )),
            _ => None,
        };

        let monitor = monitor_lane.map(|lane| {
            PowerMonitorService::new(
                runtime.clone(),
                lane,
                bus.publisher(Producer::Monitor),
                config.monitor_options(),
            )
        });

        let specs = config.cameras.iter().map(CameraConfig::spec).collect();
        let cameras = CameraManager::new(executor.clone(), instruments.cameras, config.runtime.watchdog(), specs)?;

        Ok(Self {
            events: bus.publisher(Producer::Lab),
            exporter: Arc::new(Exporter::default()),
            config,
            runtime,
            executor,
            scans,
            monitor,
            aligner,
            cameras,
            stopped: false,
        })
    }

    /// Replaces the default CSV + JSON exporter.
    pub fn with_exporter(mut self, exporter: Exporter) -> Self {
        self.exporter = Arc::new(exporter);
        self
    }

    /// Executor the lab registered its devices with.
    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Spawns the actor on its runtime.
    pub fn spawn(self) -> (LabClient, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let runtime = self.runtime.clone();
        let task = runtime.spawn(self.run(rx));
        (LabClient { commands: tx }, task)
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub async fn run(mut self, mut commands: mpsc::Receiver<LabCommand>) {
        info!(name = %self.config.application.name, "lab started");
        self.open_enabled_cameras();

        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }

        self.shutdown();
        info!("lab stopped");
    }

    /// Returns false once the actor should stop.
    fn handle(&mut self, command: LabCommand) -> bool {
        match command {
            LabCommand::StartScan { config, response } => {
                let _ = response.send(self.start_scan(config));
            }
            LabCommand::AbortScan { response } => {
                let result = self.scans().and_then(|scans| Ok(scans.abort()?));
                let _ = response.send(result);
            }
            LabCommand::GetScanRun { run, response } => {
                let _ = response.send(self.scan_run(run));
            }
            LabCommand::GetScanHistory { response } => {
                let history = self.scans.as_ref().map(ScanOrchestrator::history).unwrap_or_default();
                let _ = response.send(history);
            }
            LabCommand::OpenCamera { camera, response } => {
                let _ = response.send(self.cameras.open(&camera).map_err(LabError::from));
            }
            LabCommand::CloseCamera { camera, response } => {
                let _ = response.send(self.cameras.close(&camera).map_err(LabError::from));
            }
            LabCommand::SetCameraParameter {
                camera,
                parameter,
                response,
            } => {
                let _ = response.send(self.set_camera_parameter(&camera, parameter));
            }
            LabCommand::DiscoverCameras { response } => {
                self.cameras.discover();
                let _ = response.send(());
            }
            LabCommand::GetCameraSessions { response } => {
                let _ = response.send(self.cameras.sessions());
            }
            LabCommand::StartMonitor { response } => {
                let result = self.monitor_mut().map(PowerMonitorService::start);
                let _ = response.send(result);
            }
            LabCommand::StopMonitor { response } => {
                let result = self.monitor_mut().map(PowerMonitorService::stop);
                let _ = response.send(result);
            }
            LabCommand::GetMonitorSamples { response } => {
                let samples = self.monitor.as_ref().map(PowerMonitorService::samples).unwrap_or_default();
                let _ = response.send(samples);
            }
            LabCommand::StartAlignment { settings, response } => {
                let settings = settings.unwrap_or(self.config.alignment.climb);
                let result = self
                    .idle_aligner()
                    .and_then(|aligner| Ok(aligner.start_alignment(settings)?));
                let _ = response.send(result);
            }
            LabCommand::StartMapping { settings, response } => {
                let settings = settings.unwrap_or(self.config.alignment.mapping);
                let result = self
                    .idle_aligner()
                    .and_then(|aligner| Ok(aligner.start_mapping(settings)?));
                let _ = response.send(result);
            }
            LabCommand::StopAlignment { response } => {
                let result = self.aligner_mut().map(Aligner::stop);
                let _ = response.send(result);
            }
            LabCommand::Export { request, response } => {
                let _ = response.send(self.export(request));
            }
            LabCommand::Shutdown { response } => {
                info!("Shutdown command received");
                self.shutdown();
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    fn scans(&self) -> LabResult<&ScanOrchestrator> {
        self.scans.as_ref().ok_or(LabError::Disabled("scan unit"))
    }

    fn monitor_mut(&mut self) -> LabResult<&mut PowerMonitorService> {
        self.monitor.as_mut().ok_or(LabError::Disabled("power monitor"))
    }

    fn aligner_mut(&mut self) -> LabResult<&mut Aligner> {
        self.aligner.as_mut().ok_or(LabError::Disabled("piezo aligner"))
    }

    /// The aligner, provided no scan holds the laser and detectors.
    fn idle_aligner(&mut self) -> LabResult<&mut Aligner> {
        if self.scans.as_ref().is_some_and(|scans| scans.status().is_active()) {
            return Err(AlignmentError::ScanActive.into());
        }
        self.aligner_mut()
    }

    fn open_enabled_cameras(&mut self) {
        let enabled: Vec<DeviceId> = self
            .config
            .enabled_cameras()
            .into_iter()
            .map(|camera| DeviceId::new(camera.identifier.clone()))
            .collect();
        for camera in enabled {
            if let Err(err) = self.cameras.open(&camera) {
                warn!(camera = %camera, error = %err, "could not open camera at startup");
                self.events.error(ErrorReport::new(Component::Camera, Some(camera), err.to_string()));
            }
        }
    }

    fn start_scan(&self, config: Option<ScanConfig>) -> LabResult<Uuid> {
        let scans = self.scans()?;
        if let Some(task) = self.aligner.as_ref().and_then(Aligner::active) {
            return Err(AlignmentError::Busy(task.name()).into());
        }
        let config = config.unwrap_or_else(|| self.config.scan_defaults.scan_config());
        Ok(scans.start_scan(config)?)
    }

    fn scan_run(&self, run: Option<Uuid>) -> Option<ScanRun> {
        let scans = self.scans.as_ref()?;
        match run {
            Some(id) => scans.run(id),
            None => scans.current().or_else(|| scans.last_finished()),
        }
    }

    fn set_camera_parameter(&self, camera: &DeviceId, parameter: CameraParameter) -> LabResult<()> {
        // The outcome arrives on the bus as SettingsChanged or an error report.
        self.cameras.set_parameter(camera, parameter)?;
        Ok(())
    }

    /// Checks the run synchronously, then writes the files off the actor.
    fn export(&self, request: ExportRequest) -> LabResult<Uuid> {
        let scans = self.scans()?;
        let run = match request.run {
            Some(id) => scans.run(id).ok_or(LabError::RunNotFound(id))?,
            None => scans.last_finished().ok_or(LabError::NoFinishedRun)?,
        };
        if !run.status.is_exportable() {
            return Err(ExportError::NotExportable(run.status).into());
        }

        let id = run.id;
        let directory = request
            .directory
            .unwrap_or_else(|| self.config.export.output_dir.clone());
        let base_name = request.base_name;
        let exporter = self.exporter.clone();
        let events = self.events.clone();
        self.runtime.spawn_blocking(move || {
            match exporter.export(&run, &directory, base_name.as_deref()) {
                Ok(report) => {
                    for err in &report.errors {
                        events.error(ErrorReport::new(Component::Export, None, err.to_string()));
                    }
                    events.publish(Event::Export(ExportEvent::from_report(run.id, &report)));
                }
                Err(err) => {
                    error!(run = %run.id, error = %err, "export failed");
                    events.error(ErrorReport::new(Component::Export, None, err.to_string()));
                }
            }
        });
        Ok(id)
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(scans) = &self.scans {
            if scans.status().is_active() {
                let _ = scans.abort();
            }
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
        if let Some(aligner) = self.aligner.as_mut() {
            aligner.stop();
        }
        self.cameras.shutdown();
    }
}

/// Cloneable command sender for the lab actor.
#[derive(Clone)]
pub struct LabClient {
    commands: mpsc::Sender<LabCommand>,
}

impl LabClient {
    /// Sends a command built by a [`LabCommand`] helper and awaits its reply.
    pub async fn send<T>(&self, (command, reply): (LabCommand, oneshot::Receiver<T>)) -> LabResult<T> {
        self.commands.send(command).await.map_err(|_| LabError::ShuttingDown)?;
        reply.await.map_err(|_| LabError::ShuttingDown)
    }

    /// Blocking variant of [`send`](Self::send) for threads outside the runtime.
    pub fn send_blocking<T>(&self, (command, reply): (LabCommand, oneshot::Receiver<T>)) -> LabResult<T> {
        self.commands
            .blocking_send(command)
            .map_err(|_| LabError::ShuttingDown)?;
        reply.blocking_recv().map_err(|_| LabError::ShuttingDown)
    }

    /// Starts a scan; replies with the run id.
    pub async fn start_scan(&self, config: Option<ScanConfig>) -> LabResult<Uuid> {
        self.send(LabCommand::start_scan(config)).await?
    }

    /// Aborts the active scan.
    pub async fn abort_scan(&self) -> LabResult<()> {
        self.send(LabCommand::abort_scan()).await?
    }

    /// The active run, a run from history, or the last finished run.
    pub async fn scan_run(&self, run: Option<Uuid>) -> LabResult<Option<ScanRun>> {
        self.send(LabCommand::get_scan_run(run)).await
    }

    /// Archived runs, oldest first.
    pub async fn scan_history(&self) -> LabResult<Vec<ScanRun>> {
        self.send(LabCommand::get_scan_history()).await
    }

    /// Opens a configured camera.
    pub async fn open_camera(&self, camera: impl Into<DeviceId>) -> LabResult<()> {
        self.send(LabCommand::open_camera(camera.into())).await?
    }

    /// Closes a camera session.
    pub async fn close_camera(&self, camera: impl Into<DeviceId>) -> LabResult<()> {
        self.send(LabCommand::close_camera(camera.into())).await?
    }

    /// Applies a parameter to a Live camera.
    pub async fn set_camera_parameter(&self, camera: impl Into<DeviceId>, parameter: CameraParameter) -> LabResult<()> {
        self.send(LabCommand::set_camera_parameter(camera.into(), parameter)).await?
    }

    /// Requests discovery; the list arrives on the bus.
    pub async fn discover_cameras(&self) -> LabResult<()> {
        self.send(LabCommand::discover_cameras()).await
    }

    /// Snapshot of every camera session.
    pub async fn camera_sessions(&self) -> LabResult<Vec<CameraSession>> {
        self.send(LabCommand::get_camera_sessions()).await
    }

    /// True if this call started the monitor.
    pub async fn start_monitor(&self) -> LabResult<bool> {
        self.send(LabCommand::start_monitor()).await?
    }

    /// True if this call stopped the monitor.
    pub async fn stop_monitor(&self) -> LabResult<bool> {
        self.send(LabCommand::stop_monitor()).await?
    }

    /// Buffered monitor samples.
    pub async fn monitor_samples(&self) -> LabResult<Vec<PowerSample>> {
        self.send(LabCommand::get_monitor_samples()).await
    }

    /// Aligns both piezo stages.
    pub async fn start_alignment(&self, settings: Option<AlignmentSettings>) -> LabResult<()> {
        self.send(LabCommand::start_alignment(settings)).await?
    }

    /// Maps coupled power over one stage.
    pub async fn start_mapping(&self, settings: Option<MappingSettings>) -> LabResult<()> {
        self.send(LabCommand::start_mapping(settings)).await?
    }

    /// True if an alignment task was stopped.
    pub async fn stop_alignment(&self) -> LabResult<bool> {
        self.send(LabCommand::stop_alignment()).await?
    }

    /// Queues an export; replies with the run id.
    pub async fn export(&self, request: ExportRequest) -> LabResult<Uuid> {
        self.send(LabCommand::export(request)).await?
    }

    /// Stops the actor after shutting every component down.
    pub async fn shutdown(&self) -> LabResult<()> {
        self.send(LabCommand::shutdown()).await
    }
}
