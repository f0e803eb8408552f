use crate::accounting;
use crate::data::{
    Device, DeviceReport, DeviceSample, MergedProcessRecord, ProcessReport, Snapshot,
    UnitFailure, WorkloadIdentity,
};
use crate::identity::{IdentityError, WorkloadIdentityResolver};
use crate::monitor::{GpuBackend, GpuDevice, MonitorError};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("failed to enumerate devices: {0}")]
    Enumeration(#[source] MonitorError),
}

#[derive(Clone, Copy, Debug)]
pub struct CollectorConfig {
    pub fan_speed: bool,
    pub processes: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            fan_speed: true,
            processes: true,
        }
    }
}

/// Whether fan speed is still worth reading. The only transition is
/// `Enabled -> Disabled`, taken the first time a device reports the sensor
/// as unsupported; it holds for the rest of the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanSpeedSupport {
    Enabled,
    Disabled,
}

impl FanSpeedSupport {
    pub fn is_enabled(self) -> bool {
        self == FanSpeedSupport::Enabled
    }

    /// Returns true if this call performed the transition.
    fn disable(&mut self) -> bool {
        let was_enabled = self.is_enabled();
        *self = FanSpeedSupport::Disabled;
        was_enabled
    }
}

// State that outlives a single pass; only touched with the pass lock held
struct PassState {
    fan_speed: FanSpeedSupport,
}

/// Device plus everything gathered for it during one pass.
#[derive(Debug)]
pub struct DeviceBuild {
    pub device: Device,
    pub sample: DeviceSample,
    pub processes: Vec<(MergedProcessRecord, WorkloadIdentity)>,
    pub failures: Vec<UnitFailure>,
}

/// Samples one device: static attributes, dynamic status, and the merged
/// per-process accounting with workload identities attached.
pub struct DeviceSnapshotBuilder<'a> {
    backend: &'a dyn GpuBackend,
    resolver: &'a dyn WorkloadIdentityResolver,
    fan_speed: &'a mut FanSpeedSupport,
    collect_processes: bool,
}

impl<'a> DeviceSnapshotBuilder<'a> {
    pub fn new(
        backend: &'a dyn GpuBackend,
        resolver: &'a dyn WorkloadIdentityResolver,
        fan_speed: &'a mut FanSpeedSupport,
        collect_processes: bool,
    ) -> Self {
        Self {
            backend,
            resolver,
            fan_speed,
            collect_processes,
        }
    }

    /// Fails only when the device itself is unusable (no handle or no static
    /// attributes); every other failure is recorded in the returned build.
    pub fn build(&mut self, index: u32) -> Result<DeviceBuild, UnitFailure> {
        let device_failure = |err: MonitorError| {
            warn!("device {}: skipped: {}", index, err);
            UnitFailure::Device {
                index,
                error: err.to_string(),
            }
        };

        let backend = self.backend;
        let handle = backend.device(index).map_err(device_failure)?;
        let device = read_static(index, handle.as_ref()).map_err(device_failure)?;

        let mut failures = Vec::new();
        let sample = self.read_dynamic(index, handle.as_ref(), &mut failures);
        let processes = if self.collect_processes {
            self.read_processes(index, handle.as_ref(), &mut failures)
        } else {
            Vec::new()
        };

        Ok(DeviceBuild {
            device,
            sample,
            processes,
            failures,
        })
    }

    fn read_dynamic(
        &mut self,
        index: u32,
        handle: &dyn GpuDevice,
        failures: &mut Vec<UnitFailure>,
    ) -> DeviceSample {
        let fan_speed_percent = if self.fan_speed.is_enabled() {
            match handle.fan_speed() {
                Err(err) if err.is_unsupported() => {
                    if self.fan_speed.disable() {
                        warn!(
                            "device {}: {}; fan speed collection disabled for all devices",
                            index, err
                        );
                    }
                    None
                }
                result => read_field(index, "fan_speed", result, failures),
            }
        } else {
            None
        };

        DeviceSample {
            used_memory_bytes: read_field(index, "memory_used", handle.used_memory(), failures),
            duty_cycle_percent: read_field(index, "duty_cycle", handle.duty_cycle(), failures),
            power_milliwatts: read_field(index, "power_usage", handle.power_usage(), failures),
            temperature_celsius: read_field(index, "temperature", handle.temperature(), failures),
            encoder_util_percent: read_field(
                index,
                "encoder_utilization",
                handle.encoder_utilization(),
                failures,
            ),
            decoder_util_percent: read_field(
                index,
                "decoder_utilization",
                handle.decoder_utilization(),
                failures,
            ),
            fan_speed_percent,
        }
    }

    fn read_processes(
        &self,
        index: u32,
        handle: &dyn GpuDevice,
        failures: &mut Vec<UnitFailure>,
    ) -> Vec<(MergedProcessRecord, WorkloadIdentity)> {
        let lists = handle
            .graphics_processes()
            .and_then(|mem| Ok((mem, handle.process_utilization()?)));
        let (mem_records, util_records) = match lists {
            Ok(lists) => lists,
            Err(err) => {
                warn!("device {}: process accounting unavailable: {}", index, err);
                failures.push(UnitFailure::Processes {
                    index,
                    error: err.to_string(),
                });
                return Vec::new();
            }
        };

        let merged = accounting::merge(&mem_records, &util_records);
        let mut resolved = Vec::with_capacity(merged.len());
        for record in merged {
            match self.resolver.resolve(record.pid) {
                Ok(identity) => resolved.push((record, identity)),
                Err(err) => {
                    match &err {
                        IdentityError::ProcessLookup { .. } => {
                            debug!("device {}: {}", index, err)
                        }
                        IdentityError::MalformedIdentity { .. } => {
                            warn!("device {}: {}", index, err)
                        }
                    }
                    failures.push(UnitFailure::Process {
                        index,
                        pid: record.pid,
                        error: err.to_string(),
                    });
                }
            }
        }
        resolved
    }
}

// A failed dynamic read drops only that field
fn read_field<T>(
    index: u32,
    field: &'static str,
    result: Result<T, MonitorError>,
    failures: &mut Vec<UnitFailure>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        // Optional sensors missing on this hardware are not failures
        Err(err) if err.is_unsupported() => {
            debug!("device {}: {}", index, err);
            None
        }
        Err(err) => {
            warn!("device {}: reading {} failed: {}", index, field, err);
            failures.push(UnitFailure::DeviceField {
                index,
                field,
                error: err.to_string(),
            });
            None
        }
    }
}

fn read_static(index: u32, handle: &dyn GpuDevice) -> Result<Device, MonitorError> {
    Ok(Device {
        index,
        minor_number: handle.minor_number()?,
        uuid: handle.uuid()?,
        name: handle.name()?,
        total_memory_bytes: handle.total_memory()?,
    })
}

/// Runs collection passes, one at a time.
///
/// A caller arriving while a pass is in flight waits for it to finish and
/// then runs its own pass; results are never shared between callers.
pub struct Collector {
    backend: Box<dyn GpuBackend>,
    resolver: Box<dyn WorkloadIdentityResolver>,
    collect_processes: bool,
    state: Mutex<PassState>,
}

impl Collector {
    pub fn new(
        backend: Box<dyn GpuBackend>,
        resolver: Box<dyn WorkloadIdentityResolver>,
        config: CollectorConfig,
    ) -> Self {
        let fan_speed = if config.fan_speed {
            FanSpeedSupport::Enabled
        } else {
            FanSpeedSupport::Disabled
        };
        Self {
            backend,
            resolver,
            collect_processes: config.processes,
            state: Mutex::new(PassState { fan_speed }),
        }
    }

    #[cfg(test)]
    pub fn fan_speed_support(&self) -> FanSpeedSupport {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fan_speed
    }

    /// Runs one pass. An error means the device count was unavailable and
    /// nothing was collected; callers treat it as an empty snapshot.
    pub fn collect(&self) -> Result<Snapshot, CollectError> {
        // Only one pass in progress at a time.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let num_devices = self.backend.device_count().map_err(|err| {
            error!("device count unavailable: {}", err);
            CollectError::Enumeration(err)
        })?;

        let mut snapshot = Snapshot {
            num_devices,
            ..Snapshot::empty()
        };
        let mut builder = DeviceSnapshotBuilder::new(
            self.backend.as_ref(),
            self.resolver.as_ref(),
            &mut state.fan_speed,
            self.collect_processes,
        );

        for index in 0..num_devices {
            match builder.build(index) {
                Ok(build) => {
                    snapshot.processes.extend(build.processes.into_iter().map(
                        |(process, identity)| ProcessReport {
                            device: build.device.clone(),
                            process,
                            identity,
                        },
                    ));
                    snapshot.devices.push(DeviceReport {
                        device: build.device,
                        sample: build.sample,
                    });
                    snapshot.failures.extend(build.failures);
                }
                Err(failure) => snapshot.failures.push(failure),
            }
        }

        debug!(
            "pass complete: {} devices, {} sampled, {} processes, {} failures",
            snapshot.num_devices,
            snapshot.devices.len(),
            snapshot.processes.len(),
            snapshot.failures.len()
        );
        Ok(snapshot)
    }
}
