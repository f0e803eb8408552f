use crate::data::{ProcessMemoryRecord, ProcessUtilizationRecord};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("NVML call failed: {0}")]
    Nvml(#[source] NvmlError),
    #[error("{what} is not supported on this device")]
    Unsupported { what: &'static str },
    #[error("Device not found at index {0}")]
    DeviceNotFound(u32),
}

impl From<NvmlError> for MonitorError {
    fn from(err: NvmlError) -> Self {
        match err {
            NvmlError::NotSupported => MonitorError::Unsupported { what: "operation" },
            other => MonitorError::Nvml(other),
        }
    }
}

impl MonitorError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, MonitorError::Unsupported { .. })
    }

    fn unsupported_as(self, what: &'static str) -> Self {
        match self {
            MonitorError::Unsupported { .. } => MonitorError::Unsupported { what },
            other => other,
        }
    }
}

/// Entry point into the hardware management layer.
///
/// Every call may fail independently. Implementations are not assumed to be
/// safe for concurrent passes; the collector serializes access.
pub trait GpuBackend: Send + Sync {
    fn device_count(&self) -> Result<u32, MonitorError>;
    fn device(&self, index: u32) -> Result<Box<dyn GpuDevice + '_>, MonitorError>;
}

/// Handle to one device, valid for the duration of a pass.
pub trait GpuDevice {
    fn minor_number(&self) -> Result<u32, MonitorError>;
    fn uuid(&self) -> Result<String, MonitorError>;
    fn name(&self) -> Result<String, MonitorError>;
    fn total_memory(&self) -> Result<u64, MonitorError>;

    fn used_memory(&self) -> Result<u64, MonitorError>;
    /// Percent of the last sample period during which a kernel was running.
    fn duty_cycle(&self) -> Result<u32, MonitorError>;
    fn power_usage(&self) -> Result<u32, MonitorError>;
    fn temperature(&self) -> Result<u32, MonitorError>;
    fn encoder_utilization(&self) -> Result<u32, MonitorError>;
    fn decoder_utilization(&self) -> Result<u32, MonitorError>;
    fn fan_speed(&self) -> Result<u32, MonitorError>;

    fn graphics_processes(&self) -> Result<Vec<ProcessMemoryRecord>, MonitorError>;
    fn process_utilization(&self) -> Result<Vec<ProcessUtilizationRecord>, MonitorError>;
}

pub struct NvmlMonitor {
    nvml: Nvml,
}

impl NvmlMonitor {
    pub fn init() -> Result<Self, MonitorError> {
        let nvml = Nvml::init()?;
        Ok(Self { nvml })
    }

    pub fn driver_version(&self) -> Result<String, MonitorError> {
        Ok(self.nvml.sys_driver_version()?)
    }
}

impl GpuBackend for NvmlMonitor {
    fn device_count(&self) -> Result<u32, MonitorError> {
        Ok(self.nvml.device_count()?)
    }

    fn device(&self, index: u32) -> Result<Box<dyn GpuDevice + '_>, MonitorError> {
        match self.nvml.device_by_index(index) {
            Ok(device) => Ok(Box::new(NvmlDevice { device })),
            Err(NvmlError::InvalidArg) => Err(MonitorError::DeviceNotFound(index)),
            Err(err) => Err(err.into()),
        }
    }
}

struct NvmlDevice<'nvml> {
    device: Device<'nvml>,
}

impl GpuDevice for NvmlDevice<'_> {
    fn minor_number(&self) -> Result<u32, MonitorError> {
        Ok(self.device.minor_number()?)
    }

    fn uuid(&self) -> Result<String, MonitorError> {
        Ok(self.device.uuid()?)
    }

    fn name(&self) -> Result<String, MonitorError> {
        Ok(self.device.name()?)
    }

    fn total_memory(&self) -> Result<u64, MonitorError> {
        Ok(self.device.memory_info()?.total)
    }

    fn used_memory(&self) -> Result<u64, MonitorError> {
        Ok(self.device.memory_info()?.used)
    }

    fn duty_cycle(&self) -> Result<u32, MonitorError> {
        Ok(self.device.utilization_rates()?.gpu)
    }

    fn power_usage(&self) -> Result<u32, MonitorError> {
        Ok(self.device.power_usage()?)
    }

    fn temperature(&self) -> Result<u32, MonitorError> {
        Ok(self.device.temperature(TemperatureSensor::Gpu)?)
    }

    fn encoder_utilization(&self) -> Result<u32, MonitorError> {
        self.device
            .encoder_utilization()
            .map(|info| info.utilization)
            .map_err(|e| MonitorError::from(e).unsupported_as("encoder utilization"))
    }

    fn decoder_utilization(&self) -> Result<u32, MonitorError> {
        self.device
            .decoder_utilization()
            .map(|info| info.utilization)
            .map_err(|e| MonitorError::from(e).unsupported_as("decoder utilization"))
    }

    fn fan_speed(&self) -> Result<u32, MonitorError> {
        self.device
            .fan_speed(0)
            .map_err(|e| MonitorError::from(e).unsupported_as("fan speed"))
    }

    fn graphics_processes(&self) -> Result<Vec<ProcessMemoryRecord>, MonitorError> {
        let procs = self.device.running_graphics_processes()?;
        Ok(procs
            .into_iter()
            .map(|proc| ProcessMemoryRecord {
                pid: proc.pid,
                used_memory_bytes: match proc.used_gpu_memory {
                    UsedGpuMemory::Used(v) => v,
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect())
    }

    fn process_utilization(&self) -> Result<Vec<ProcessUtilizationRecord>, MonitorError> {
        let samples = match self.device.process_utilization_stats(None::<u64>) {
            Ok(samples) => samples,
            // No process has been sampled since the buffer was last drained
            Err(NvmlError::NotFound) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        Ok(newest_per_pid(samples.into_iter().map(|sample| {
            (
                sample.timestamp,
                ProcessUtilizationRecord {
                    pid: sample.pid,
                    dec_util_percent: sample.dec_util,
                    enc_util_percent: sample.enc_util,
                    mem_util_percent: sample.mem_util,
                    sm_util_percent: sample.sm_util,
                },
            )
        })))
    }
}

/// Reduces timestamped samples to the newest one per pid, ordered by pid.
///
/// The driver buffer holds several samples per pid in no guaranteed order.
/// On equal timestamps the sample seen later wins.
fn newest_per_pid(
    samples: impl IntoIterator<Item = (u64, ProcessUtilizationRecord)>,
) -> Vec<ProcessUtilizationRecord> {
    let mut newest: HashMap<u32, (u64, ProcessUtilizationRecord)> = HashMap::new();
    for (timestamp, record) in samples {
        match newest.get(&record.pid) {
            Some((ts, _)) if *ts > timestamp => {}
            _ => {
                newest.insert(record.pid, (timestamp, record));
            }
        }
    }

    let mut records: Vec<ProcessUtilizationRecord> =
        newest.into_values().map(|(_, record)| record).collect();
    records.sort_by_key(|r| r.pid);
    records
}
