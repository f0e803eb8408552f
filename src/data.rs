use serde::Serialize;

// Device identity and static attributes, re-read every pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Device {
    pub index: u32,
    pub minor_number: u32,
    pub uuid: String,
    pub name: String,
    pub total_memory_bytes: u64,
}

// Dynamic device status; a field is None when its read failed or is disabled
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSample {
    pub used_memory_bytes: Option<u64>,
    pub duty_cycle_percent: Option<u32>,
    pub power_milliwatts: Option<u32>,
    pub temperature_celsius: Option<u32>,
    pub encoder_util_percent: Option<u32>,
    pub decoder_util_percent: Option<u32>,
    pub fan_speed_percent: Option<u32>,
}

// One entry of the graphics-process memory accounting list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessMemoryRecord {
    pub pid: u32,
    pub used_memory_bytes: u64,
}

// One entry of the process utilization accounting list; pid 0 is a sentinel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessUtilizationRecord {
    pub pid: u32,
    pub dec_util_percent: u32,
    pub enc_util_percent: u32,
    pub mem_util_percent: u32,
    pub sm_util_percent: u32,
}

// Memory record joined with its utilization record (zeros if none matched)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MergedProcessRecord {
    pub pid: u32,
    pub used_memory_bytes: u64,
    pub dec_util_percent: u32,
    pub enc_util_percent: u32,
    pub mem_util_percent: u32,
    pub sm_util_percent: u32,
}

impl From<ProcessMemoryRecord> for MergedProcessRecord {
    fn from(record: ProcessMemoryRecord) -> Self {
        Self {
            pid: record.pid,
            used_memory_bytes: record.used_memory_bytes,
            dec_util_percent: 0,
            enc_util_percent: 0,
            mem_util_percent: 0,
            sm_util_percent: 0,
        }
    }
}

impl MergedProcessRecord {
    pub fn apply_utilization(&mut self, util: &ProcessUtilizationRecord) {
        self.dec_util_percent = util.dec_util_percent;
        self.enc_util_percent = util.enc_util_percent;
        self.mem_util_percent = util.mem_util_percent;
        self.sm_util_percent = util.sm_util_percent;
    }
}

// Pod/container/namespace triple a process belongs to
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkloadIdentity {
    pub container: String,
    pub namespace: String,
    pub pod: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub device: Device,
    pub sample: DeviceSample,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub device: Device,
    pub process: MergedProcessRecord,
    pub identity: WorkloadIdentity,
}

/// A failure attached to a single unit of a pass. None of these abort the
/// pass; they are logged and recorded so callers can see what was skipped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum UnitFailure {
    Device { index: u32, error: String },
    DeviceField { index: u32, field: &'static str, error: String },
    Processes { index: u32, error: String },
    Process { index: u32, pid: u32, error: String },
}

// Result of one collection pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub num_devices: u32,
    pub devices: Vec<DeviceReport>,
    pub processes: Vec<ProcessReport>,
    pub failures: Vec<UnitFailure>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }
}
