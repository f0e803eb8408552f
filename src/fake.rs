//! Scripted capability layer and process table for tests.

use crate::data::{ProcessMemoryRecord, ProcessUtilizationRecord};
use crate::identity::ProcessTable;
use crate::monitor::{GpuBackend, GpuDevice, MonitorError};
use nvml_wrapper::error::NvmlError;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug)]
pub enum FakeFan {
    Speed(u32),
    Unsupported,
    Broken,
}

/// One scripted device. `None` in an optional field makes that read fail.
#[derive(Clone, Debug)]
pub struct FakeDevice {
    pub handle_fails: bool,
    pub minor_number: Option<u32>,
    pub uuid: String,
    pub name: String,
    pub total_memory: u64,
    pub used_memory: Option<u64>,
    pub duty_cycle: Option<u32>,
    pub power_usage: Option<u32>,
    pub temperature: Option<u32>,
    pub encoder: Option<u32>,
    pub decoder: Option<u32>,
    pub fan: FakeFan,
    pub graphics: Option<Vec<ProcessMemoryRecord>>,
    pub utilization: Option<Vec<ProcessUtilizationRecord>>,
}

impl FakeDevice {
    pub fn new(minor: u32) -> Self {
        Self {
            handle_fails: false,
            minor_number: Some(minor),
            uuid: format!("GPU-0000000{minor}"),
            name: "Tesla T4".to_string(),
            total_memory: 16 * 1024 * 1024 * 1024,
            used_memory: Some(1024 * 1024 * 1024),
            duty_cycle: Some(35),
            power_usage: Some(70_000),
            temperature: Some(55),
            encoder: Some(3),
            decoder: Some(4),
            fan: FakeFan::Speed(40),
            graphics: Some(Vec::new()),
            utilization: Some(Vec::new()),
        }
    }

    pub fn broken_handle() -> Self {
        Self {
            handle_fails: true,
            ..Self::new(u32::MAX)
        }
    }

    pub fn with_processes(
        mut self,
        graphics: Vec<ProcessMemoryRecord>,
        utilization: Vec<ProcessUtilizationRecord>,
    ) -> Self {
        self.graphics = Some(graphics);
        self.utilization = Some(utilization);
        self
    }
}

#[derive(Debug, Default)]
pub struct CallCounts {
    pub device_count: AtomicUsize,
    pub device: AtomicUsize,
    pub fan_speed: AtomicUsize,
    pub graphics_processes: AtomicUsize,
    pub process_utilization: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeBackend {
    /// `None` makes `device_count` fail; otherwise the reported count.
    pub count: Option<u32>,
    pub devices: Vec<FakeDevice>,
    pub calls: Arc<CallCounts>,
}

impl FakeBackend {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        Self {
            count: Some(devices.len() as u32),
            devices,
            calls: Arc::new(CallCounts::default()),
        }
    }

    pub fn failing_count() -> Self {
        Self {
            count: None,
            ..Self::new(vec![FakeDevice::new(0)])
        }
    }
}

fn query_failed() -> MonitorError {
    MonitorError::Nvml(NvmlError::Unknown)
}

impl GpuBackend for FakeBackend {
    fn device_count(&self) -> Result<u32, MonitorError> {
        self.calls.device_count.fetch_add(1, Ordering::SeqCst);
        self.count.ok_or_else(query_failed)
    }

    fn device(&self, index: u32) -> Result<Box<dyn GpuDevice + '_>, MonitorError> {
        self.calls.device.fetch_add(1, Ordering::SeqCst);
        match self.devices.get(index as usize) {
            Some(script) if !script.handle_fails => Ok(Box::new(FakeHandle {
                script,
                calls: &self.calls,
            })),
            Some(_) => Err(query_failed()),
            None => Err(MonitorError::DeviceNotFound(index)),
        }
    }
}

struct FakeHandle<'a> {
    script: &'a FakeDevice,
    calls: &'a CallCounts,
}

impl GpuDevice for FakeHandle<'_> {
    fn minor_number(&self) -> Result<u32, MonitorError> {
        self.script.minor_number.ok_or_else(query_failed)
    }

    fn uuid(&self) -> Result<String, MonitorError> {
        Ok(self.script.uuid.clone())
    }

    fn name(&self) -> Result<String, MonitorError> {
        Ok(self.script.name.clone())
    }

    fn total_memory(&self) -> Result<u64, MonitorError> {
        Ok(self.script.total_memory)
    }

    fn used_memory(&self) -> Result<u64, MonitorError> {
        self.script.used_memory.ok_or_else(query_failed)
    }

    fn duty_cycle(&self) -> Result<u32, MonitorError> {
        self.script.duty_cycle.ok_or_else(query_failed)
    }

    fn power_usage(&self) -> Result<u32, MonitorError> {
        self.script.power_usage.ok_or_else(query_failed)
    }

    fn temperature(&self) -> Result<u32, MonitorError> {
        self.script.temperature.ok_or_else(query_failed)
    }

    fn encoder_utilization(&self) -> Result<u32, MonitorError> {
        self.script.encoder.ok_or_else(query_failed)
    }

    fn decoder_utilization(&self) -> Result<u32, MonitorError> {
        self.script.decoder.ok_or_else(query_failed)
    }

    fn fan_speed(&self) -> Result<u32, MonitorError> {
        self.calls.fan_speed.fetch_add(1, Ordering::SeqCst);
        match self.script.fan {
            FakeFan::Speed(v) => Ok(v),
            FakeFan::Unsupported => Err(MonitorError::Unsupported { what: "fan speed" }),
            FakeFan::Broken => Err(query_failed()),
        }
    }

    fn graphics_processes(&self) -> Result<Vec<ProcessMemoryRecord>, MonitorError> {
        self.calls.graphics_processes.fetch_add(1, Ordering::SeqCst);
        self.script.graphics.clone().ok_or_else(query_failed)
    }

    fn process_utilization(&self) -> Result<Vec<ProcessUtilizationRecord>, MonitorError> {
        self.calls.process_utilization.fetch_add(1, Ordering::SeqCst);
        self.script.utilization.clone().ok_or_else(query_failed)
    }
}

/// In-memory process table; clones share the same entries.
#[derive(Clone, Default)]
pub struct FakeProcessTable {
    names: Arc<Mutex<HashMap<u32, String>>>,
}

impl FakeProcessTable {
    pub fn new<'a>(entries: impl IntoIterator<Item = (u32, &'a str)>) -> Self {
        let names = entries
            .into_iter()
            .map(|(pid, name)| (pid, name.to_string()))
            .collect();
        Self {
            names: Arc::new(Mutex::new(names)),
        }
    }

    pub fn set(&self, pid: u32, name: &str) {
        self.names.lock().unwrap().insert(pid, name.to_string());
    }
}

impl ProcessTable for FakeProcessTable {
    fn process_name(&self, pid: u32) -> io::Result<String> {
        self.names
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("pid {pid}")))
    }
}

pub fn mem(pid: u32, used_memory_bytes: u64) -> ProcessMemoryRecord {
    ProcessMemoryRecord {
        pid,
        used_memory_bytes,
    }
}

pub fn util(pid: u32, dec: u32, enc: u32, mem: u32, sm: u32) -> ProcessUtilizationRecord {
    ProcessUtilizationRecord {
        pid,
        dec_util_percent: dec,
        enc_util_percent: enc,
        mem_util_percent: mem,
        sm_util_percent: sm,
    }
}
