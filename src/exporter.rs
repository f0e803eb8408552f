use crate::collector::Collector;
use crate::data::Snapshot;
use prometheus::core::{Collector as PromCollector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const NAMESPACE: &str = "nvidia_gpu";
const DEVICE_LABELS: &[&str] = &["minor_number", "uuid", "name"];
const PROCESS_LABELS: &[&str] = &["minor_number", "pod_name", "container", "namespace"];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("metric registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("exposition is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

fn gauge(name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec, prometheus::Error> {
    GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
}

/// Prometheus view of the collector. Every scrape runs a fresh pass.
pub struct GpuExporter {
    collector: Arc<Collector>,
    // Held across reset, fill and collect so concurrent scrapes don't mix
    publish: Mutex<()>,

    num_devices: Gauge,
    scrape_error: Gauge,
    unit_failures: Gauge,

    used_memory: GaugeVec,
    total_memory: GaugeVec,
    duty_cycle: GaugeVec,
    power_usage: GaugeVec,
    temperature: GaugeVec,
    fan_speed: GaugeVec,
    encoder_util: GaugeVec,
    decoder_util: GaugeVec,

    p_used_memory: GaugeVec,
    p_dec_util: GaugeVec,
    p_enc_util: GaugeVec,
    p_mem_util: GaugeVec,
    p_sm_util: GaugeVec,
}

impl GpuExporter {
    pub fn new(collector: Arc<Collector>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            collector,
            publish: Mutex::new(()),
            num_devices: gauge("num_devices", "Number of GPU devices")?,
            scrape_error: gauge(
                "scrape_error",
                "1 if the last scrape could not enumerate GPU devices, 0 otherwise",
            )?,
            unit_failures: gauge(
                "scrape_unit_failures",
                "Devices, fields and processes skipped during the last scrape",
            )?,
            used_memory: gauge_vec(
                "memory_used_bytes",
                "Memory used by the GPU device in bytes",
                DEVICE_LABELS,
            )?,
            total_memory: gauge_vec(
                "memory_total_bytes",
                "Total memory of the GPU device in bytes",
                DEVICE_LABELS,
            )?,
            duty_cycle: gauge_vec(
                "duty_cycle",
                "Percent of time over the past sample period during which one or more kernels were executing on the GPU device",
                DEVICE_LABELS,
            )?,
            power_usage: gauge_vec(
                "power_usage_milliwatts",
                "Power usage of the GPU device in milliwatts",
                DEVICE_LABELS,
            )?,
            temperature: gauge_vec(
                "temperature_celsius",
                "Temperature of the GPU device in celsius",
                DEVICE_LABELS,
            )?,
            fan_speed: gauge_vec(
                "fanspeed_percent",
                "Fanspeed of the GPU device as a percent of its maximum",
                DEVICE_LABELS,
            )?,
            encoder_util: gauge_vec(
                "encoder_utilization_percent",
                "Utilization of the GPU video encoder in percent",
                DEVICE_LABELS,
            )?,
            decoder_util: gauge_vec(
                "decoder_utilization_percent",
                "Utilization of the GPU video decoder in percent",
                DEVICE_LABELS,
            )?,
            p_used_memory: gauge_vec(
                "process_memory_used_bytes",
                "GPU memory used by a workload process in bytes",
                PROCESS_LABELS,
            )?,
            p_dec_util: gauge_vec(
                "process_decoder_utilization_percent",
                "Video decoder utilization of a workload process in percent",
                PROCESS_LABELS,
            )?,
            p_enc_util: gauge_vec(
                "process_encoder_utilization_percent",
                "Video encoder utilization of a workload process in percent",
                PROCESS_LABELS,
            )?,
            p_mem_util: gauge_vec(
                "process_memory_utilization_percent",
                "Memory controller utilization of a workload process in percent",
                PROCESS_LABELS,
            )?,
            p_sm_util: gauge_vec(
                "process_sm_utilization_percent",
                "Streaming multiprocessor utilization of a workload process in percent",
                PROCESS_LABELS,
            )?,
        })
    }

    fn gauges(&self) -> [&Gauge; 3] {
        [&self.num_devices, &self.scrape_error, &self.unit_failures]
    }

    fn vecs(&self) -> [&GaugeVec; 13] {
        [
            &self.used_memory,
            &self.total_memory,
            &self.duty_cycle,
            &self.power_usage,
            &self.temperature,
            &self.fan_speed,
            &self.encoder_util,
            &self.decoder_util,
            &self.p_used_memory,
            &self.p_dec_util,
            &self.p_enc_util,
            &self.p_mem_util,
            &self.p_sm_util,
        ]
    }

    fn fill(&self, snapshot: &Snapshot) {
        for report in &snapshot.devices {
            let minor = report.device.minor_number.to_string();
            let labels: [&str; 3] = [&minor, &report.device.uuid, &report.device.name];
            let sample = &report.sample;

            self.total_memory
                .with_label_values(&labels)
                .set(report.device.total_memory_bytes as f64);

            let fields = [
                (&self.used_memory, sample.used_memory_bytes.map(|v| v as f64)),
                (&self.duty_cycle, sample.duty_cycle_percent.map(f64::from)),
                (&self.power_usage, sample.power_milliwatts.map(f64::from)),
                (&self.temperature, sample.temperature_celsius.map(f64::from)),
                (&self.fan_speed, sample.fan_speed_percent.map(f64::from)),
                (&self.encoder_util, sample.encoder_util_percent.map(f64::from)),
                (&self.decoder_util, sample.decoder_util_percent.map(f64::from)),
            ];
            for (vec, value) in fields {
                if let Some(value) = value {
                    vec.with_label_values(&labels).set(value);
                }
            }
        }

        // Several pids of one pod on one device share a label set; their
        // values are summed into it. The vectors were reset, so each series
        // starts from zero.
        for report in &snapshot.processes {
            let minor = report.device.minor_number.to_string();
            let id = &report.identity;
            let labels: [&str; 4] = [&minor, &id.pod, &id.container, &id.namespace];
            let p = &report.process;

            self.p_used_memory
                .with_label_values(&labels)
                .add(p.used_memory_bytes as f64);
            self.p_dec_util
                .with_label_values(&labels)
                .add(f64::from(p.dec_util_percent));
            self.p_enc_util
                .with_label_values(&labels)
                .add(f64::from(p.enc_util_percent));
            self.p_mem_util
                .with_label_values(&labels)
                .add(f64::from(p.mem_util_percent));
            self.p_sm_util
                .with_label_values(&labels)
                .add(f64::from(p.sm_util_percent));
        }
    }
}

impl PromCollector for GpuExporter {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs: Vec<&Desc> = self.gauges().into_iter().flat_map(|g| g.desc()).collect();
        descs.extend(self.vecs().into_iter().flat_map(|v| v.desc()));
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        for vec in self.vecs() {
            vec.reset();
        }

        let mut families = Vec::new();
        match self.collector.collect() {
            Ok(snapshot) => {
                self.scrape_error.set(0.0);
                self.unit_failures.set(snapshot.failures.len() as f64);
                self.num_devices.set(f64::from(snapshot.num_devices));
                families.extend(self.num_devices.collect());
                self.fill(&snapshot);
            }
            // num_devices is left out so an outage never reads as zero GPUs
            Err(_) => {
                self.scrape_error.set(1.0);
                self.unit_failures.set(0.0);
            }
        }

        families.extend(self.scrape_error.collect());
        families.extend(self.unit_failures.collect());
        for vec in self.vecs() {
            families.extend(vec.collect());
        }
        families
    }
}

/// Registry holding the GPU exporter.
pub fn registry(collector: Arc<Collector>) -> Result<Registry, ExportError> {
    let registry = Registry::new();
    registry.register(Box::new(GpuExporter::new(collector)?))?;
    Ok(registry)
}

/// Gathers the registry and encodes it in the text exposition format.
pub fn render(registry: &Registry) -> Result<String, ExportError> {
    let families = registry.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorConfig;
    use crate::fake::{mem, util, FakeBackend, FakeDevice, FakeFan, FakeProcessTable};
    use crate::identity::ProcessNameResolver;

    fn render_once(backend: FakeBackend, table: FakeProcessTable) -> String {
        let collector = Collector::new(
            Box::new(backend),
            Box::new(ProcessNameResolver::new(table)),
            CollectorConfig::default(),
        );
        let registry = registry(Arc::new(collector)).unwrap();
        render(&registry).unwrap()
    }

    fn line<'a>(text: &'a str, metric: &str, needle: &str) -> Option<&'a str> {
        text.lines()
            .find(|l| l.starts_with(metric) && l.contains(needle) && !l.starts_with('#'))
    }

    #[test]
    fn exposes_device_and_process_metrics() {
        let device = FakeDevice::new(0).with_processes(
            vec![mem(10, 2048)],
            vec![util(10, 1, 2, 3, 77)],
        );
        let text = render_once(
            FakeBackend::new(vec![device]),
            FakeProcessTable::new([(10, "trainer@ml/job-0 ")]),
        );

        assert!(text.contains("nvidia_gpu_num_devices 1"));
        assert!(text.contains("nvidia_gpu_scrape_error 0"));

        let used = line(&text, "nvidia_gpu_memory_used_bytes{", "uuid=\"GPU-00000000\"").unwrap();
        assert!(used.contains("name=\"Tesla T4\""));
        assert!(used.contains("minor_number=\"0\""));
        assert!(used.ends_with(" 1073741824"));

        let power = line(&text, "nvidia_gpu_power_usage_milliwatts{", "GPU-00000000").unwrap();
        assert!(power.ends_with(" 70000"));

        let sm = line(&text, "nvidia_gpu_process_sm_utilization_percent{", "job-0").unwrap();
        assert!(sm.contains("pod_name=\"job-0\""));
        assert!(sm.contains("container=\"trainer\""));
        assert!(sm.contains("namespace=\"ml\""));
        assert!(sm.ends_with(" 77"));

        let pmem = line(&text, "nvidia_gpu_process_memory_used_bytes{", "job-0").unwrap();
        assert!(pmem.ends_with(" 2048"));
    }

    #[test]
    fn omitted_fields_produce_no_series() {
        let mut device = FakeDevice::new(0);
        device.fan = FakeFan::Unsupported;
        device.temperature = None;
        let text = render_once(FakeBackend::new(vec![device]), FakeProcessTable::default());

        assert!(line(&text, "nvidia_gpu_fanspeed_percent{", "GPU").is_none());
        assert!(line(&text, "nvidia_gpu_temperature_celsius{", "GPU").is_none());
        assert!(line(&text, "nvidia_gpu_duty_cycle{", "GPU").is_some());
        assert!(text.contains("nvidia_gpu_scrape_unit_failures 1"));
    }

    #[test]
    fn enumeration_failure_hides_device_count() {
        let text = render_once(FakeBackend::failing_count(), FakeProcessTable::default());

        assert!(text.contains("nvidia_gpu_scrape_error 1"));
        assert!(!text.contains("nvidia_gpu_num_devices "));
        assert!(line(&text, "nvidia_gpu_memory_total_bytes{", "GPU").is_none());
    }

    #[test]
    fn series_from_a_previous_scrape_are_dropped() {
        let table = FakeProcessTable::new([(10, "a@ns/first ")]);
        let device = FakeDevice::new(0).with_processes(vec![mem(10, 1)], Vec::new());
        let collector = Collector::new(
            Box::new(FakeBackend::new(vec![device])),
            Box::new(ProcessNameResolver::new(table.clone())),
            CollectorConfig::default(),
        );
        let registry = registry(Arc::new(collector)).unwrap();

        let first = render(&registry).unwrap();
        assert!(first.contains("pod_name=\"first\""));

        // pid 10 recycled by another workload
        table.set(10, "b@ns/second ");
        let second = render(&registry).unwrap();
        assert!(second.contains("pod_name=\"second\""));
        assert!(!second.contains("pod_name=\"first\""));
    }

    #[test]
    fn pids_sharing_a_workload_are_summed() {
        let device = FakeDevice::new(0).with_processes(
            vec![mem(10, 1000), mem(11, 24)],
            vec![util(10, 0, 0, 5, 30), util(11, 0, 0, 1, 12)],
        );
        let text = render_once(
            FakeBackend::new(vec![device]),
            FakeProcessTable::new([(10, "app@ns/pod-a "), (11, "app@ns/pod-a ")]),
        );

        let series: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("nvidia_gpu_process_memory_used_bytes{"))
            .collect();
        assert_eq!(series.len(), 1);
        assert!(series[0].ends_with(" 1024"));

        let sm = line(&text, "nvidia_gpu_process_sm_utilization_percent{", "pod-a").unwrap();
        assert!(sm.ends_with(" 42"));
        let mem_util =
            line(&text, "nvidia_gpu_process_memory_utilization_percent{", "pod-a").unwrap();
        assert!(mem_util.ends_with(" 6"));
    }
}
