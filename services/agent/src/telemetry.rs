//! Hardware telemetry pump.
//!
//! Reads sysfs/procfs directly — no external helper daemons.  Paths are
//! resolved once per collector (hwmon ordering is stable per boot) and the
//! first sample is discarded because CPU usage needs two /proc/stat points.
//!
//! Collection happens on the blocking pool; the async side only paces ticks
//! and pushes `telemetry_data` frames through the writer queue.

use crate::server::Outbound;
use cd_protocol::{
    BatteryMetrics, CpuMetrics, FanMetrics, GpuMetrics, MemoryMetrics, PowerMetrics,
    TelemetrySample,
};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

pub struct TelemetryPump {
    handle: Option<JoinHandle<()>>,
    cancel: Option<watch::Sender<bool>>,
    interval_secs: u64,
    outbound: Option<Outbound>,
    sysfs_root: PathBuf,
}

impl Default for TelemetryPump {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryPump {
    pub fn new() -> Self {
        Self::with_sysfs_root(PathBuf::from("/"))
    }

    /// Collector rooted somewhere other than `/`, for tests.
    pub fn with_sysfs_root(root: PathBuf) -> Self {
        Self {
            handle: None,
            cancel: None,
            interval_secs: 2,
            outbound: None,
            sysfs_root: root,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    /// Start the sampling loop.  No-op when already running.
    pub fn start(&mut self, interval_secs: u64, outbound: Outbound) {
        if self.is_running() {
            return;
        }
        let interval = interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        self.interval_secs = interval;
        self.outbound = Some(outbound.clone());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancel = Some(cancel_tx);
        let root = self.sysfs_root.clone();
        self.handle = Some(tokio::spawn(run_loop(root, interval, outbound, cancel_rx)));
        info!(interval, "telemetry pump started");
    }

    /// Stop the loop.  After this returns the send callback is never
    /// invoked again.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!("telemetry pump stopped");
        }
        self.outbound = None;
    }

    /// Restart with a new interval, preserving the send path.
    pub async fn update_interval(&mut self, interval_secs: u64) {
        self.interval_secs = interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        if !self.is_running() {
            return;
        }
        let outbound = match self.outbound.clone() {
            Some(o) => o,
            None => return,
        };
        self.stop().await;
        self.start(self.interval_secs, outbound);
    }
}

async fn run_loop(
    root: PathBuf,
    interval_secs: u64,
    outbound: Outbound,
    mut cancel: watch::Receiver<bool>,
) {
    let mut collector = SysfsCollector::with_root(root);
    let mut primed = false;
    loop {
        let joined = tokio::task::spawn_blocking(move || {
            let sample = collector.collect();
            (collector, sample)
        })
        .await;
        let sample = match joined {
            Ok((c, sample)) => {
                collector = c;
                sample
            }
            Err(e) => {
                error!(error = %e, "telemetry collection task failed");
                break;
            }
        };

        if primed {
            outbound.send_event("telemetry_data", &sample).await;
        } else {
            // First tick: CPU delta not yet valid.
            primed = true;
        }

        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            () = tokio::time::sleep(std::time::Duration::from_secs(interval_secs)) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Sysfs collector
// ---------------------------------------------------------------------------

/// Collects hardware metrics from sysfs/procfs.
///
/// Missing hardware never errors — the matching section is simply absent
/// from the sample.
pub struct SysfsCollector {
    root: PathBuf,

    prev_idle: u64,
    prev_total: u64,

    cpu_temp_path: Option<PathBuf>,
    gpu_busy_path: Option<PathBuf>,
    gpu_temp_path: Option<PathBuf>,
    gpu_freq_path: Option<PathBuf>,
    gpu_mem_freq_path: Option<PathBuf>,
    vram_used_path: Option<PathBuf>,
    vram_total_path: Option<PathBuf>,
    power_cap_path: Option<PathBuf>,
    power_avg_path: Option<PathBuf>,
    fan_path: Option<PathBuf>,
    paths_resolved: bool,
}

impl SysfsCollector {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/"))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            prev_idle: 0,
            prev_total: 0,
            cpu_temp_path: None,
            gpu_busy_path: None,
            gpu_temp_path: None,
            gpu_freq_path: None,
            gpu_mem_freq_path: None,
            vram_used_path: None,
            vram_total_path: None,
            power_cap_path: None,
            power_avg_path: None,
            fan_path: None,
            paths_resolved: false,
        }
    }

    /// Build one sample, carrying only the sections that produced data.
    pub fn collect(&mut self) -> TelemetrySample {
        self.resolve_paths();
        TelemetrySample {
            timestamp: chrono::Utc::now().timestamp_millis(),
            cpu: self.read_cpu(),
            gpu: self.read_gpu(),
            memory: self.read_memory(),
            battery: self.read_battery(),
            power: self.read_power(),
            fan: self.read_fan(),
        }
    }

    /// Resolve hwmon/drm paths once.  Ordering is stable per boot.
    fn resolve_paths(&mut self) {
        if self.paths_resolved {
            return;
        }

        for hwmon in list_dir(&self.root.join("sys/class/hwmon"), "hwmon") {
            let name = read_trimmed(&hwmon.join("name")).unwrap_or_default();
            // CPU temperature: k10temp (AMD) or coretemp (Intel).
            if name == "k10temp" || name == "coretemp" {
                self.cpu_temp_path = Some(hwmon.join("temp1_input"));
            }

            let fan = hwmon.join("fan1_input");
            if fan.exists() {
                self.fan_path = Some(fan);
            }

            let cap = hwmon.join("power1_cap");
            if cap.exists() {
                self.power_cap_path = Some(cap);
            }
            let avg = hwmon.join("power1_average");
            let input = hwmon.join("power1_input");
            if avg.exists() {
                self.power_avg_path = Some(avg);
            } else if input.exists() && self.power_avg_path.is_none() {
                self.power_avg_path = Some(input);
            }
        }

        // GPU paths (amdgpu exposes gpu_busy_percent on the card device).
        for card in list_dir(&self.root.join("sys/class/drm"), "card") {
            let device = card.join("device");
            let busy = device.join("gpu_busy_percent");
            if !busy.exists() {
                continue;
            }
            self.gpu_busy_path = Some(busy);
            for hwmon in list_dir(&device.join("hwmon"), "hwmon") {
                let temp = hwmon.join("temp1_input");
                if temp.exists() {
                    self.gpu_temp_path = Some(temp);
                    break;
                }
            }
            let sclk = device.join("pp_dpm_sclk");
            if sclk.exists() {
                self.gpu_freq_path = Some(sclk);
            }
            let mclk = device.join("pp_dpm_mclk");
            if mclk.exists() {
                self.gpu_mem_freq_path = Some(mclk);
            }
            let vram_total = device.join("mem_info_vram_total");
            if vram_total.exists() {
                self.vram_total_path = Some(vram_total);
            }
            let vram_used = device.join("mem_info_vram_used");
            if vram_used.exists() {
                self.vram_used_path = Some(vram_used);
            }
            break;
        }

        self.paths_resolved = true;
    }

    fn read_cpu(&mut self) -> Option<CpuMetrics> {
        let mut metrics = CpuMetrics::default();

        // Usage from /proc/stat, delta-based.
        if let Some(line) = read_file(&self.root.join("proc/stat"))
            .and_then(|c| c.lines().next().map(str::to_owned))
        {
            let values: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .filter_map(|v| v.parse().ok())
                .collect();
            if values.len() >= 4 {
                let idle = values[3];
                let total: u64 = values.iter().sum();
                if self.prev_total > 0 {
                    let d_idle = idle.saturating_sub(self.prev_idle);
                    let d_total = total.saturating_sub(self.prev_total);
                    if d_total > 0 {
                        let usage = (1.0 - d_idle as f64 / d_total as f64) * 100.0;
                        metrics.usage_percent = Some(round1(usage));
                    }
                }
                self.prev_idle = idle;
                self.prev_total = total;
            }
        }

        if let Some(path) = &self.cpu_temp_path {
            if let Some(v) = read_i64(path) {
                metrics.temp_celsius = Some(round1(v as f64 / 1000.0));
            }
        }

        // Average frequency across all cores.
        let mut freqs = Vec::new();
        for cpu in list_dir(&self.root.join("sys/devices/system/cpu"), "cpu") {
            let path = cpu.join("cpufreq/scaling_cur_freq");
            if let Some(v) = read_i64(&path) {
                freqs.push(v);
            }
        }
        if !freqs.is_empty() {
            let avg = freqs.iter().sum::<i64>() as f64 / freqs.len() as f64;
            metrics.freq_mhz = Some((avg / 1000.0).round());
        }

        non_empty(metrics, |m| {
            m.usage_percent.is_some() || m.temp_celsius.is_some() || m.freq_mhz.is_some()
        })
    }

    fn read_gpu(&self) -> Option<GpuMetrics> {
        let mut metrics = GpuMetrics::default();

        if let Some(path) = &self.gpu_busy_path {
            if let Some(v) = read_i64(path) {
                metrics.usage_percent = Some(v as f64);
            }
        }
        if let Some(path) = &self.gpu_temp_path {
            if let Some(v) = read_i64(path) {
                metrics.temp_celsius = Some(round1(v as f64 / 1000.0));
            }
        }
        if let Some(path) = &self.gpu_freq_path {
            metrics.freq_mhz = read_dpm_freq(path);
        }
        if let Some(path) = &self.gpu_mem_freq_path {
            metrics.mem_freq_mhz = read_dpm_freq(path);
        }
        if let Some(path) = &self.vram_total_path {
            metrics.vram_total_bytes = read_i64(path).map(|v| v as u64);
            if let Some(path) = &self.vram_used_path {
                metrics.vram_used_bytes = read_i64(path).map(|v| v as u64);
            }
        }

        non_empty(metrics, |m| {
            m.usage_percent.is_some()
                || m.temp_celsius.is_some()
                || m.freq_mhz.is_some()
                || m.mem_freq_mhz.is_some()
                || m.vram_total_bytes.is_some()
        })
    }

    fn read_memory(&self) -> Option<MemoryMetrics> {
        let content = read_file(&self.root.join("proc/meminfo"))?;
        let mut total_kb = 0u64;
        let mut available_kb = 0u64;
        let mut swap_total_kb = 0u64;
        let mut swap_free_kb = 0u64;
        for line in content.lines() {
            let field = |l: &str| l.split_whitespace().nth(1).and_then(|v| v.parse().ok());
            if line.starts_with("MemTotal:") {
                total_kb = field(line).unwrap_or(0);
            } else if line.starts_with("MemAvailable:") {
                available_kb = field(line).unwrap_or(0);
            } else if line.starts_with("SwapTotal:") {
                swap_total_kb = field(line).unwrap_or(0);
            } else if line.starts_with("SwapFree:") {
                swap_free_kb = field(line).unwrap_or(0);
            }
        }
        if total_kb == 0 {
            return None;
        }
        let usage = (total_kb - available_kb) as f64 / total_kb as f64 * 100.0;
        Some(MemoryMetrics {
            total_bytes: total_kb * 1024,
            available_bytes: available_kb * 1024,
            usage_percent: round1(usage),
            swap_total_bytes: (swap_total_kb > 0).then_some(swap_total_kb * 1024),
            swap_free_bytes: (swap_total_kb > 0).then_some(swap_free_kb * 1024),
        })
    }

    fn read_battery(&self) -> Option<BatteryMetrics> {
        let bat = list_dir(&self.root.join("sys/class/power_supply"), "BAT")
            .into_iter()
            .next()?;
        let capacity = read_i64(&bat.join("capacity"))?;
        let status = read_trimmed(&bat.join("status")).unwrap_or_default();
        Some(BatteryMetrics { capacity, status })
    }

    fn read_power(&self) -> Option<PowerMetrics> {
        let mut metrics = PowerMetrics::default();
        if let Some(path) = &self.power_cap_path {
            if let Some(v) = read_i64(path) {
                metrics.tdp_watts = Some(round1(v as f64 / 1_000_000.0));
            }
        }
        if let Some(path) = &self.power_avg_path {
            if let Some(v) = read_i64(path) {
                metrics.power_watts = Some(round1(v as f64 / 1_000_000.0));
            }
        }
        non_empty(metrics, |m| {
            m.tdp_watts.is_some() || m.power_watts.is_some()
        })
    }

    fn read_fan(&self) -> Option<FanMetrics> {
        let path = self.fan_path.as_ref()?;
        read_i64(path).map(|rpm| FanMetrics { rpm })
    }
}

impl Default for SysfsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Read helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn read_trimmed(path: &Path) -> Option<String> {
    read_file(path).map(|s| s.trim().to_owned())
}

fn read_i64(path: &Path) -> Option<i64> {
    read_trimmed(path)?.parse().ok()
}

/// Directory entries whose name starts with `prefix`, sorted by name.
fn list_dir(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(prefix))
        })
        .map(|e| e.path())
        .collect();
    out.sort();
    out
}

/// Parse the active frequency from pp_dpm_sclk/pp_dpm_mclk.
///
/// The active level is marked with `*`; falls back to the last entry.
fn read_dpm_freq(path: &Path) -> Option<f64> {
    let content = read_file(path)?;
    let mut last_freq = None;
    for line in content.lines() {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let Some(_level) = parts.next() else {
            continue;
        };
        let Some(freq_str) = parts.next() else {
            continue;
        };
        let cleaned = freq_str.to_lowercase().replace("mhz", "");
        let Ok(freq) = cleaned.parse::<f64>() else {
            continue;
        };
        if line.contains('*') {
            return Some(freq);
        }
        last_freq = Some(freq);
    }
    last_freq
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn non_empty<T>(value: T, has_data: impl Fn(&T) -> bool) -> Option<T> {
    has_data(&value).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fake_sysfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "proc/stat",
            "cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 50 0 50 400 0 0 0 0 0 0\n",
        );
        write(
            root,
            "proc/meminfo",
            "MemTotal:       16000000 kB\nMemAvailable:   12000000 kB\nSwapTotal:       1000000 kB\nSwapFree:         900000 kB\n",
        );
        write(root, "sys/class/hwmon/hwmon0/name", "k10temp\n");
        write(root, "sys/class/hwmon/hwmon0/temp1_input", "45500\n");
        write(root, "sys/class/hwmon/hwmon1/name", "steamdeck_hwmon\n");
        write(root, "sys/class/hwmon/hwmon1/fan1_input", "2450\n");
        write(root, "sys/class/hwmon/hwmon1/power1_cap", "15000000\n");
        write(root, "sys/class/hwmon/hwmon1/power1_input", "8300000\n");
        write(root, "sys/class/drm/card0/device/gpu_busy_percent", "37\n");
        write(
            root,
            "sys/class/drm/card0/device/pp_dpm_sclk",
            "0: 200Mhz\n1: 1100Mhz *\n2: 1600Mhz\n",
        );
        write(
            root,
            "sys/class/drm/card0/device/pp_dpm_mclk",
            "0: 400Mhz\n1: 800Mhz\n",
        );
        write(
            root,
            "sys/class/drm/card0/device/mem_info_vram_total",
            "1073741824\n",
        );
        write(
            root,
            "sys/class/drm/card0/device/mem_info_vram_used",
            "536870912\n",
        );
        write(root, "sys/class/power_supply/BAT1/capacity", "83\n");
        write(root, "sys/class/power_supply/BAT1/status", "Discharging\n");
        dir
    }

    #[test]
    fn first_sample_has_no_cpu_usage_second_does() {
        let dir = fake_sysfs();
        let mut c = SysfsCollector::with_root(dir.path().to_path_buf());

        let first = c.collect();
        assert!(first.cpu.as_ref().unwrap().usage_percent.is_none());

        // Advance /proc/stat: +100 busy, +100 idle → 50% usage.
        write(
            dir.path(),
            "proc/stat",
            "cpu  150 0 150 900 0 0 0 0 0 0\n",
        );
        let second = c.collect();
        assert_eq!(second.cpu.unwrap().usage_percent, Some(50.0));
    }

    #[test]
    fn sections_carry_expected_fields() {
        let dir = fake_sysfs();
        let mut c = SysfsCollector::with_root(dir.path().to_path_buf());
        let sample = c.collect();

        let cpu = sample.cpu.unwrap();
        assert_eq!(cpu.temp_celsius, Some(45.5));

        let gpu = sample.gpu.unwrap();
        assert_eq!(gpu.usage_percent, Some(37.0));
        assert_eq!(gpu.freq_mhz, Some(1100.0), "starred dpm level wins");
        assert_eq!(gpu.mem_freq_mhz, Some(800.0), "no star falls back to last");
        assert_eq!(gpu.vram_total_bytes, Some(1_073_741_824));
        assert_eq!(gpu.vram_used_bytes, Some(536_870_912));

        let memory = sample.memory.unwrap();
        assert_eq!(memory.total_bytes, 16_000_000 * 1024);
        assert_eq!(memory.usage_percent, 25.0);
        assert_eq!(memory.swap_total_bytes, Some(1_000_000 * 1024));

        let battery = sample.battery.unwrap();
        assert_eq!(battery.capacity, 83);
        assert_eq!(battery.status, "Discharging");

        let power = sample.power.unwrap();
        assert_eq!(power.tdp_watts, Some(15.0));
        assert_eq!(power.power_watts, Some(8.3));

        assert_eq!(sample.fan.unwrap().rpm, 2450);
    }

    #[test]
    fn missing_hardware_omits_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = SysfsCollector::with_root(dir.path().to_path_buf());
        let sample = c.collect();
        assert!(sample.is_empty());
    }
}
