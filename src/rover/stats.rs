//! Host health telemetry for the onboard computer.
//!
//! Samples CPU, memory, root-filesystem usage, this process's own RSS and
//! the CPU temperature every few seconds and reports them as an ordinary
//! `sensor_data` reading under the `pi` sensor name, so they flow to
//! drivers and into telemetry storage the same way microcontroller
//! readings do.

use super::{now_ns, Upstream};
use crate::protocol::{Measurements, Message};
use std::time::Duration;
use sysinfo::{Components, Disks, Pid, ProcessesToUpdate, System};

const SAMPLE_PERIOD: Duration = Duration::from_secs(5);

pub async fn run(upstream: Upstream) {
    let pid = sysinfo::get_current_pid().ok();
    let mut sys = System::new();
    // First CPU sample has no baseline; prime it and discard.
    sys.refresh_cpu_usage();
    tokio::time::sleep(SAMPLE_PERIOD).await;

    loop {
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        if let Some(pid) = pid {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }
        let disks = Disks::new_with_refreshed_list();
        let components = Components::new_with_refreshed_list();

        upstream.send(Message::SensorData {
            time: now_ns(),
            sensor: "pi".to_string(),
            measurements: sample(&sys, &disks, &components, pid),
        });

        tokio::time::sleep(SAMPLE_PERIOD).await;
    }
}

fn sample(sys: &System, disks: &Disks, components: &Components, pid: Option<Pid>) -> Measurements {
    let mut m = Measurements::new();
    m.insert("cpu_percent".into(), Some(f64::from(sys.global_cpu_usage())));

    let total_ram = sys.total_memory();
    let available_ram = sys.available_memory();
    m.insert("ram_free".into(), Some(available_ram as f64));
    m.insert(
        "ram_percent".into(),
        (total_ram > 0)
            .then(|| 100.0 * (total_ram - available_ram.min(total_ram)) as f64 / total_ram as f64),
    );

    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"));
    m.insert(
        "disk_free".into(),
        root.map(|d| d.available_space() as f64),
    );
    m.insert(
        "disk_percent".into(),
        root.and_then(|d| {
            let total = d.total_space();
            (total > 0)
                .then(|| 100.0 * (total - d.available_space().min(total)) as f64 / total as f64)
        }),
    );

    // This process's own resident memory, so a leaking bridge is visible
    // from the driver console.
    m.insert(
        "ctl_ram_used".into(),
        pid.and_then(|pid| sys.process(pid)).map(|p| p.memory() as f64),
    );

    m.insert("cpu_temp".into(), cpu_temperature(components));
    m
}

/// Best-effort CPU temperature; not every host exposes a thermal zone.
fn cpu_temperature(components: &Components) -> Option<f64> {
    components
        .list()
        .iter()
        .find(|c| c.label().to_ascii_lowercase().contains("cpu"))
        .and_then(|c| c.temperature())
        .map(f64::from)
}
