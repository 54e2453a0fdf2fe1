// src/process.rs

use std::fs;

use procfs::process::Process;

use crate::errors::{Errors, NyxError};
use crate::watch::Watch;

/// Observed CPU and memory consumption of one process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Liveness check backing the poll loop: the process exists under /proc
/// and is not a zombie.
pub fn check_process_running(pid: i32) -> bool {
    if pid < 1 {
        return false;
    }

    let process = match Process::new(pid) {
        Ok(process) => process,
        Err(_) => return false,
    };

    match process.stat() {
        Ok(stat) => stat.state != 'Z',
        Err(_) => false,
    }
}

/// The `comm` name of a process, as the kernel records it.
pub fn process_comm(pid: i32) -> Option<String> {
    let process = Process::new(pid).ok()?;
    process.stat().ok().map(|stat| stat.comm)
}

/// Whether a recorded PID can be adopted for a watch: it must be alive and
/// its comm must match the watch executable's basename.
pub fn adoptable(pid: i32, watch: &Watch) -> bool {
    if !check_process_running(pid) {
        return false;
    }

    match process_comm(pid) {
        Some(comm) => watch.matches_comm(&comm),
        None => false,
    }
}

/// Reads CPU and resident memory for a PID from /proc.
pub fn resource_usage(pid: i32) -> Result<ResourceUsage, NyxError> {
    let process = Process::new(pid)?;
    let stat = process.stat()?;
    let memory_bytes = process.statm()?.resident * procfs::page_size();
    let cpu_percent = cpu_share_percent(&stat)?;

    Ok(ResourceUsage {
        cpu_percent,
        memory_bytes,
    })
}

/// Average CPU share since the process came up: ticks it consumed (its own
/// plus waited-for children) against its age, as a percentage of one CPU.
fn cpu_share_percent(stat: &procfs::process::Stat) -> Result<f32, NyxError> {
    let hertz = procfs::ticks_per_second() as f64;

    let consumed_ticks = stat.utime + stat.stime + stat.cutime as u64 + stat.cstime as u64;
    let consumed = consumed_ticks as f64 / hertz;

    let age = system_uptime()? - stat.starttime as f64 / hertz;

    // freshly started, nothing meaningful to report yet
    if age <= 0.0 {
        return Ok(0.0);
    }

    Ok((consumed / age * 100.0) as f32)
}

/// Seconds the host has been up, from the first field of /proc/uptime.
fn system_uptime() -> Result<f64, NyxError> {
    let content = fs::read_to_string("/proc/uptime")?;

    content
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| NyxError::new(Errors::Process, "malformed /proc/uptime"))
}
