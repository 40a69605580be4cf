//! Process self-metrics from the /proc filesystem.
//!
//! The watchdog samples the agent's own footprint from here: user CPU time
//! out of `/proc/self/stat`, resident memory out of `/proc/self/status`, and
//! the number of open sockets out of `/proc/self/fd`. Everything degrades
//! gracefully: on a read failure the caller gets a zeroed reading and the
//! agent keeps running without that metric.

use std::fs;
use std::io::{self, BufRead, BufReader};

use tracing::debug;

/// Kernel clock ticks per second; `utime` in `/proc/self/stat` is expressed
/// in these.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

const PROC_SELF_STAT: &str = "/proc/self/stat";
const PROC_SELF_STATUS: &str = "/proc/self/status";
const PROC_SELF_FD: &str = "/proc/self/fd";
const PROC_HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// One sample of the process's resource footprint.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProcessInfo {
    /// Cumulative user CPU time, seconds.
    pub cpu_user_secs: f64,
    /// Resident set size, bytes.
    pub rss_bytes: u64,
    /// Open socket file descriptors.
    pub connections: u64,
}

/// Samples the current process. Missing metrics come back as zero.
pub fn sample() -> ProcessInfo {
    ProcessInfo {
        cpu_user_secs: cpu_user_secs_from(PROC_SELF_STAT).unwrap_or_else(|err| {
            debug!("could not read {PROC_SELF_STAT}: {err}");
            0.0
        }),
        rss_bytes: rss_bytes_from(PROC_SELF_STATUS).unwrap_or_else(|err| {
            debug!("could not read {PROC_SELF_STATUS}: {err}");
            0
        }),
        connections: socket_count_from(PROC_SELF_FD).unwrap_or_else(|err| {
            debug!("could not read {PROC_SELF_FD}: {err}");
            0
        }),
    }
}

/// Parses cumulative user CPU seconds from a `/proc/<pid>/stat` line.
///
/// The second field (`comm`) may contain spaces but is parenthesized, so the
/// scan starts after the closing parenthesis; `utime` is then field 12
/// (0-indexed) of the remainder.
fn cpu_user_secs_from(path: &str) -> io::Result<f64> {
    let line = fs::read_to_string(path)?;
    let after_comm = line
        .rfind(')')
        .map(|i| &line[i + 1..])
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat line"))?;
    let utime_ticks: f64 = after_comm
        .split_whitespace()
        .nth(11)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing utime field"))?;
    Ok(utime_ticks / CLOCK_TICKS_PER_SEC)
}

/// Parses resident memory in bytes from the `VmRSS:` line of
/// `/proc/<pid>/status` (the kernel reports it in kB).
fn rss_bytes_from(path: &str) -> io::Result<u64> {
    let file = fs::File::open(path)?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed VmRSS"))?;
            return Ok(kb * 1024);
        }
    }
    Err(io::Error::new(io::ErrorKind::NotFound, "no VmRSS line"))
}

/// Counts open sockets by reading the fd table's symlink targets.
fn socket_count_from(path: &str) -> io::Result<u64> {
    let mut count = 0;
    for entry in fs::read_dir(path)? {
        let Ok(entry) = entry else { continue };
        if let Ok(target) = fs::read_link(entry.path()) {
            if target.to_string_lossy().starts_with("socket:") {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Host name for payload identity, `unknown` when nothing better exists.
pub fn hostname() -> String {
    fs::read_to_string(PROC_HOSTNAME)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
