//! Parsers for the kernel process-information filesystem.
//!
//! Field positions in `/proc/[pid]/stat` follow the 1-based numbering of
//! proc(5). The comm field may contain spaces, parentheses and newlines, so
//! positional parsing starts after the last `)` in the line.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Positional fields of `/proc/[pid]/stat` the sampler cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct StatEntry {
    pub pid: i32,
    /// Session id of the process, field 6. Frames are session leaders, so
    /// this is also the frame root pid for every process in a frame subtree.
    pub session: i32,
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    pub num_threads: i64,
    /// Jiffies after boot at which the process started, field 22.
    pub start_time: u64,
    /// Virtual memory size in bytes, field 23.
    pub vsize: u64,
    /// Resident set size in pages, field 24.
    pub rss_pages: u64,
}

impl StatEntry {
    pub fn cpu_time_ticks(&self) -> u64 {
        self.utime + self.stime + self.cutime + self.cstime
    }
}

/// Parse one `/proc/[pid]/stat` line. Returns None for anything that does
/// not look like a stat line; callers treat that the same as the process
/// having disappeared.
pub fn parse_stat(text: &str) -> Option<StatEntry> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    let pid: i32 = text[..open].trim().parse().ok()?;

    let rest: Vec<&str> = text[close + 1..].split_whitespace().collect();
    // rest[0] is field 3 (state), so field N lives at rest[N - 3].
    let field = |n: usize| -> Option<&str> { rest.get(n - 3).copied() };
    let unsigned = |n: usize| -> Option<u64> {
        field(n)?.parse::<i64>().ok().map(|v| v.max(0) as u64)
    };

    Some(StatEntry {
        pid,
        session: field(6)?.parse().ok()?,
        utime: unsigned(14)?,
        stime: unsigned(15)?,
        cutime: unsigned(16)?,
        cstime: unsigned(17)?,
        num_threads: field(20)?.parse().ok()?,
        start_time: unsigned(22)?,
        vsize: unsigned(23)?,
        rss_pages: unsigned(24)?,
    })
}

/// The subset of `/proc/[pid]/status` the sampler consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub pid: i32,
    pub tgid: i32,
    pub voluntary_ctxt_switches: u64,
    pub nonvoluntary_ctxt_switches: u64,
    pub cpus_allowed: Vec<u32>,
}

impl StatusEntry {
    /// Non-leader threads share a Tgid with their leader and must not be
    /// counted a second time.
    pub fn is_thread(&self) -> bool {
        self.tgid != self.pid
    }
}

/// Parse `/proc/[pid]/status` into its key-value form and extract the fields
/// of interest.
pub fn parse_status(text: &str) -> Option<StatusEntry> {
    let mut map: HashMap<&str, &str> = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            map.insert(key.trim(), value.trim());
        }
    }

    Some(StatusEntry {
        pid: map.get("Pid")?.parse().ok()?,
        tgid: map.get("Tgid")?.parse().ok()?,
        voluntary_ctxt_switches: map
            .get("voluntary_ctxt_switches")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        nonvoluntary_ctxt_switches: map
            .get("nonvoluntary_ctxt_switches")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        cpus_allowed: map
            .get("Cpus_allowed_list")
            .map(|v| parse_cpus_allowed_list(v))
            .unwrap_or_default(),
    })
}

/// Expand a `Cpus_allowed_list` value such as `0,2,4-7` into the full set.
pub fn parse_cpus_allowed_list(value: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in value.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (a.parse::<u32>(), b.parse::<u32>()),
            None => (part.parse::<u32>(), part.parse::<u32>()),
        };
        if let (Ok(start), Ok(end)) = (start, end) {
            cpus.extend(start..=end);
        }
    }
    cpus
}

/// I/O accounting counters from `/proc/[pid]/io`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoEntry {
    pub read_calls: u64,
    pub write_calls: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

pub fn parse_io(text: &str) -> IoEntry {
    let mut io = IoEntry::default();
    for line in text.lines() {
        let (key, value) = match line.split_once(':') {
            Some(kv) => kv,
            None => continue,
        };
        let value: u64 = match value.trim().parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        match key.trim() {
            "syscr" => io.read_calls = value,
            "syscw" => io.write_calls = value,
            "read_bytes" => io.read_bytes = value,
            "write_bytes" => io.write_bytes = value,
            _ => {}
        }
    }
    io
}

/// Raw text of one pid's pseudo-files, captured together on the blocking
/// pool. Any file may be gone by read time; missing pieces are None and the
/// pid contributes nothing for them.
#[derive(Debug)]
pub struct RawPidRead {
    pub pid: i32,
    pub stat: Option<String>,
    pub status: Option<String>,
    pub io: Option<String>,
}

/// Blocking read of stat, status and io for one pid.
pub fn read_pid_files(root: &Path, pid: i32) -> RawPidRead {
    let dir = root.join(pid.to_string());
    RawPidRead {
        pid,
        stat: fs::read_to_string(dir.join("stat")).ok(),
        status: fs::read_to_string(dir.join("status")).ok(),
        // io is unreadable for other users' processes without privilege.
        io: fs::read_to_string(dir.join("io")).ok(),
    }
}

/// All numeric entries under the procfs root.
pub fn list_pids(root: &Path) -> io::Result<Vec<i32>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            pids.push(pid);
        }
    }
    Ok(pids)
}

/// Boot time in epoch seconds, the `btime` line of `/proc/stat`.
pub fn read_boot_time(root: &Path) -> io::Result<u64> {
    let text = fs::read_to_string(root.join("stat"))?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            if let Ok(btime) = rest.trim().parse() {
                return Ok(btime);
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no btime line in /proc/stat",
    ))
}

pub fn system_hertz() -> u64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as u64
    } else {
        100
    }
}

pub fn page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A realistic stat line; comm deliberately contains a space and a
    // closing paren.
    const STAT: &str = "1234 (weird) proc) S 1 1234 1234 0 -1 4194560 2586 0 3 0 \
                        52 14 7 2 20 0 4 0 5171002 225443840 1866 18446744073709551615 \
                        1 1 0 0 0 0 0 4096 0 0 0 0 17 3 0 0 0 0 0 0 0 0 0 0 0 0 0";

    #[test]
    fn stat_positions_survive_hostile_comm() {
        let entry = parse_stat(STAT).unwrap();
        assert_eq!(entry.pid, 1234);
        assert_eq!(entry.session, 1234);
        assert_eq!(entry.utime, 52);
        assert_eq!(entry.stime, 14);
        assert_eq!(entry.cutime, 7);
        assert_eq!(entry.cstime, 2);
        assert_eq!(entry.num_threads, 4);
        assert_eq!(entry.start_time, 5171002);
        assert_eq!(entry.vsize, 225443840);
        assert_eq!(entry.rss_pages, 1866);
        assert_eq!(entry.cpu_time_ticks(), 75);
    }

    #[test]
    fn stat_garbage_is_none() {
        assert!(parse_stat("").is_none());
        assert!(parse_stat("not a stat line").is_none());
        assert!(parse_stat("99 (short) R 1").is_none());
    }

    #[test]
    fn status_extracts_tgid_and_switches() {
        let text = "Name:\tnuke\nTgid:\t4000\nPid:\t4001\nPPid:\t1\n\
                    Cpus_allowed_list:\t0,2,4-6\n\
                    voluntary_ctxt_switches:\t77\nnonvoluntary_ctxt_switches:\t3\n";
        let entry = parse_status(text).unwrap();
        assert_eq!(entry.pid, 4001);
        assert_eq!(entry.tgid, 4000);
        assert!(entry.is_thread());
        assert_eq!(entry.voluntary_ctxt_switches, 77);
        assert_eq!(entry.nonvoluntary_ctxt_switches, 3);
        assert_eq!(entry.cpus_allowed, vec![0, 2, 4, 5, 6]);
    }

    #[test]
    fn cpus_allowed_ranges_expand() {
        assert_eq!(parse_cpus_allowed_list("0"), vec![0]);
        assert_eq!(parse_cpus_allowed_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpus_allowed_list("1,3-5,8"), vec![1, 3, 4, 5, 8]);
        assert!(parse_cpus_allowed_list("").is_empty());
        assert!(parse_cpus_allowed_list("junk").is_empty());
    }

    #[test]
    fn io_counters() {
        let text = "rchar: 4292\nwchar: 0\nsyscr: 13\nsyscw: 4\n\
                    read_bytes: 45056\nwrite_bytes: 8192\ncancelled_write_bytes: 0\n";
        let io = parse_io(text);
        assert_eq!(io.read_calls, 13);
        assert_eq!(io.write_calls, 4);
        assert_eq!(io.read_bytes, 45056);
        assert_eq!(io.write_bytes, 8192);
    }

    #[test]
    fn boot_time_from_real_procfs() {
        let btime = read_boot_time(Path::new("/proc")).unwrap();
        assert!(btime > 0);
    }

    #[test]
    fn pid_listing_skips_non_numeric() {
        let pids = list_pids(Path::new("/proc")).unwrap();
        assert!(pids.contains(&1) || !pids.is_empty());
    }
}
