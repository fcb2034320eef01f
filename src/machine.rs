//! Facts about the host the agent is running on.
//!
//! Everything in `HostFacts` is detected once at startup. User-login
//! detection is a live scan because it gates NIMBY admission decisions.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::MachineLinuxConfig;
use crate::procfs;

/// Process names whose presence implies an interactive desktop session.
const DESKTOP_SESSION_NAMES: [&str; 4] =
    ["kdesktop", "gnome-session", "startkde", "gnome-shell"];

#[derive(Debug, Clone)]
pub struct HostFacts {
    pub hostname: String,
    pub timezone: String,
    pub is_desktop: bool,
    /// Epoch seconds at which the kernel booted.
    pub boot_time: u64,
    /// Clock ticks per second, for converting stat fields.
    pub system_hertz: u64,
    pub page_size: u64,
    pub total_cores: i32,
    pub gpu_memory_bytes: u64,
}

impl HostFacts {
    pub fn detect(config: &MachineLinuxConfig) -> HostFacts {
        let boot_time = procfs::read_boot_time(Path::new("/proc")).unwrap_or_else(|e| {
            warn!(error = %e, "could not read boot time, falling back to now");
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });

        HostFacts {
            hostname: hostname(),
            timezone: timezone(),
            is_desktop: is_desktop_linux(config),
            boot_time,
            system_hertz: procfs::system_hertz(),
            page_size: procfs::page_size(),
            total_cores: total_cores(),
            gpu_memory_bytes: gpu_memory_bytes(),
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn timezone() -> String {
    if let Ok(tz) = std::env::var("TZ") {
        if !tz.is_empty() {
            return tz;
        }
    }
    fs::read_to_string("/etc/timezone")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "UTC".to_string())
}

fn total_cores() -> i32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as i32
    } else {
        1
    }
}

/// Total GPU memory, best effort via nvidia-smi. Hosts without a GPU (or
/// without the tool) report zero.
fn gpu_memory_bytes() -> u64 {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output();
    let output = match output {
        Ok(out) if out.status.success() => out,
        _ => return 0,
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .map(|mib| mib * 1024 * 1024)
        .sum()
}

/// A host is a desktop when the init system defaults to a graphical
/// environment, either via the systemd default target or a legacy inittab
/// runlevel line.
pub fn is_desktop_linux(config: &MachineLinuxConfig) -> bool {
    let target = Path::new(&config.path_init_target);
    if target.is_symlink() {
        if let Ok(resolved) = fs::read_link(target) {
            if resolved
                .to_str()
                .map(|p| p.ends_with("graphical.target"))
                .unwrap_or(false)
            {
                return true;
            }
        }
    }

    if let Ok(inittab) = fs::read_to_string(&config.path_inittab) {
        for line in inittab.lines() {
            if line.starts_with(&config.path_inittab_default) {
                return true;
            }
        }
    }

    false
}

/// True when an interactive user is on the machine.
///
/// X display lock sockets under the displays path name active displays; a
/// utmpx USER_PROCESS entry on one of those displays is a login. When the
/// sockets tell us nothing, fall back to scanning process names for known
/// desktop sessions.
pub fn is_user_logged_in(config: &MachineLinuxConfig) -> bool {
    let displays = active_display_numbers(&config.displays_path);

    for display_num in &displays {
        if utmpx_has_display_session(*display_num) {
            debug!(display = display_num, "user logged into display");
            return true;
        }
    }

    desktop_session_process_running()
}

/// Display numbers from lock-socket names matching `X<digits>`.
fn active_display_numbers(displays_path: &str) -> Vec<u32> {
    let entries = match fs::read_dir(displays_path) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut numbers = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if let Some(digits) = name.strip_prefix('X') {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(number) = digits.parse() {
                    numbers.push(number);
                }
            }
        }
    }
    numbers
}

/// Walk utmpx for a USER_PROCESS whose line is `:<display>`.
fn utmpx_has_display_session(display: u32) -> bool {
    let wanted = format!(":{}", display);
    let mut found = false;
    unsafe {
        libc::setutxent();
        loop {
            let entry = libc::getutxent();
            if entry.is_null() {
                break;
            }
            let entry = &*entry;
            if entry.ut_type != libc::USER_PROCESS {
                continue;
            }
            // ut_line is not NUL-terminated when fully occupied.
            let line: Vec<u8> = entry
                .ut_line
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8)
                .collect();
            if line == wanted.as_bytes() {
                found = true;
                break;
            }
        }
        libc::endutxent();
    }
    found
}

fn desktop_session_process_running() -> bool {
    let pids = match procfs::list_pids(Path::new("/proc")) {
        Ok(pids) => pids,
        Err(_) => return false,
    };
    for pid in pids {
        let comm = match fs::read_to_string(format!("/proc/{}/comm", pid)) {
            Ok(comm) => comm,
            Err(_) => continue,
        };
        let comm = comm.trim();
        if DESKTOP_SESSION_NAMES.iter().any(|name| comm.contains(name)) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn facts_detect_on_a_real_host() {
        let facts = HostFacts::detect(&MachineLinuxConfig::default());
        assert!(!facts.hostname.is_empty());
        assert!(facts.boot_time > 0);
        assert!(facts.system_hertz > 0);
        assert!(facts.page_size >= 4096);
        assert!(facts.total_cores >= 1);
    }

    #[test]
    fn graphical_target_symlink_means_desktop() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("default.target");
        symlink("/usr/lib/systemd/system/graphical.target", &link).unwrap();

        let config = MachineLinuxConfig {
            path_init_target: link.display().to_string(),
            path_inittab: "/no/such/inittab".to_string(),
            ..MachineLinuxConfig::default()
        };
        assert!(is_desktop_linux(&config));
    }

    #[test]
    fn multiuser_target_symlink_is_not_desktop() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("default.target");
        symlink("/usr/lib/systemd/system/multi-user.target", &link).unwrap();

        let config = MachineLinuxConfig {
            path_init_target: link.display().to_string(),
            path_inittab: "/no/such/inittab".to_string(),
            ..MachineLinuxConfig::default()
        };
        assert!(!is_desktop_linux(&config));
    }

    #[test]
    fn inittab_default_runlevel_means_desktop() {
        let dir = tempfile::tempdir().unwrap();
        let inittab = dir.path().join("inittab");
        fs::write(&inittab, "# comment\nid:5:initdefault:\n").unwrap();

        let config = MachineLinuxConfig {
            path_init_target: "/no/such/target".to_string(),
            path_inittab: inittab.display().to_string(),
            ..MachineLinuxConfig::default()
        };
        assert!(is_desktop_linux(&config));

        fs::write(&inittab, "id:3:initdefault:\n").unwrap();
        assert!(!is_desktop_linux(&config));
    }

    #[test]
    fn display_numbers_parse_from_socket_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("X0"), b"").unwrap();
        fs::write(dir.path().join("X12"), b"").unwrap();
        fs::write(dir.path().join("Xabc"), b"").unwrap();
        fs::write(dir.path().join("notadisplay"), b"").unwrap();

        let mut numbers = active_display_numbers(dir.path().to_str().unwrap());
        numbers.sort_unstable();
        assert_eq!(numbers, vec![0, 12]);
    }

    #[test]
    fn missing_displays_path_is_not_an_error() {
        assert!(active_display_numbers("/no/such/displays").is_empty());
    }
}
