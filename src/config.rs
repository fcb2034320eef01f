//! Typed daemon configuration.
//!
//! The on-disk file is YAML. Every recognized key has a default so the file
//! is optional, but a file that is present and malformed (or that carries
//! unknown keys) is a startup error.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub grpc: GrpcConfig,
    pub daemon: DaemonConfig,
    pub machine: MachineConfig,
    pub environment: EnvironmentConfig,
    pub sampler: SamplerConfig,
    pub frame: FrameConfig,
}

impl Config {
    /// Load from `path`. The caller decides whether a missing file is an
    /// error; this function treats it as one.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrpcConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        GrpcConfig {
            host: "127.0.0.1".to_string(),
            port: 50051,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub log: DaemonLogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonLogConfig {
    pub path: String,
}

impl Default for DaemonLogConfig {
    fn default() -> Self {
        DaemonLogConfig {
            path: "/var/log/rqd/rqd.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    pub linux: MachineLinuxConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineLinuxConfig {
    /// Symlink whose target names the systemd default target.
    pub path_init_target: String,
    /// Legacy SysV inittab.
    pub path_inittab: String,
    /// Line prefix marking a graphical default runlevel in the inittab.
    pub path_inittab_default: String,
    /// Directory holding the X display lock sockets (`X0`, `X1`, ...).
    pub displays_path: String,
}

impl Default for MachineLinuxConfig {
    fn default() -> Self {
        MachineLinuxConfig {
            path_init_target: "/etc/systemd/system/default.target".to_string(),
            path_inittab: "/etc/inittab".to_string(),
            path_inittab_default: "id:5:initdefault:".to_string(),
            displays_path: "/tmp/.X11-unix".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub linux: EnvironmentLinuxConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentLinuxConfig {
    #[serde(rename = "PATH")]
    pub path: String,
}

impl Default for EnvironmentLinuxConfig {
    fn default() -> Self {
        EnvironmentLinuxConfig {
            path: "/bin:/usr/bin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    pub interval_seconds: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameConfig {
    /// How long a terminal frame stays queryable in the registry.
    pub grace_terminal_seconds: u64,
    /// Delay between SIGTERM and the SIGKILL escalation.
    pub kill_grace_seconds: u64,
    /// Niceness increment applied to every frame between fork and exec.
    pub nice: i32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            grace_terminal_seconds: 60,
            kill_grace_seconds: 10,
            nice: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.grpc.host, "127.0.0.1");
        assert_eq!(cfg.grpc.port, 50051);
        assert_eq!(cfg.daemon.log.path, "/var/log/rqd/rqd.log");
        assert_eq!(cfg.sampler.interval_seconds, 15);
        assert_eq!(cfg.frame.grace_terminal_seconds, 60);
        assert_eq!(cfg.environment.linux.path, "/bin:/usr/bin");
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "grpc:\n  port: 9999\nsampler:\n  interval_seconds: 5\n"
        )
        .unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.grpc.port, 9999);
        assert_eq!(cfg.grpc.host, "127.0.0.1");
        assert_eq!(cfg.sampler.interval_seconds, 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "grpc:\n  hostt: \"0.0.0.0\"\n").unwrap();
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Path::new("/no/such/rqd.yaml")).is_err());
    }

    #[test]
    fn path_key_is_uppercase_in_yaml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "environment:\n  linux:\n    PATH: \"/opt/bin\"\n").unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.environment.linux.path, "/opt/bin");
    }
}
