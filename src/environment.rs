//! Composition of the environment a frame's child process runs with.
//!
//! The base map is built from host facts and the launch request, then the
//! request's own environment is merged over it, so the dispatcher always
//! wins on conflicts.

use std::collections::HashMap;

use crate::config::Config;
use crate::frame::RunFrame;
use crate::machine::HostFacts;

/// Attribute key carrying the comma-separated physical core list.
pub const ATTR_CPU_LIST: &str = "CPU_LIST";

/// Build the full environment for a frame.
pub fn frame_env(config: &Config, facts: &HostFacts, frame: &RunFrame) -> HashMap<String, String> {
    let user = frame.user_name.as_str();

    let mut env: HashMap<String, String> = HashMap::new();
    env.insert("PATH".into(), config.environment.linux.path.clone());
    env.insert("TERM".into(), "unknown".into());
    env.insert("TZ".into(), facts.timezone.clone());
    env.insert("USER".into(), user.into());
    env.insert("LOGNAME".into(), user.into());
    env.insert("MAIL".into(), format!("/usr/mail/{}", user));
    env.insert("HOME".into(), format!("/net/homedirs/{}", user));

    env.insert("show".into(), frame.show.clone());
    env.insert("shot".into(), frame.shot.clone());
    env.insert("jobid".into(), frame.job_name.clone());
    env.insert("jobhost".into(), facts.hostname.clone());
    env.insert("frame".into(), frame.frame_name.clone());
    env.insert("zframe".into(), frame.frame_name.clone());
    env.insert("logfile".into(), frame.log_path().display().to_string());
    env.insert("maxframetime".into(), "0".into());
    env.insert("minspace".into(), "200".into());
    env.insert("CUE3".into(), "True".into());
    env.insert(
        "CUE_GPU_MEMORY".into(),
        facts.gpu_memory_bytes.to_string(),
    );

    for (key, value) in &frame.environment {
        env.insert(key.clone(), value.clone());
    }

    // A frame pinned to specific cores gets CUE_THREADS raised to cover all
    // of them, so renderers use the full hyper-threaded allocation.
    if let Some(cpu_list) = frame.attributes.get(ATTR_CPU_LIST) {
        if let Some(threads) = env.get("CUE_THREADS") {
            let assigned = cpu_list.split(',').filter(|s| !s.trim().is_empty()).count();
            let threads = threads.trim().parse::<usize>().unwrap_or(0);
            env.insert("CUE_THREADS".into(), threads.max(assigned).to_string());
            env.insert("CUE_HT".into(), "True".into());
        }
    }

    env
}
