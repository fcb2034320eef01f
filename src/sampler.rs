//! Periodic sampling of per-frame resource usage from /proc.
//!
//! Each tick enumerates every pid, reads stat/status/io on a bounded
//! blocking pool, and rolls the results into one ProcSample per frame
//! session. Processes vanishing between enumeration and read are expected
//! and contribute nothing; the frame keeps its previous sample.
//!
//! %CPU smoothing: the instantaneous rate over the last interval is
//! averaged with the previous rate, and the history keeps the unsmoothed
//! rate for the next tick. A pid seen for the first time reports its
//! lifetime average.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::frame::{ProcSample, PtreeNode};
use crate::machine::HostFacts;
use crate::procfs::{self, RawPidRead};
use crate::registry::FrameRegistry;

/// Concurrent pseudo-file readers per tick.
const SAMPLER_WORKERS: usize = 6;

/// Per-pid state carried between ticks to smooth %CPU.
#[derive(Debug, Clone, Copy)]
struct PidHistory {
    cpu_time: f64,
    running_time: f64,
    /// Unsmoothed rate from the previous observation.
    rate: f64,
}

pub struct ProcSampler {
    registry: FrameRegistry,
    facts: Arc<HostFacts>,
    interval: Duration,
    proc_root: PathBuf,
    history: HashMap<i32, PidHistory>,
}

impl ProcSampler {
    pub fn new(registry: FrameRegistry, facts: Arc<HostFacts>, interval: Duration) -> ProcSampler {
        ProcSampler {
            registry,
            facts,
            interval,
            proc_root: PathBuf::from("/proc"),
            history: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("sampler stopping");
                        return;
                    }
                }
            }
        }
    }

    pub async fn tick(&mut self) {
        let roots: HashSet<i32> = self.registry.running_root_pids().into_iter().collect();

        let pids = match procfs::list_pids(&self.proc_root) {
            Ok(pids) => pids,
            Err(e) => {
                warn!(error = %e, "could not enumerate processes");
                return;
            }
        };

        let reads = read_all(&self.proc_root, pids).await;
        let samples = self.merge(&roots, reads);
        for (session, sample) in samples {
            self.registry.publish_sample(session, sample);
        }
    }

    /// Fold raw reads into per-session samples. Pure with respect to the
    /// registry; only the pid history mutates.
    fn merge(
        &mut self,
        roots: &HashSet<i32>,
        reads: Vec<RawPidRead>,
    ) -> HashMap<i32, ProcSample> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let hertz = self.facts.system_hertz.max(1) as f64;
        let page_size = self.facts.page_size;

        let mut samples: HashMap<i32, ProcSample> = HashMap::new();
        let mut history: HashMap<i32, PidHistory> = HashMap::new();

        for read in reads {
            let stat = match read.stat.as_deref().and_then(procfs::parse_stat) {
                Some(stat) => stat,
                None => continue,
            };
            let status = match read.status.as_deref().and_then(procfs::parse_status) {
                Some(status) => status,
                None => continue,
            };
            // Non-leader threads would double-count the whole process.
            if status.is_thread() {
                continue;
            }
            if stat.session == 0 || !roots.contains(&stat.session) {
                continue;
            }

            let sample = samples.entry(stat.session).or_default();

            let cpu_time = stat.cpu_time_ticks();
            let create_time = self.facts.boot_time as f64 + stat.start_time as f64 / hertz;
            let running_time = now - create_time;

            sample.rss += stat.rss_pages * page_size;
            sample.vsize += stat.vsize;
            sample.cpu_time += cpu_time;
            sample.voluntary_ctxt_switches += status.voluntary_ctxt_switches;
            sample.nonvoluntary_ctxt_switches += status.nonvoluntary_ctxt_switches;

            if let Some(io) = read.io.as_deref().map(procfs::parse_io) {
                sample.read_calls += io.read_calls;
                sample.write_calls += io.write_calls;
                sample.read_bytes += io.read_bytes;
                sample.write_bytes += io.write_bytes;
            }

            if running_time > 0.0 {
                let (reported, entry) = pcpu(self.history.get(&stat.pid), cpu_time, running_time);
                sample.pcpu += reported;
                history.insert(stat.pid, entry);
            }

            if stat.pid == stat.session {
                sample.running_time = running_time;
            } else if sample.running_time == 0.0 {
                sample.running_time = running_time;
            }

            sample.ptree.push(PtreeNode {
                pid: stat.pid,
                running_time,
                cpu_time,
            });
        }

        // Pids absent from this sample fall out of the history here.
        self.history = history;
        samples
    }
}

/// Smoothed %CPU for one pid plus the history entry for the next tick.
fn pcpu(prev: Option<&PidHistory>, cpu_time: u64, running_time: f64) -> (f64, PidHistory) {
    let cpu_time = cpu_time as f64;
    match prev {
        Some(prev) if (running_time - prev.running_time).abs() > f64::EPSILON => {
            let rate = (cpu_time - prev.cpu_time) / (running_time - prev.running_time);
            (
                (prev.rate + rate) / 2.0,
                PidHistory {
                    cpu_time,
                    running_time,
                    rate,
                },
            )
        }
        Some(prev) => (prev.rate, *prev),
        None => {
            let rate = cpu_time / running_time;
            (
                rate,
                PidHistory {
                    cpu_time,
                    running_time,
                    rate,
                },
            )
        }
    }
}

/// Read stat/status/io for every pid on the blocking pool, at most
/// SAMPLER_WORKERS reads in flight.
async fn read_all(proc_root: &std::path::Path, pids: Vec<i32>) -> Vec<RawPidRead> {
    let semaphore = Arc::new(Semaphore::new(SAMPLER_WORKERS));
    let mut tasks = JoinSet::new();
    for pid in pids {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let root = proc_root.to_path_buf();
        tasks.spawn_blocking(move || {
            let read = procfs::read_pid_files(&root, pid);
            drop(permit);
            read
        });
    }

    let mut reads = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(read) = joined {
            reads.push(read);
        }
    }
    reads
}
