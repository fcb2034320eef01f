//! The gRPC control plane. Each handler validates the request, calls into
//! the core, and maps internal errors onto typed statuses at this boundary.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::error::LaunchError;
use crate::frame::{ProcSample, RunFrame, RunState, RunningFrame};
use crate::lock::HostAction;
use crate::proto;
use crate::proto::rqd_interface_server::{RqdInterface, RqdInterfaceServer};
use crate::rqcore::RqdCore;

pub struct RqdService {
    core: Arc<RqdCore>,
}

impl RqdService {
    pub fn new(core: Arc<RqdCore>) -> RqdService {
        RqdService { core }
    }
}

/// Serve the control plane until `shutdown` resolves, then drain in-flight
/// calls.
pub async fn serve(
    core: Arc<RqdCore>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    tonic::transport::Server::builder()
        .add_service(RqdInterfaceServer::new(RqdService::new(core)))
        .serve_with_shutdown(addr, shutdown)
        .await
}

fn launch_status(err: LaunchError) -> Status {
    match err {
        LaunchError::AlreadyExists(_) => Status::already_exists(err.to_string()),
        LaunchError::InsufficientCores { .. } => Status::resource_exhausted(err.to_string()),
        LaunchError::PendingHostAction(_) | LaunchError::NimbyLocked => {
            Status::failed_precondition(err.to_string())
        }
        LaunchError::Invalid(_) => Status::invalid_argument(err.to_string()),
    }
}

fn domain_run_frame(frame: proto::RunFrame) -> RunFrame {
    RunFrame {
        frame_id: frame.frame_id,
        resource_id: frame.resource_id,
        job_id: frame.job_id,
        job_name: frame.job_name,
        frame_name: frame.frame_name,
        layer_id: frame.layer_id,
        command: frame.command,
        user_name: frame.user_name,
        uid: frame.uid,
        gid: frame.gid,
        log_dir: frame.log_dir,
        log_file: frame.log_file,
        show: frame.show,
        shot: frame.shot,
        job_temp_dir: frame.job_temp_dir,
        frame_temp_dir: frame.frame_temp_dir,
        num_cores: frame.num_cores,
        ignore_nimby: frame.ignore_nimby,
        environment: frame.environment,
        attributes: frame.attributes,
    }
}

fn proto_state(state: RunState) -> proto::RunState {
    match state {
        RunState::Pending => proto::RunState::Pending,
        RunState::Running => proto::RunState::Running,
        RunState::Exited => proto::RunState::Exited,
        RunState::Killed => proto::RunState::Killed,
        RunState::FailedToLaunch => proto::RunState::FailedToLaunch,
    }
}

fn proto_stats(sample: &ProcSample) -> proto::ProcStats {
    proto::ProcStats {
        rss: sample.rss,
        max_rss: sample.max_rss,
        vsize: sample.vsize,
        max_vsize: sample.max_vsize,
        pcpu: sample.pcpu,
        cpu_time: sample.cpu_time,
        running_time: sample.running_time,
        voluntary_ctxt_switches: sample.voluntary_ctxt_switches,
        nonvoluntary_ctxt_switches: sample.nonvoluntary_ctxt_switches,
        read_calls: sample.read_calls,
        write_calls: sample.write_calls,
        read_bytes: sample.read_bytes,
        write_bytes: sample.write_bytes,
        ptree: sample
            .ptree
            .iter()
            .map(|node| proto::ProcTreeNode {
                pid: node.pid,
                running_time: node.running_time,
                cpu_time: node.cpu_time,
            })
            .collect(),
    }
}

fn frame_info(frame: &RunningFrame) -> proto::RunningFrameInfo {
    let rusage = frame.rusage();
    proto::RunningFrameInfo {
        frame_id: frame.request.frame_id.clone(),
        job_id: frame.request.job_id.clone(),
        resource_id: frame.request.resource_id.clone(),
        pid: frame.pid,
        state: proto_state(frame.state()) as i32,
        exit_code: frame.exit_code().unwrap_or(0),
        start_time: frame.start_epoch(),
        num_cores: frame.request.num_cores,
        user_time: rusage.user_time,
        system_time: rusage.system_time,
        real_time: rusage.real_time,
        max_rss_kb: rusage.max_rss_kb,
        stats: frame.last_sample().map(|s| proto_stats(&s)),
    }
}

fn host_report(core: &RqdCore) -> proto::HostReport {
    let locks = core.locks.snapshot();
    let booked_cores = core.registry.booked_units() / 100;
    let idle_cores = (core.facts.total_cores - locks.locked_cores - booked_cores).max(0);

    proto::HostReport {
        host: Some(proto::RenderHost {
            name: core.facts.hostname.clone(),
            timezone: core.facts.timezone.clone(),
            is_desktop: core.facts.is_desktop,
            nimby_enabled: locks.nimby_enabled,
            boot_time: core.facts.boot_time as i64,
            total_cores: core.facts.total_cores,
            locked_cores: locks.locked_cores,
            idle_cores,
            gpu_memory: core.facts.gpu_memory_bytes,
        }),
        frames: core.registry.list_all().iter().map(|f| frame_info(f)).collect(),
    }
}

#[tonic::async_trait]
impl RqdInterface for RqdService {
    async fn launch_frame(
        &self,
        request: Request<proto::RqdStaticLaunchFrameRequest>,
    ) -> Result<Response<proto::RqdStaticLaunchFrameResponse>, Status> {
        let run_frame = request
            .into_inner()
            .run_frame
            .ok_or_else(|| Status::invalid_argument("run_frame is required"))?;
        debug!(frame_id = %run_frame.frame_id, job = %run_frame.job_name, "LaunchFrame");
        self.core
            .launch(domain_run_frame(run_frame))
            .map_err(launch_status)?;
        Ok(Response::new(proto::RqdStaticLaunchFrameResponse {}))
    }

    async fn report_status(
        &self,
        _request: Request<proto::RqdStaticReportStatusRequest>,
    ) -> Result<Response<proto::RqdStaticReportStatusResponse>, Status> {
        debug!("ReportStatus");
        Ok(Response::new(proto::RqdStaticReportStatusResponse {
            host_report: Some(host_report(&self.core)),
        }))
    }

    async fn get_running_frame_status(
        &self,
        request: Request<proto::RqdStaticGetRunningFrameStatusRequest>,
    ) -> Result<Response<proto::RqdStaticGetRunningFrameStatusResponse>, Status> {
        let frame_id = request.into_inner().frame_id;
        debug!(frame_id = %frame_id, "GetRunningFrameStatus");
        let frame = self
            .core
            .registry
            .get_by_frame_id(&frame_id)
            .ok_or_else(|| Status::not_found(format!("no such frame: {}", frame_id)))?;
        Ok(Response::new(
            proto::RqdStaticGetRunningFrameStatusResponse {
                running_frame_info: Some(frame_info(&frame)),
            },
        ))
    }

    async fn kill_running_frame(
        &self,
        request: Request<proto::RqdStaticKillRunningFrameRequest>,
    ) -> Result<Response<proto::RqdStaticKillRunningFrameResponse>, Status> {
        let request = request.into_inner();
        debug!(frame_id = %request.frame_id, "KillRunningFrame");
        let reason = if request.message.is_empty() {
            "killed by dispatcher".to_string()
        } else {
            request.message
        };
        self.core
            .kill_frame(&request.frame_id, &reason)
            .map_err(|e| Status::not_found(e.to_string()))?;
        Ok(Response::new(proto::RqdStaticKillRunningFrameResponse {}))
    }

    async fn shutdown_rqd_now(
        &self,
        _request: Request<proto::RqdStaticShutdownNowRequest>,
    ) -> Result<Response<proto::RqdStaticShutdownNowResponse>, Status> {
        self.core.host_action_now(HostAction::Shutdown);
        Ok(Response::new(proto::RqdStaticShutdownNowResponse {}))
    }

    async fn shutdown_rqd_idle(
        &self,
        _request: Request<proto::RqdStaticShutdownIdleRequest>,
    ) -> Result<Response<proto::RqdStaticShutdownIdleResponse>, Status> {
        self.core.host_action_when_idle(HostAction::Shutdown);
        Ok(Response::new(proto::RqdStaticShutdownIdleResponse {}))
    }

    async fn restart_rqd_now(
        &self,
        _request: Request<proto::RqdStaticRestartNowRequest>,
    ) -> Result<Response<proto::RqdStaticRestartNowResponse>, Status> {
        self.core.host_action_now(HostAction::Restart);
        Ok(Response::new(proto::RqdStaticRestartNowResponse {}))
    }

    async fn restart_rqd_idle(
        &self,
        _request: Request<proto::RqdStaticRestartIdleRequest>,
    ) -> Result<Response<proto::RqdStaticRestartIdleResponse>, Status> {
        self.core.host_action_when_idle(HostAction::Restart);
        Ok(Response::new(proto::RqdStaticRestartIdleResponse {}))
    }

    async fn reboot_now(
        &self,
        _request: Request<proto::RqdStaticRebootNowRequest>,
    ) -> Result<Response<proto::RqdStaticRebootNowResponse>, Status> {
        self.core.host_action_now(HostAction::Reboot);
        Ok(Response::new(proto::RqdStaticRebootNowResponse {}))
    }

    async fn reboot_idle(
        &self,
        _request: Request<proto::RqdStaticRebootIdleRequest>,
    ) -> Result<Response<proto::RqdStaticRebootIdleResponse>, Status> {
        self.core.host_action_when_idle(HostAction::Reboot);
        Ok(Response::new(proto::RqdStaticRebootIdleResponse {}))
    }

    async fn nimby_on(
        &self,
        _request: Request<proto::RqdStaticNimbyOnRequest>,
    ) -> Result<Response<proto::RqdStaticNimbyOnResponse>, Status> {
        self.core.nimby_on();
        Ok(Response::new(proto::RqdStaticNimbyOnResponse {}))
    }

    async fn nimby_off(
        &self,
        _request: Request<proto::RqdStaticNimbyOffRequest>,
    ) -> Result<Response<proto::RqdStaticNimbyOffResponse>, Status> {
        self.core.nimby_off();
        Ok(Response::new(proto::RqdStaticNimbyOffResponse {}))
    }

    async fn lock(
        &self,
        request: Request<proto::RqdStaticLockRequest>,
    ) -> Result<Response<proto::RqdStaticLockResponse>, Status> {
        let cores = request.into_inner().cores;
        if cores < 0 {
            return Err(Status::invalid_argument("cores must be non-negative"));
        }
        debug!(cores, "Lock");
        self.core.locks.lock(cores);
        Ok(Response::new(proto::RqdStaticLockResponse {}))
    }

    async fn lock_all(
        &self,
        _request: Request<proto::RqdStaticLockAllRequest>,
    ) -> Result<Response<proto::RqdStaticLockAllResponse>, Status> {
        debug!("LockAll");
        self.core.locks.lock_all();
        Ok(Response::new(proto::RqdStaticLockAllResponse {}))
    }

    async fn unlock(
        &self,
        request: Request<proto::RqdStaticUnlockRequest>,
    ) -> Result<Response<proto::RqdStaticUnlockResponse>, Status> {
        let cores = request.into_inner().cores;
        if cores < 0 {
            return Err(Status::invalid_argument("cores must be non-negative"));
        }
        debug!(cores, "Unlock");
        self.core.locks.unlock(cores);
        Ok(Response::new(proto::RqdStaticUnlockResponse {}))
    }

    async fn unlock_all(
        &self,
        _request: Request<proto::RqdStaticUnlockAllRequest>,
    ) -> Result<Response<proto::RqdStaticUnlockAllResponse>, Status> {
        debug!("UnlockAll");
        self.core.unlock_all();
        Ok(Response::new(proto::RqdStaticUnlockAllResponse {}))
    }
}
