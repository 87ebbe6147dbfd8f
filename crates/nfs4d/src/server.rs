//! COMPOUND dispatch
//!
//! [`NfsServer`] owns the shared server objects and runs each COMPOUND
//! request against a fresh [`CompoundContext`]. Operations run in order and
//! the first failure ends the compound. For NFSv4.1 the slot claimed by
//! SEQUENCE is released (and advanced, for new requests) once the compound
//! finishes, whatever its outcome.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use nfs4d_common::{InMemoryLockManager, LockManager};
use tracing::{debug, error, info, info_span, warn};

use crate::config::NfsConfig;
use crate::error::{NfsError, NfsResult, NfsStatus};
use crate::nfs4::client::ClientSummary;
use crate::nfs4::compound::{
    CompoundArgs, CompoundContext, CompoundRes, Nfs4Op, Nfs4OpRes, ServerResources,
};
use crate::nfs4::ops;
use crate::nfs4::state_handler::StateHandler;
use crate::nfs4::NFS4_MAX_MINOR_VERSION;
use crate::rpc::RpcCall;
use crate::vfs::VirtualFileSystem;

/// NFSv4 server state and dispatcher
#[derive(Clone)]
pub struct NfsServer {
    resources: ServerResources,
}

impl NfsServer {
    /// Create a server over `fs` with an in-memory lock manager
    pub fn new(config: NfsConfig, fs: Arc<dyn VirtualFileSystem>) -> Self {
        Self::with_lock_manager(config, fs, Arc::new(InMemoryLockManager::new()))
    }

    /// Create a server with a caller-supplied lock manager
    pub fn with_lock_manager(
        config: NfsConfig,
        fs: Arc<dyn VirtualFileSystem>,
        lock_manager: Arc<dyn LockManager>,
    ) -> Self {
        let state_handler = Arc::new(StateHandler::new(&config));
        info!(
            lease = ?config.lease_time,
            grace = ?config.grace_period,
            max_minor_version = config.max_minor_version,
            "NFSv4 server state initialized"
        );
        Self {
            resources: ServerResources {
                config: Arc::new(config),
                fs,
                state_handler,
                lock_manager,
            },
        }
    }

    /// Server configuration
    pub fn config(&self) -> &NfsConfig {
        &self.resources.config
    }

    /// Client/session registry
    pub fn state_handler(&self) -> &Arc<StateHandler> {
        &self.resources.state_handler
    }

    /// Byte-range lock manager
    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.resources.lock_manager
    }

    /// Execute one COMPOUND request
    ///
    /// Never fails as a whole: errors are reported through the per-operation
    /// statuses and the compound status.
    pub fn execute_compound(&self, call: &RpcCall, args: CompoundArgs) -> CompoundRes {
        let span = info_span!(
            "compound",
            tag = %args.tag,
            minor = args.minor_version,
            client = %call.remote_addr,
            ops = args.ops.len(),
        );
        let _enter = span.enter();

        let mut res = CompoundRes::new(args.tag.clone());
        let minor_version = args.minor_version;
        if minor_version > self.config().max_minor_version.min(NFS4_MAX_MINOR_VERSION) {
            debug!("unsupported minor version");
            res.status = NfsStatus::MinorVersMismatch;
            return res;
        }
        // v4.1 compounds are bounded by the session's negotiated max_ops
        if minor_version == 0 && args.ops.len() > self.config().max_compound_ops as usize {
            res.status = NfsStatus::Resource;
            return res;
        }

        let mut ctx = CompoundContext::new(
            self.resources.clone(),
            call.clone(),
            minor_version,
            args.ops.len(),
        );

        for op_args in &args.ops {
            let position = ctx.next_operation();
            let op = op_args.op();

            if let Err(status) = check_position(op, position, minor_version) {
                res.add_result(Nfs4OpRes::error(op, status));
                break;
            }

            let result = match panic::catch_unwind(AssertUnwindSafe(|| {
                ops::execute(&mut ctx, op_args)
            })) {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    log_failure(op, &err);
                    Nfs4OpRes::error(op, err.status())
                }
                Err(_) => {
                    error!(?op, position, "operation panicked");
                    Nfs4OpRes::error(op, NfsStatus::ServerFault)
                }
            };
            let failed = result.status != NfsStatus::Ok;
            res.add_result(result);
            if failed {
                break;
            }

            if let Some(cached) = ctx.cache() {
                for result in cached.iter().skip(1) {
                    res.add_result(result.clone());
                }
                break;
            }
        }

        if let Some(claim) = ctx.take_slot() {
            match claim.session.slot(claim.slot_id) {
                Ok(slot) if claim.fresh => {
                    let reply = claim.cache_this.then(|| Arc::new(res.results.clone()));
                    slot.release_and_advance(reply);
                }
                Ok(slot) => slot.release(),
                Err(status) => warn!(slot = claim.slot_id, %status, "claimed slot vanished"),
            }
        }

        debug!(status = %res.status, results = res.results.len(), "compound done");
        res
    }

    /// Execute a COMPOUND on the blocking pool
    pub async fn dispatch(&self, call: RpcCall, args: CompoundArgs) -> NfsResult<CompoundRes> {
        let server = self.clone();
        tokio::task::spawn_blocking(move || server.execute_compound(&call, args))
            .await
            .map_err(|err| NfsError::Internal(format!("compound task failed: {err}")))
    }

    /// Summaries of every registered client
    pub fn list_clients(&self) -> Vec<ClientSummary> {
        self.resources.state_handler.list_clients()
    }

    /// Dispose every client and its state
    pub fn shutdown(&self) {
        info!(clients = self.resources.state_handler.client_count(), "shutting down");
        self.resources.state_handler.shutdown();
    }
}

impl std::fmt::Debug for NfsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsServer")
            .field("config", &self.resources.config)
            .field("state_handler", &self.resources.state_handler)
            .finish()
    }
}

/// Per-operation checks made before the operation runs
fn check_position(op: Nfs4Op, position: usize, minor_version: u32) -> Result<(), NfsStatus> {
    op.check_minor_version(minor_version)?;
    if minor_version == 0 || !op.is_position_checked() {
        return Ok(());
    }
    if position == 0 && !op.may_start_compound() {
        return Err(NfsStatus::OpNotInSession);
    }
    if position > 0 && op == Nfs4Op::Sequence {
        return Err(NfsStatus::SequencePos);
    }
    Ok(())
}

fn log_failure(op: Nfs4Op, err: &NfsError) {
    match err.status() {
        NfsStatus::ServerFault => error!(?op, %err, "operation failed"),
        NfsStatus::BadXdr | NfsStatus::Io => warn!(?op, %err, "operation failed"),
        status => debug!(?op, %status, "operation failed"),
    }
}
