//! READ and WRITE

use bytes::Bytes;
use nfs4d_common::FileHandle;
use tracing::trace;

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::nfs4::compound::{CompoundContext, Nfs4Op, Nfs4OpRes, OpResBody};
use crate::nfs4::state::ShareAccess;
use crate::nfs4::{StateId, Verifier};
use crate::vfs::FileType;

/// stable_how4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StableHow {
    /// Data may be cached
    Unstable = 0,
    /// Data committed, metadata may be cached
    DataSync = 1,
    /// Data and metadata committed
    FileSync = 2,
}

impl TryFrom<u32> for StableHow {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unstable),
            1 => Ok(Self::DataSync),
            2 => Ok(Self::FileSync),
            _ => Err(NfsStatus::Inval),
        }
    }
}

/// Check the stateid authorizing I/O on `fh`
///
/// The anonymous stateid is always accepted; the read-bypass stateid only
/// when `allow_bypass` is set.
fn check_io_stateid(
    ctx: &CompoundContext,
    presented: &StateId,
    fh: &FileHandle,
    needed: ShareAccess,
    allow_bypass: bool,
) -> NfsResult<()> {
    let stateid = ctx.resolve_stateid(presented)?;
    if stateid.is_anonymous() {
        return Ok(());
    }
    if stateid.is_read_bypass() {
        return if allow_bypass {
            Ok(())
        } else {
            Err(NfsStatus::BadStateid.into())
        };
    }

    let state = super::lookup_state(ctx, &stateid, None)?;
    if ctx.minor_version() == 0 {
        ctx.state_handler()
            .update_client_lease_by_stateid(&state.stateid())?;
    }
    if state.file().as_ref() != Some(fh) {
        return Err(NfsStatus::BadStateid.into());
    }
    if !state.share().0.contains(needed) {
        return Err(NfsStatus::OpenMode.into());
    }
    Ok(())
}

/// Only regular files carry data
fn check_regular(ctx: &CompoundContext, fh: &FileHandle) -> NfsResult<()> {
    match ctx.fs().getattr(fh)?.file_type {
        FileType::Regular => Ok(()),
        FileType::Directory => Err(NfsStatus::Isdir.into()),
        FileType::Symlink => Err(NfsStatus::Inval.into()),
    }
}

/// READ arguments
#[derive(Debug, Clone)]
pub struct ReadArgs {
    /// Stateid authorizing the read
    pub stateid: StateId,
    /// Offset
    pub offset: u64,
    /// Requested byte count
    pub count: u32,
}

/// READ result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRes {
    /// End of file reached
    pub eof: bool,
    /// Data read
    pub data: Bytes,
}

/// Process READ operation
pub fn process_read(ctx: &mut CompoundContext, args: &ReadArgs) -> OpResult {
    let fh = ctx.current_fh()?;
    check_regular(ctx, &fh)?;
    check_io_stateid(ctx, &args.stateid, &fh, ShareAccess::READ, true)?;

    let count = args.count.min(ctx.config().max_read_size);
    let (data, eof) = ctx.fs().read(&fh, args.offset, count)?;
    trace!(offset = args.offset, len = data.len(), eof, "read");
    Ok(Nfs4OpRes::ok(Nfs4Op::Read, OpResBody::Read(ReadRes { eof, data })))
}

/// WRITE arguments
#[derive(Debug, Clone)]
pub struct WriteArgs {
    /// Stateid authorizing the write
    pub stateid: StateId,
    /// Offset
    pub offset: u64,
    /// Requested stability
    pub stable: StableHow,
    /// Data to write
    pub data: Bytes,
}

/// WRITE result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRes {
    /// Bytes written
    pub count: u32,
    /// Stability actually achieved
    pub committed: StableHow,
    /// Server write verifier
    pub verifier: Verifier,
}

/// Process WRITE operation
///
/// The backend applies writes synchronously, so every write is reported as
/// `FileSync`.
pub fn process_write(ctx: &mut CompoundContext, args: &WriteArgs) -> OpResult {
    let fh = ctx.current_fh()?;
    check_regular(ctx, &fh)?;
    if args.data.len() > ctx.config().max_write_size as usize {
        return Err(NfsStatus::Inval.into());
    }
    check_io_stateid(ctx, &args.stateid, &fh, ShareAccess::WRITE, false)?;

    let count = ctx.fs().write(&fh, args.offset, &args.data)?;
    trace!(offset = args.offset, count, stable = ?args.stable, "write");
    Ok(Nfs4OpRes::ok(
        Nfs4Op::Write,
        OpResBody::Write(WriteRes {
            count,
            committed: StableHow::FileSync,
            verifier: ctx.state_handler().write_verifier(),
        }),
    ))
}
