//! Filehandle and attribute operations
//!
//! PUTFH, PUTROOTFH, GETFH, SAVEFH, RESTOREFH, LOOKUP, ACCESS, GETATTR,
//! SETATTR, RENAME.

use bytes::Bytes;
use nfs4d_common::FileHandle;

use super::OpResult;
use crate::error::{NfsError, NfsStatus};
use crate::nfs4::attr::AttributeMap;
use crate::nfs4::compound::{CompoundContext, Nfs4Op, Nfs4OpRes, OpResBody};
use crate::nfs4::state::ShareAccess;
use crate::nfs4::{ChangeInfo, StateId};
use crate::vfs::{FileType, Stat};

/// PUTFH arguments
#[derive(Debug, Clone)]
pub struct PutFhArgs {
    /// Filehandle to set as current (opaque)
    pub object: Bytes,
}

/// Process PUTFH operation
pub fn process_putfh(ctx: &mut CompoundContext, args: &PutFhArgs) -> OpResult {
    let fh = FileHandle::from_bytes(&args.object).map_err(NfsError::from)?;
    ctx.set_current_fh(fh);
    Ok(Nfs4OpRes::ok(Nfs4Op::PutFh, OpResBody::None))
}

/// Process PUTROOTFH operation
pub fn process_putrootfh(ctx: &mut CompoundContext) -> OpResult {
    let root = ctx.fs().root();
    ctx.set_current_fh(root);
    Ok(Nfs4OpRes::ok(Nfs4Op::PutRootFh, OpResBody::None))
}

/// Process GETFH operation
pub fn process_getfh(ctx: &mut CompoundContext) -> OpResult {
    let fh = ctx.current_fh()?;
    Ok(Nfs4OpRes::ok(Nfs4Op::GetFh, OpResBody::GetFh(fh)))
}

/// Process SAVEFH operation
pub fn process_savefh(ctx: &mut CompoundContext) -> OpResult {
    ctx.save_current()?;
    Ok(Nfs4OpRes::ok(Nfs4Op::SaveFh, OpResBody::None))
}

/// Process RESTOREFH operation
pub fn process_restorefh(ctx: &mut CompoundContext) -> OpResult {
    ctx.restore_saved()?;
    Ok(Nfs4OpRes::ok(Nfs4Op::RestoreFh, OpResBody::None))
}

/// LOOKUP arguments
#[derive(Debug, Clone)]
pub struct LookupArgs {
    /// Name to look up
    pub name: String,
}

/// Process LOOKUP operation
pub fn process_lookup(ctx: &mut CompoundContext, args: &LookupArgs) -> OpResult {
    let dir = ctx.current_fh()?;
    match ctx.fs().getattr(&dir)?.file_type {
        FileType::Directory => {}
        FileType::Symlink => return Err(NfsStatus::Symlink.into()),
        FileType::Regular => return Err(NfsStatus::Notdir.into()),
    }
    if args.name.is_empty() {
        return Err(NfsStatus::Inval.into());
    }
    let fh = ctx.fs().lookup(&dir, &args.name)?;
    ctx.set_current_fh(fh);
    Ok(Nfs4OpRes::ok(Nfs4Op::Lookup, OpResBody::None))
}

/// ACCESS arguments
#[derive(Debug, Clone)]
pub struct AccessArgs {
    /// Access bits to check
    pub access: u32,
}

/// ACCESS result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRes {
    /// Access bits the server could evaluate
    pub supported: u32,
    /// Granted access bits
    pub access: u32,
}

/// Process ACCESS operation
pub fn process_access(ctx: &mut CompoundContext, args: &AccessArgs) -> OpResult {
    let fh = ctx.current_fh()?;
    let supported = args.access & 0x3F;
    let access = ctx.fs().access(&fh, &ctx.call().credential, supported)?;
    Ok(Nfs4OpRes::ok(
        Nfs4Op::Access,
        OpResBody::Access(AccessRes { supported, access }),
    ))
}

/// GETATTR arguments
#[derive(Debug, Clone, Default)]
pub struct GetAttrArgs {
    /// Requested attribute bitmap
    pub attr_request: Vec<u32>,
}

/// GETATTR result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAttrRes {
    /// Requested attribute bitmap, echoed for the encoder
    pub attr_request: Vec<u32>,
    /// Object attributes
    pub stat: Stat,
}

/// Process GETATTR operation
pub fn process_getattr(ctx: &mut CompoundContext, args: &GetAttrArgs) -> OpResult {
    let fh = ctx.current_fh()?;
    let stat = ctx.fs().getattr(&fh)?;
    Ok(Nfs4OpRes::ok(
        Nfs4Op::GetAttr,
        OpResBody::GetAttr(GetAttrRes {
            attr_request: args.attr_request.clone(),
            stat,
        }),
    ))
}

/// SETATTR arguments
#[derive(Debug, Clone)]
pub struct SetAttrArgs {
    /// Stateid authorizing a size change
    pub stateid: StateId,
    /// Attribute bitmap
    pub attr_mask: Vec<u32>,
    /// XDR-encoded attribute values
    pub attr_vals: Bytes,
}

/// Process SETATTR operation
pub fn process_setattr(ctx: &mut CompoundContext, args: &SetAttrArgs) -> OpResult {
    let fh = ctx.current_fh()?;
    let attrs = AttributeMap::decode(&args.attr_mask, &args.attr_vals)?;
    let changes = attrs.to_set_attrs()?;

    if changes.size.is_some() {
        let stateid = ctx.resolve_stateid(&args.stateid)?;
        if !stateid.is_special() {
            let state = super::lookup_state(ctx, &stateid, None)?;
            if state.file() != Some(fh) {
                return Err(NfsStatus::BadStateid.into());
            }
            if !state.share().0.contains(ShareAccess::WRITE) {
                return Err(NfsStatus::OpenMode.into());
            }
        }
    }

    if !changes.is_empty() {
        ctx.fs().setattr(&fh, &changes)?;
    }
    Ok(Nfs4OpRes::ok(
        Nfs4Op::SetAttr,
        OpResBody::SetAttr(attrs.applied_bitmap()),
    ))
}

/// RENAME arguments
#[derive(Debug, Clone)]
pub struct RenameArgs {
    /// Name in the saved (source) directory
    pub old_name: String,
    /// Name in the current (target) directory
    pub new_name: String,
}

/// RENAME result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRes {
    /// Source directory change
    pub source: ChangeInfo,
    /// Target directory change
    pub target: ChangeInfo,
}

/// Process RENAME operation
pub fn process_rename(ctx: &mut CompoundContext, args: &RenameArgs) -> OpResult {
    let target = ctx.current_fh()?;
    let source = ctx.saved_fh().map_err(|_| NfsStatus::NoFileHandle)?;
    if args.old_name.is_empty() || args.new_name.is_empty() {
        return Err(NfsStatus::Inval.into());
    }

    let fs = ctx.fs();
    let source_before = fs.getattr(&source)?.change;
    let target_before = fs.getattr(&target)?.change;
    fs.rename(&source, &args.old_name, &target, &args.new_name)?;
    let source_after = fs.getattr(&source)?.change;
    let target_after = fs.getattr(&target)?.change;

    Ok(Nfs4OpRes::ok(
        Nfs4Op::Rename,
        OpResBody::Rename(RenameRes {
            source: ChangeInfo::new(source_before, source_after, false),
            target: ChangeInfo::new(target_before, target_after, false),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::attr::FATTR4_MODE;
    use crate::nfs4::compound::tests::context;
    use crate::rpc::xdr::XdrEncoder;

    #[test]
    fn test_putfh_rejects_garbage() {
        let mut ctx = context(1);
        let args = PutFhArgs {
            object: Bytes::from_static(b"short"),
        };
        assert_eq!(
            process_putfh(&mut ctx, &args).unwrap_err().status(),
            NfsStatus::BadHandle
        );
    }

    #[test]
    fn test_lookup_and_getfh() {
        let mut ctx = context(1);
        let root = ctx.fs().root();
        let fh = ctx
            .fs()
            .create(&root, "file", FileType::Regular, 0, 0, 0o644)
            .unwrap();

        process_putrootfh(&mut ctx).unwrap();
        let args = LookupArgs {
            name: "file".into(),
        };
        process_lookup(&mut ctx, &args).unwrap();
        match process_getfh(&mut ctx).unwrap().body {
            OpResBody::GetFh(got) => assert_eq!(got, fh),
            other => panic!("unexpected body {other:?}"),
        }

        // LOOKUP from a regular file
        assert_eq!(
            process_lookup(&mut ctx, &args).unwrap_err().status(),
            NfsStatus::Notdir
        );
    }

    #[test]
    fn test_getattr_without_fh() {
        let mut ctx = context(1);
        let err = process_getattr(&mut ctx, &GetAttrArgs::default()).unwrap_err();
        assert_eq!(err.status(), NfsStatus::NoFileHandle);
    }

    #[test]
    fn test_setattr_mode() {
        let mut ctx = context(1);
        let root = ctx.fs().root();
        let fh = ctx
            .fs()
            .create(&root, "file", FileType::Regular, 0, 0, 0o644)
            .unwrap();
        ctx.set_current_fh(fh);

        let mut enc = XdrEncoder::new();
        enc.encode_u32(0o600);
        let args = SetAttrArgs {
            stateid: StateId::ANONYMOUS,
            attr_mask: vec![0, 1 << (FATTR4_MODE - 32)],
            attr_vals: enc.finish(),
        };
        process_setattr(&mut ctx, &args).unwrap();
        assert_eq!(ctx.fs().getattr(&fh).unwrap().mode, 0o600);
    }

    #[test]
    fn test_rename_between_directories() {
        let mut ctx = context(1);
        let root = ctx.fs().root();
        let dir = ctx
            .fs()
            .create(&root, "dir", FileType::Directory, 0, 0, 0o755)
            .unwrap();
        ctx.fs()
            .create(&root, "a", FileType::Regular, 0, 0, 0o644)
            .unwrap();

        ctx.set_current_fh(root);
        process_savefh(&mut ctx).unwrap();
        ctx.set_current_fh(dir);

        let args = RenameArgs {
            old_name: "a".into(),
            new_name: "b".into(),
        };
        let res = process_rename(&mut ctx, &args).unwrap();
        match res.body {
            OpResBody::Rename(res) => {
                assert!(res.source.after > res.source.before);
                assert!(res.target.after > res.target.before);
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert!(ctx.fs().lookup(&dir, "b").is_ok());
    }
}
