//! RPC caller identity
//!
//! The transport decodes ONC RPC headers and authentication; the server core
//! only sees who is calling and over which connection.

pub mod xdr;

use std::net::{Ipv4Addr, SocketAddr};

/// NFS program number
pub const NFS_PROGRAM: u32 = 100003;

/// NFS version 4
pub const NFS_V4: u32 = 4;

/// Authentication flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum AuthFlavor {
    /// AUTH_NONE
    None = 0,
    /// AUTH_SYS (traditional UNIX credentials)
    #[default]
    Sys = 1,
    /// RPCSEC_GSS
    Gss = 6,
}

/// Caller credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCredential {
    /// Authentication flavor
    pub flavor: AuthFlavor,
    /// User id
    pub uid: u32,
    /// Primary group id
    pub gid: u32,
    /// Secondary group ids
    pub gids: Vec<u32>,
    /// Authenticated principal (GSS only)
    pub principal: Option<String>,
}

impl RpcCredential {
    /// AUTH_SYS credential
    pub fn sys(uid: u32, gid: u32, gids: Vec<u32>) -> Self {
        Self {
            flavor: AuthFlavor::Sys,
            uid,
            gid,
            gids,
            principal: None,
        }
    }

    /// RPCSEC_GSS credential mapped to a local identity
    pub fn gss(principal: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            flavor: AuthFlavor::Gss,
            uid,
            gid,
            gids: Vec::new(),
            principal: Some(principal.into()),
        }
    }

    /// Principal used to tie client records to their creator
    ///
    /// Only GSS callers carry one; everyone else maps to the empty principal.
    pub fn principal(&self) -> &str {
        match (self.flavor, &self.principal) {
            (AuthFlavor::Gss, Some(principal)) => principal,
            _ => "",
        }
    }

    /// True if `gid` is the primary or a secondary group
    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.gids.contains(&gid)
    }
}

/// One incoming call: who sent it and over which connection
#[derive(Debug, Clone)]
pub struct RpcCall {
    /// Caller credential
    pub credential: RpcCredential,
    /// Client address
    pub remote_addr: SocketAddr,
    /// Server address the call arrived on
    pub local_addr: SocketAddr,
}

impl RpcCall {
    /// Create a call descriptor
    pub fn new(credential: RpcCredential, remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            credential,
            remote_addr,
            local_addr,
        }
    }

    /// Local call from `uid`/`gid`, for embedding and tests
    pub fn local(uid: u32, gid: u32) -> Self {
        let loopback = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        Self::new(
            RpcCredential::sys(uid, gid, Vec::new()),
            loopback,
            SocketAddr::from((Ipv4Addr::LOCALHOST, 2049)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_only_for_gss() {
        let mut sys = RpcCredential::sys(1000, 1000, vec![10]);
        sys.principal = Some("ignored".into());
        assert_eq!(sys.principal(), "");
        assert!(sys.in_group(10));

        let gss = RpcCredential::gss("alice@EXAMPLE.COM", 1000, 1000);
        assert_eq!(gss.principal(), "alice@EXAMPLE.COM");
    }
}
