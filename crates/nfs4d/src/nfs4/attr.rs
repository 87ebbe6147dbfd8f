//! fattr4 decoding for SETATTR and OPEN(create)
//!
//! A client sends a bitmap of attribute ids plus the XDR-encoded values in
//! ascending id order. Only settable attributes are accepted here; anything
//! else (read-only or unknown ids) is `Inval`.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{NfsError, NfsResult, NfsStatus};
use crate::rpc::xdr::XdrDecoder;
use crate::vfs::{SetAttrs, SetTime};

/// FATTR4_SIZE
pub const FATTR4_SIZE: u32 = 4;
/// FATTR4_ACL
pub const FATTR4_ACL: u32 = 12;
/// FATTR4_ARCHIVE
pub const FATTR4_ARCHIVE: u32 = 14;
/// FATTR4_HIDDEN
pub const FATTR4_HIDDEN: u32 = 25;
/// FATTR4_MIMETYPE
pub const FATTR4_MIMETYPE: u32 = 27;
/// FATTR4_MODE
pub const FATTR4_MODE: u32 = 33;
/// FATTR4_OWNER
pub const FATTR4_OWNER: u32 = 36;
/// FATTR4_OWNER_GROUP
pub const FATTR4_OWNER_GROUP: u32 = 37;
/// FATTR4_SYSTEM
pub const FATTR4_SYSTEM: u32 = 45;
/// FATTR4_TIME_ACCESS_SET
pub const FATTR4_TIME_ACCESS_SET: u32 = 48;
/// FATTR4_TIME_BACKUP
pub const FATTR4_TIME_BACKUP: u32 = 49;
/// FATTR4_TIME_CREATE
pub const FATTR4_TIME_CREATE: u32 = 50;
/// FATTR4_TIME_MODIFY_SET
pub const FATTR4_TIME_MODIFY_SET: u32 = 54;

const SET_TO_SERVER_TIME: u32 = 0;
const SET_TO_CLIENT_TIME: u32 = 1;

/// One decoded attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// New size
    Size(u64),
    /// Archive flag
    Archive(bool),
    /// Hidden flag
    Hidden(bool),
    /// MIME type
    Mimetype(String),
    /// Permission bits
    Mode(u32),
    /// Owner string
    Owner(String),
    /// Owner group string
    OwnerGroup(String),
    /// System flag
    System(bool),
    /// Access time to set
    TimeAccessSet(SetTime),
    /// Backup time
    TimeBackup(SystemTime),
    /// Creation time
    TimeCreate(SystemTime),
    /// Modification time to set
    TimeModifySet(SetTime),
}

/// Decoded attribute set, keyed by attribute id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMap {
    values: BTreeMap<u32, AttrValue>,
}

fn xdr(err: std::io::Error) -> NfsError {
    NfsError::Xdr(err.to_string())
}

fn decode_time(dec: &mut XdrDecoder) -> NfsResult<SystemTime> {
    let seconds = dec.decode_i64().map_err(xdr)?;
    let nanos = dec.decode_u32().map_err(xdr)?;
    if nanos >= 1_000_000_000 {
        return Err(NfsStatus::Inval.into());
    }
    let time = if seconds >= 0 {
        UNIX_EPOCH.checked_add(Duration::new(seconds as u64, nanos))
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(seconds.unsigned_abs()))
            .and_then(|t| t.checked_add(Duration::from_nanos(u64::from(nanos))))
    };
    time.ok_or_else(|| NfsStatus::Inval.into())
}

fn decode_set_time(dec: &mut XdrDecoder) -> NfsResult<SetTime> {
    match dec.decode_u32().map_err(xdr)? {
        SET_TO_SERVER_TIME => Ok(SetTime::ServerTime),
        SET_TO_CLIENT_TIME => Ok(SetTime::ClientTime(decode_time(dec)?)),
        _ => Err(NfsError::Xdr("bad time_how".into())),
    }
}

fn decode_value(id: u32, dec: &mut XdrDecoder) -> NfsResult<AttrValue> {
    let value = match id {
        FATTR4_SIZE => AttrValue::Size(dec.decode_u64().map_err(xdr)?),
        FATTR4_ARCHIVE => AttrValue::Archive(dec.decode_bool().map_err(xdr)?),
        FATTR4_HIDDEN => AttrValue::Hidden(dec.decode_bool().map_err(xdr)?),
        FATTR4_MIMETYPE => AttrValue::Mimetype(dec.decode_string().map_err(xdr)?),
        FATTR4_MODE => AttrValue::Mode(dec.decode_u32().map_err(xdr)? & 0o7777),
        FATTR4_OWNER => AttrValue::Owner(dec.decode_string().map_err(xdr)?),
        FATTR4_OWNER_GROUP => AttrValue::OwnerGroup(dec.decode_string().map_err(xdr)?),
        FATTR4_SYSTEM => AttrValue::System(dec.decode_bool().map_err(xdr)?),
        FATTR4_TIME_ACCESS_SET => AttrValue::TimeAccessSet(decode_set_time(dec)?),
        FATTR4_TIME_BACKUP => AttrValue::TimeBackup(decode_time(dec)?),
        FATTR4_TIME_CREATE => AttrValue::TimeCreate(decode_time(dec)?),
        FATTR4_TIME_MODIFY_SET => AttrValue::TimeModifySet(decode_set_time(dec)?),
        FATTR4_ACL => return Err(NfsStatus::AttrNotsupp.into()),
        _ => return Err(NfsStatus::Inval.into()),
    };
    Ok(value)
}

/// Map an owner string to a numeric id; `name@domain` uses the name part
fn parse_principal_id(value: &str) -> NfsResult<u32> {
    let name = value.split_once('@').map_or(value, |(name, _)| name);
    name.parse().map_err(|_| NfsStatus::BadOwner.into())
}

impl AttributeMap {
    /// Decode `data` as the values of the attributes named in `bitmap`
    pub fn decode(bitmap: &[u32], data: &[u8]) -> NfsResult<Self> {
        let mut dec = XdrDecoder::new(data);
        let mut values = BTreeMap::new();

        for (word_index, word) in bitmap.iter().enumerate() {
            for bit in 0..32 {
                if word & (1 << bit) == 0 {
                    continue;
                }
                let id = word_index as u32 * 32 + bit;
                values.insert(id, decode_value(id, &mut dec)?);
            }
        }

        if dec.remaining() != 0 {
            return Err(NfsError::Xdr(format!(
                "{} trailing bytes after attributes",
                dec.remaining()
            )));
        }
        Ok(Self { values })
    }

    /// Value for attribute `id`
    pub fn get(&self, id: u32) -> Option<&AttrValue> {
        self.values.get(&id)
    }

    /// Number of decoded attributes
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no attributes were sent
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bitmap of the attributes [`AttributeMap::to_set_attrs`] applies
    pub fn applied_bitmap(&self) -> Vec<u32> {
        let mut bitmap = vec![0u32; 2];
        for (id, value) in &self.values {
            let applied = matches!(
                value,
                AttrValue::Size(_)
                    | AttrValue::Mode(_)
                    | AttrValue::Owner(_)
                    | AttrValue::OwnerGroup(_)
                    | AttrValue::TimeAccessSet(_)
                    | AttrValue::TimeModifySet(_)
            );
            if applied {
                bitmap[(id / 32) as usize] |= 1 << (id % 32);
            }
        }
        bitmap
    }

    /// Changes the filesystem backend can apply
    ///
    /// Flags, MIME type and backup/create times are accepted but not stored.
    pub fn to_set_attrs(&self) -> NfsResult<SetAttrs> {
        let mut attrs = SetAttrs::default();
        for value in self.values.values() {
            match value {
                AttrValue::Size(size) => attrs.size = Some(*size),
                AttrValue::Mode(mode) => attrs.mode = Some(*mode),
                AttrValue::Owner(owner) => attrs.uid = Some(parse_principal_id(owner)?),
                AttrValue::OwnerGroup(group) => attrs.gid = Some(parse_principal_id(group)?),
                AttrValue::TimeAccessSet(time) => attrs.atime = Some(*time),
                AttrValue::TimeModifySet(time) => attrs.mtime = Some(*time),
                _ => {}
            }
        }
        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::xdr::XdrEncoder;

    fn bitmap(ids: &[u32]) -> Vec<u32> {
        let mut words = vec![0u32; 2];
        for id in ids {
            words[(id / 32) as usize] |= 1 << (id % 32);
        }
        words
    }

    #[test]
    fn test_decode_size_and_mode() {
        let mut enc = XdrEncoder::new();
        enc.encode_u64(4096);
        enc.encode_u32(0o100644);
        let data = enc.finish();

        let attrs = AttributeMap::decode(&bitmap(&[FATTR4_SIZE, FATTR4_MODE]), &data).unwrap();
        assert_eq!(attrs.get(FATTR4_SIZE), Some(&AttrValue::Size(4096)));
        assert_eq!(attrs.get(FATTR4_MODE), Some(&AttrValue::Mode(0o644)));

        let set = attrs.to_set_attrs().unwrap();
        assert_eq!(set.size, Some(4096));
        assert_eq!(set.mode, Some(0o644));
    }

    #[test]
    fn test_decode_owner_and_times() {
        let mut enc = XdrEncoder::new();
        enc.encode_string("1000@example.org");
        enc.encode_string("100");
        enc.encode_u32(SET_TO_SERVER_TIME);
        enc.encode_u32(SET_TO_CLIENT_TIME);
        enc.encode_i64(10);
        enc.encode_u32(5);
        let data = enc.finish();

        let ids = [
            FATTR4_OWNER,
            FATTR4_OWNER_GROUP,
            FATTR4_TIME_ACCESS_SET,
            FATTR4_TIME_MODIFY_SET,
        ];
        let set = AttributeMap::decode(&bitmap(&ids), &data)
            .unwrap()
            .to_set_attrs()
            .unwrap();
        assert_eq!(set.uid, Some(1000));
        assert_eq!(set.gid, Some(100));
        assert_eq!(set.atime, Some(SetTime::ServerTime));
        assert_eq!(
            set.mtime,
            Some(SetTime::ClientTime(UNIX_EPOCH + Duration::new(10, 5)))
        );
    }

    #[test]
    fn test_read_only_attribute_rejected() {
        // FATTR4_TYPE (1) is read-only
        let err = AttributeMap::decode(&bitmap(&[1]), &[0, 0, 0, 1]).unwrap_err();
        assert_eq!(err.status(), NfsStatus::Inval);

        let err = AttributeMap::decode(&bitmap(&[FATTR4_ACL]), &[0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.status(), NfsStatus::AttrNotsupp);
    }

    #[test]
    fn test_truncated_value_is_bad_xdr() {
        let err = AttributeMap::decode(&bitmap(&[FATTR4_SIZE]), &[0, 0, 0, 1]).unwrap_err();
        assert_eq!(err.status(), NfsStatus::BadXdr);

        let err = AttributeMap::decode(&bitmap(&[]), &[0, 0, 0, 1]).unwrap_err();
        assert_eq!(err.status(), NfsStatus::BadXdr);
    }

    #[test]
    fn test_flags_not_applied() {
        let mut enc = XdrEncoder::new();
        enc.encode_bool(true);
        enc.encode_u32(0o600);
        let data = enc.finish();

        let attrs = AttributeMap::decode(&bitmap(&[FATTR4_HIDDEN, FATTR4_MODE]), &data).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.applied_bitmap(), bitmap(&[FATTR4_MODE]));
    }

    #[test]
    fn test_bad_owner() {
        let mut enc = XdrEncoder::new();
        enc.encode_string("alice@example.org");
        let data = enc.finish();

        let attrs = AttributeMap::decode(&bitmap(&[FATTR4_OWNER]), &data).unwrap();
        assert_eq!(
            attrs.to_set_attrs().unwrap_err().status(),
            NfsStatus::BadOwner
        );
    }
}
