// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VXI-11 `DEVICE_CORE` program numbers, procedure numbers, error codes,
//! and the XDR encodings of its RPCL parameter/response structs.

use xdr::{Packer, Result as XdrResult, Unpacker};

pub const DEVICE_CORE: u32 = 0x0607AF;
pub const DEVICE_ASYNC: u32 = 0x0607B0;
pub const DEVICE_INTR: u32 = 0x0607B1;
pub const DEVICE_CORE_VERSION: u32 = 1;

pub mod procedure {
    pub const CREATE_LINK: u32 = 10;
    pub const DEVICE_WRITE: u32 = 11;
    pub const DEVICE_READ: u32 = 12;
    pub const DEVICE_READSTB: u32 = 13;
    pub const DEVICE_TRIGGER: u32 = 14;
    pub const DEVICE_CLEAR: u32 = 15;
    pub const DEVICE_REMOTE: u32 = 16;
    pub const DEVICE_LOCAL: u32 = 17;
    pub const DEVICE_LOCK: u32 = 18;
    pub const DEVICE_UNLOCK: u32 = 19;
    pub const DEVICE_ENABLE_SRQ: u32 = 20;
    pub const DEVICE_DOCMD: u32 = 22;
    pub const DESTROY_LINK: u32 = 23;
    pub const CREATE_INTR_CHAN: u32 = 25;
    pub const DESTROY_INTR_CHAN: u32 = 26;
}

/// `reason` bit returned from DEVICE_READ when the transfer ended because
/// the device indicated end-of-data (e.g. an adapter-specific terminator).
pub const RX_REQCNT: u32 = 0x01;
pub const RX_CHR: u32 = 0x02;
pub const RX_END: u32 = 0x04;

/// VXI-11 error codes, spec.md §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceErrorCode {
    NoError = 0,
    SyntaxError = 1,
    DeviceNotAccessible = 3,
    InvalidLinkIdentifier = 4,
    ParameterError = 5,
    ChannelNotEstablished = 6,
    OperationNotSupported = 8,
    OutOfResources = 9,
    DeviceLockedByAnotherLink = 11,
    NoLockHeldByThisLink = 12,
    IoTimeout = 15,
    IoError = 17,
    Abort = 23,
    ChannelAlreadyEstablished = 29,
}

impl DeviceErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone)]
pub struct CreateLinkParms {
    pub client_id: i32,
    pub lock_device: bool,
    pub lock_timeout_ms: u32,
    pub device: String,
}

pub fn unpack_create_link_parms(u: &mut Unpacker) -> XdrResult<CreateLinkParms> {
    Ok(CreateLinkParms {
        client_id: u.unpack_int()?,
        lock_device: u.unpack_bool()?,
        lock_timeout_ms: u.unpack_uint()?,
        device: u.unpack_string()?,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct CreateLinkResp {
    pub error: DeviceErrorCode,
    pub lid: u32,
    pub abort_port: u16,
    pub max_recv_size: u32,
}

pub fn pack_create_link_resp(p: &mut Packer, resp: &CreateLinkResp) {
    p.pack_uint(resp.error.code());
    p.pack_uint(resp.lid);
    p.pack_uint(resp.abort_port as u32);
    p.pack_uint(resp.max_recv_size);
}

#[derive(Debug, Clone)]
pub struct DeviceWriteParms {
    pub lid: u32,
    pub io_timeout_ms: u32,
    pub lock_timeout_ms: u32,
    pub flags: u32,
    pub data: Vec<u8>,
}

pub fn unpack_device_write_parms(u: &mut Unpacker) -> XdrResult<DeviceWriteParms> {
    Ok(DeviceWriteParms {
        lid: u.unpack_uint()?,
        io_timeout_ms: u.unpack_uint()?,
        lock_timeout_ms: u.unpack_uint()?,
        flags: u.unpack_uint()?,
        data: u.unpack_opaque()?.to_vec(),
    })
}

pub fn pack_device_write_resp(p: &mut Packer, error: DeviceErrorCode, bytes_written: u32) {
    p.pack_uint(error.code());
    p.pack_uint(bytes_written);
}

#[derive(Debug, Clone)]
pub struct DeviceReadParms {
    pub lid: u32,
    pub request_size: u32,
    pub io_timeout_ms: u32,
    pub lock_timeout_ms: u32,
    pub flags: u32,
    pub term_char: u8,
}

pub fn unpack_device_read_parms(u: &mut Unpacker) -> XdrResult<DeviceReadParms> {
    Ok(DeviceReadParms {
        lid: u.unpack_uint()?,
        request_size: u.unpack_uint()?,
        io_timeout_ms: u.unpack_uint()?,
        lock_timeout_ms: u.unpack_uint()?,
        flags: u.unpack_uint()?,
        term_char: u.unpack_uint()? as u8,
    })
}

pub fn pack_device_read_resp(p: &mut Packer, error: DeviceErrorCode, reason: u32, data: &[u8]) {
    p.pack_uint(error.code());
    p.pack_uint(reason);
    p.pack_opaque(data);
}

#[derive(Debug, Clone)]
pub struct DeviceLockParms {
    pub lid: u32,
    pub flags: u32,
    pub lock_timeout_ms: u32,
}

pub fn unpack_device_lock_parms(u: &mut Unpacker) -> XdrResult<DeviceLockParms> {
    Ok(DeviceLockParms {
        lid: u.unpack_uint()?,
        flags: u.unpack_uint()?,
        lock_timeout_ms: u.unpack_uint()?,
    })
}

/// `device_generic_parms`, used by DEVICE_UNLOCK and DESTROY_LINK (and the
/// unsupported handlers that merely need the link identifier).
pub fn unpack_device_link(u: &mut Unpacker) -> XdrResult<u32> {
    u.unpack_uint()
}

pub fn pack_device_error(p: &mut Packer, error: DeviceErrorCode) {
    p.pack_uint(error.code());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_link_parms_roundtrip() {
        let mut p = Packer::new();
        p.pack_int(7);
        p.pack_bool(true);
        p.pack_uint(500);
        p.pack_string("loopback0");
        let bytes = p.into_bytes();
        let mut u = Unpacker::new(&bytes);
        let parms = unpack_create_link_parms(&mut u).unwrap();
        assert_eq!(parms.client_id, 7);
        assert!(parms.lock_device);
        assert_eq!(parms.lock_timeout_ms, 500);
        assert_eq!(parms.device, "loopback0");
    }

    #[test]
    fn create_link_resp_shape() {
        let mut p = Packer::new();
        pack_create_link_resp(
            &mut p,
            &CreateLinkResp {
                error: DeviceErrorCode::NoError,
                lid: 1,
                abort_port: 0,
                max_recv_size: 1024,
            },
        );
        let bytes = p.into_bytes();
        let mut u = Unpacker::new(&bytes);
        assert_eq!(u.unpack_uint().unwrap(), 0);
        assert_eq!(u.unpack_uint().unwrap(), 1);
        assert_eq!(u.unpack_uint().unwrap(), 0);
        assert_eq!(u.unpack_uint().unwrap(), 1024);
    }
}
