// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ONC RPC call/reply envelope and record-marking framer.
//!
//! Two transports are supported: TCP, where each message is split into one
//! or more record-marked fragments, and UDP, where a single datagram is a
//! complete message. Both deliver the same [`RpcCall`] to the dispatcher.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use xdr::{Packer, Unpacker, XdrError};

pub const MSG_CALL: u32 = 0;
pub const MSG_REPLY: u32 = 1;
pub const RPC_VERSION: u32 = 2;

pub const REPLY_ACCEPTED: u32 = 0;
pub const ACCEPT_SUCCESS: u32 = 0;

pub const AUTH_NULL: u32 = 0;

/// High bit of a TCP record marker flags the final fragment of a message.
const RM_LAST_FRAGMENT: u32 = 0x8000_0000;
const RM_LENGTH_MASK: u32 = 0x7fff_ffff;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("xdr error: {0}")]
    Xdr(#[from] XdrError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("fragment exceeds maximum message size")]
    TooLarge,
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// An opaque authentication credential/verifier, as carried by every call
/// and reply. This gateway only ever presents and expects `AUTH_NULL`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    pub fn null() -> Self {
        Self { flavor: AUTH_NULL, body: Vec::new() }
    }

    fn pack(&self, p: &mut Packer) {
        p.pack_uint(self.flavor);
        p.pack_opaque(&self.body);
    }

    fn unpack(u: &mut Unpacker) -> Result<Self> {
        let flavor = u.unpack_uint()?;
        let body = u.unpack_opaque()?.to_vec();
        Ok(Self { flavor, body })
    }
}

/// A decoded RPC call header. `args` holds the XDR-encoded procedure
/// arguments, unconsumed by this layer, for the dispatcher to decode.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
    pub args: Vec<u8>,
}

/// Parses one full RPC call message (already defragmented, for TCP).
pub fn decode_call(message: &[u8]) -> Result<RpcCall> {
    let mut u = Unpacker::new(message);
    let xid = u.unpack_uint()?;
    let msg_type = u.unpack_uint()?;
    if msg_type != MSG_CALL {
        return Err(RpcError::Xdr(XdrError::Conversion(msg_type)));
    }
    let _rpc_version = u.unpack_uint()?;
    let program = u.unpack_uint()?;
    let version = u.unpack_uint()?;
    let procedure = u.unpack_uint()?;
    let cred = OpaqueAuth::unpack(&mut u)?;
    let verf = OpaqueAuth::unpack(&mut u)?;
    let args = message[u.position()..].to_vec();
    Ok(RpcCall { xid, program, version, procedure, cred, verf, args })
}

/// Packs a `REPLY_ACCEPTED` / `SUCCESS` reply envelope around an
/// already-encoded procedure result.
pub fn encode_success_reply(xid: u32, result: &[u8]) -> Vec<u8> {
    let mut p = Packer::new();
    p.pack_uint(xid);
    p.pack_uint(MSG_REPLY);
    p.pack_uint(REPLY_ACCEPTED);
    OpaqueAuth::null().pack(&mut p);
    p.pack_uint(ACCEPT_SUCCESS);
    let mut bytes = p.into_bytes();
    bytes.extend_from_slice(result);
    bytes
}

/// Reads successive TCP fragments until a last-fragment marker, returning
/// the concatenated payload. Returns `Ok(None)` on clean EOF before any
/// bytes of a new message are read (the framer's sole signal that the
/// client disconnected).
pub async fn read_tcp_message<R>(reader: &mut R, max_message_size: usize) -> Result<Option<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut message = Vec::new();
    loop {
        let mut marker_buf = [0u8; 4];
        match reader.read_exact(&mut marker_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && message.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(RpcError::Io(e)),
        }
        let marker = u32::from_be_bytes(marker_buf);
        let last = marker & RM_LAST_FRAGMENT != 0;
        let len = (marker & RM_LENGTH_MASK) as usize;
        if message.len() + len > max_message_size {
            return Err(RpcError::TooLarge);
        }
        let mut fragment = vec![0u8; len];
        reader.read_exact(&mut fragment).await?;
        message.extend_from_slice(&fragment);
        if last {
            break;
        }
    }
    Ok(Some(message))
}

/// Writes `payload` as a single, last-fragment TCP record.
pub async fn write_tcp_message<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let marker = RM_LAST_FRAGMENT | (payload.len() as u32 & RM_LENGTH_MASK);
    writer.write_all(&marker.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reply_envelope_shape() {
        let bytes = encode_success_reply(42, &[9, 9]);
        let mut u = Unpacker::new(&bytes);
        assert_eq!(u.unpack_uint().unwrap(), 42);
        assert_eq!(u.unpack_uint().unwrap(), MSG_REPLY);
        assert_eq!(u.unpack_uint().unwrap(), REPLY_ACCEPTED);
        assert_eq!(u.unpack_uint().unwrap(), AUTH_NULL); // verf flavor
        assert_eq!(u.unpack_opaque().unwrap(), &[] as &[u8]); // verf body
        assert_eq!(u.unpack_uint().unwrap(), ACCEPT_SUCCESS);
        assert_eq!(&bytes[u.position()..], &[9, 9]);
    }

    #[test]
    fn decode_call_splits_header_from_args() {
        let mut p = Packer::new();
        p.pack_uint(7); // xid
        p.pack_uint(MSG_CALL);
        p.pack_uint(RPC_VERSION);
        p.pack_uint(0x0607AF); // program
        p.pack_uint(1); // version
        p.pack_uint(10); // procedure
        OpaqueAuth::null().pack(&mut p);
        OpaqueAuth::null().pack(&mut p);
        p.pack_uint(0xAAAA_BBBB); // arg payload begins here
        let bytes = p.into_bytes();

        let call = decode_call(&bytes).unwrap();
        assert_eq!(call.xid, 7);
        assert_eq!(call.program, 0x0607AF);
        assert_eq!(call.version, 1);
        assert_eq!(call.procedure, 10);
        let mut au = Unpacker::new(&call.args);
        assert_eq!(au.unpack_uint().unwrap(), 0xAAAA_BBBB);
    }

    #[tokio::test]
    async fn tcp_roundtrip_single_fragment() {
        let payload = b"hello fragment".to_vec();
        let mut wire = Vec::new();
        write_tcp_message(&mut wire, &payload).await.unwrap();

        // high bit of the marker must always be set on emitted records
        let marker = u32::from_be_bytes(wire[0..4].try_into().unwrap());
        assert_ne!(marker & RM_LAST_FRAGMENT, 0);

        let mut cursor = std::io::Cursor::new(wire);
        let got = read_tcp_message(&mut cursor, 1 << 20).await.unwrap().unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn tcp_roundtrip_multi_fragment() {
        let part_a = vec![1u8; 10];
        let part_b = vec![2u8; 5];
        let mut wire = Vec::new();
        let marker_a = (part_a.len() as u32) & RM_LENGTH_MASK; // not last
        wire.extend_from_slice(&marker_a.to_be_bytes());
        wire.extend_from_slice(&part_a);
        let marker_b = RM_LAST_FRAGMENT | (part_b.len() as u32);
        wire.extend_from_slice(&marker_b.to_be_bytes());
        wire.extend_from_slice(&part_b);

        let mut cursor = std::io::Cursor::new(wire);
        let got = read_tcp_message(&mut cursor, 1 << 20).await.unwrap().unwrap();
        let mut expected = part_a;
        expected.extend_from_slice(&part_b);
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn clean_eof_before_any_fragment_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let got = read_tcp_message(&mut cursor, 1 << 20).await.unwrap();
        assert!(got.is_none());
    }
}
