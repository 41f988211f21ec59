// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USBTMC (USB Test & Measurement Class) adapter (`usbtmc.py`). Frames
//! writes as `DEV_DEP_MSG_OUT` bulk-out messages and reads as
//! `REQUEST_DEV_DEP_MSG_IN`/`DEV_DEP_MSG_IN` exchanges per the USBTMC
//! (USB488) message header, claiming the instrument's bulk interface
//! exclusively for the adapter's lifetime.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use adapter::{parse_termination, Adapter, AdapterError, DeviceOptions};
use async_trait::async_trait;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use serde::Deserialize;

const USBTMC_DEV_DEP_MSG_OUT: u8 = 1;
const USBTMC_REQUEST_DEV_DEP_MSG_IN: u8 = 2;
const USBTMC_DEV_DEP_MSG_IN: u8 = 2;

#[derive(Debug, Deserialize)]
struct Settings {
    vid: VidPid,
    pid: VidPid,
    serial: Option<String>,
    #[serde(default = "default_timeout")]
    timeout: f64,
    write_termination: Option<String>,
    read_termination: Option<String>,
}

fn default_timeout() -> f64 {
    1.0
}

/// Accepts a hex string (`"0x0957"`), a decimal string, or a YAML integer
/// for `vid`/`pid`, mirroring `usbtmc.py`'s `int(v, 16)` fallback.
#[derive(Debug, Clone, Copy)]
struct VidPid(u16);

impl<'de> Deserialize<'de> for VidPid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Str(String),
        }
        let raw = Raw::deserialize(deserializer)?;
        let value = match raw {
            Raw::Int(n) => n as u16,
            Raw::Str(s) => {
                let s = s.trim();
                let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    u16::from_str_radix(hex, 16)
                } else {
                    s.parse::<u16>().or_else(|_| u16::from_str_radix(s, 16))
                };
                parsed.map_err(serde::de::Error::custom)?
            }
        };
        Ok(VidPid(value))
    }
}

struct Endpoints {
    interface: u8,
    bulk_out: u8,
    bulk_in: u8,
}

fn find_endpoints<T: UsbContext>(device: &Device<T>) -> Result<Endpoints, AdapterError> {
    let config = device
        .active_config_descriptor()
        .map_err(|e| AdapterError::Open(format!("failed to read config descriptor: {e}")))?;
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            let mut bulk_out = None;
            let mut bulk_in = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::Out => bulk_out = Some(endpoint.address()),
                    Direction::In => bulk_in = Some(endpoint.address()),
                }
            }
            if let (Some(out), Some(inp)) = (bulk_out, bulk_in) {
                return Ok(Endpoints { interface: interface.number(), bulk_out: out, bulk_in: inp });
            }
        }
    }
    Err(AdapterError::Open("no bulk in/out endpoint pair found on any interface".into()))
}

fn find_device(vid: u16, pid: u16, serial: Option<&str>) -> Result<(Device<Context>, DeviceHandle<Context>), AdapterError> {
    let context = Context::new().map_err(|e| AdapterError::Open(format!("failed to initialize libusb context: {e}")))?;
    let devices = context.devices().map_err(|e| AdapterError::Open(format!("failed to enumerate USB devices: {e}")))?;
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if descriptor.vendor_id() != vid || descriptor.product_id() != pid {
            continue;
        }
        let handle = match device.open() {
            Ok(h) => h,
            Err(_) => continue,
        };
        if let Some(wanted) = serial {
            let matches = handle
                .read_serial_number_string_ascii(&descriptor)
                .map(|s| s == wanted)
                .unwrap_or(false);
            if !matches {
                continue;
            }
        }
        return Ok((device, handle));
    }
    Err(AdapterError::Open(format!(
        "no USBTMC device found for vid=0x{vid:04x} pid=0x{pid:04x}{}",
        serial.map(|s| format!(" serial={s:?}")).unwrap_or_default()
    )))
}

struct OpenDevice {
    handle: DeviceHandle<Context>,
    bulk_out: u8,
    bulk_in: u8,
}

pub struct UsbtmcAdapter {
    vid: u16,
    pid: u16,
    serial: Option<String>,
    timeout: Duration,
    write_term: Option<Vec<u8>>,
    read_term: Option<Vec<u8>>,
    next_tag: AtomicU8,
    device: StdMutex<Option<OpenDevice>>,
}

fn next_tag(counter: &AtomicU8) -> u8 {
    loop {
        let prev = counter.fetch_add(1, Ordering::SeqCst);
        let tag = prev.wrapping_add(1);
        if tag != 0 {
            return tag;
        }
    }
}

impl UsbtmcAdapter {
    pub fn new(name: &str, options: &DeviceOptions) -> Result<Self, AdapterError> {
        let settings: Settings =
            serde_yaml::from_value(options.clone()).map_err(|e| AdapterError::Config(format!("device {name:?} usbtmc: {e}")))?;
        Ok(Self {
            vid: settings.vid.0,
            pid: settings.pid.0,
            serial: settings.serial,
            timeout: Duration::from_secs_f64(settings.timeout),
            write_term: parse_termination(settings.write_termination.as_deref()),
            read_term: parse_termination(settings.read_termination.as_deref()),
            next_tag: AtomicU8::new(0),
            device: StdMutex::new(None),
        })
    }

    fn open_blocking(vid: u16, pid: u16, serial: Option<String>) -> Result<OpenDevice, AdapterError> {
        let (device, mut handle) = find_device(vid, pid, serial.as_deref())?;
        let endpoints = find_endpoints(&device)?;
        let _ = handle.set_active_configuration(1);
        handle
            .claim_interface(endpoints.interface)
            .map_err(|e| AdapterError::Open(format!("failed to claim USBTMC interface: {e}")))?;
        Ok(OpenDevice { handle, bulk_out: endpoints.bulk_out, bulk_in: endpoints.bulk_in })
    }

    /// Builds one `DEV_DEP_MSG_OUT` bulk-out message: a 12-byte USBTMC
    /// header followed by `payload`, zero-padded to a 4-byte boundary.
    fn build_dev_dep_msg_out(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(12 + payload.len() + 3);
        msg.push(USBTMC_DEV_DEP_MSG_OUT);
        msg.push(tag);
        msg.push(!tag);
        msg.push(0);
        msg.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        msg.push(0x01); // bmTransferAttributes: EOM set, this is the only/last transfer
        msg.extend_from_slice(&[0, 0, 0]);
        msg.extend_from_slice(payload);
        while msg.len() % 4 != 0 {
            msg.push(0);
        }
        msg
    }

    /// Builds one `REQUEST_DEV_DEP_MSG_IN` bulk-out message requesting up
    /// to `max_len` bytes back from the device.
    fn build_request_dev_dep_msg_in(tag: u8, max_len: u32) -> [u8; 12] {
        let mut msg = [0u8; 12];
        msg[0] = USBTMC_REQUEST_DEV_DEP_MSG_IN;
        msg[1] = tag;
        msg[2] = !tag;
        msg[3] = 0;
        msg[4..8].copy_from_slice(&max_len.to_le_bytes());
        msg
    }

    /// Strips the 12-byte `DEV_DEP_MSG_IN` header from a bulk-in response,
    /// returning the payload it declares (ignoring any trailing padding).
    fn parse_dev_dep_msg_in(response: &[u8]) -> Result<&[u8], AdapterError> {
        if response.len() < 12 {
            return Err(AdapterError::Transport("USBTMC response shorter than header".into()));
        }
        if response[0] != USBTMC_DEV_DEP_MSG_IN {
            return Err(AdapterError::Transport(format!("unexpected USBTMC message ID {:#04x}", response[0])));
        }
        let transfer_size = u32::from_le_bytes(response[4..8].try_into().unwrap()) as usize;
        let available = response.len() - 12;
        let len = transfer_size.min(available);
        Ok(&response[12..12 + len])
    }
}

#[async_trait]
impl Adapter for UsbtmcAdapter {
    async fn acquire(&self) -> Result<(), AdapterError> {
        let vid = self.vid;
        let pid = self.pid;
        let serial = self.serial.clone();
        let opened = tokio::task::spawn_blocking(move || Self::open_blocking(vid, pid, serial))
            .await
            .map_err(|e| AdapterError::Open(format!("usbtmc open task panicked: {e}")))??;
        *self.device.lock().unwrap() = Some(opened);
        Ok(())
    }

    async fn release(&self) {
        self.device.lock().unwrap().take();
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let mut payload = data.to_vec();
        if let Some(term) = &self.write_term {
            if !payload.ends_with(term.as_slice()) {
                payload.extend_from_slice(term);
            }
        }
        let tag = next_tag(&self.next_tag);
        let message = Self::build_dev_dep_msg_out(tag, &payload);
        let timeout = self.timeout;
        let payload_len = payload.len();

        let write_result = {
            let guard = self.device.lock().unwrap();
            let open = guard.as_ref().ok_or_else(|| AdapterError::Transport("USBTMC device is not connected".into()))?;
            open.handle.write_bulk(open.bulk_out, &message, timeout)
        };
        write_result.map_err(|e| AdapterError::Transport(format!("USBTMC bulk write failed: {e}")))?;
        tracing::debug!(vid = self.vid, pid = self.pid, bytes = payload_len, "usbtmc write");
        Ok(data.len())
    }

    async fn read(&self, max_bytes: usize) -> Result<Vec<u8>, AdapterError> {
        let target = max_bytes.clamp(1, u32::MAX as usize) as u32;
        let tag = next_tag(&self.next_tag);
        let request = Self::build_request_dev_dep_msg_in(tag, target);
        let timeout = self.timeout;

        let response = {
            let guard = self.device.lock().unwrap();
            let open = guard.as_ref().ok_or_else(|| AdapterError::Transport("USBTMC device is not connected".into()))?;
            open.handle
                .write_bulk(open.bulk_out, &request, timeout)
                .map_err(|e| AdapterError::Transport(format!("USBTMC IN request failed: {e}")))?;
            let mut buf = vec![0u8; 12 + target as usize + 3];
            let n = open
                .handle
                .read_bulk(open.bulk_in, &mut buf, timeout)
                .map_err(|e| AdapterError::Transport(format!("USBTMC bulk read failed: {e}")))?;
            buf.truncate(n);
            buf
        };

        let payload = Self::parse_dev_dep_msg_in(&response)?.to_vec();
        let trimmed = match &self.read_term {
            Some(term) if payload.ends_with(term.as_slice()) => payload[..payload.len() - term.len()].to_vec(),
            _ => payload,
        };
        tracing::debug!(vid = self.vid, pid = self.pid, bytes = trimmed.len(), "usbtmc read");
        Ok(trimmed)
    }

    fn requires_lock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(yaml: &str) -> DeviceOptions {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn missing_vid_or_pid_rejected() {
        assert!(UsbtmcAdapter::new("bench1", &opts("pid: 0x1755")).is_err());
        assert!(UsbtmcAdapter::new("bench1", &opts("vid: 0x0957")).is_err());
    }

    #[test]
    fn accepts_hex_and_decimal_vid_pid() {
        let a = UsbtmcAdapter::new("bench1", &opts("vid: \"0x0957\"\npid: \"0x1755\"")).unwrap();
        assert_eq!(a.vid, 0x0957);
        assert_eq!(a.pid, 0x1755);

        let b = UsbtmcAdapter::new("bench1", &opts("vid: 2391\npid: 5973")).unwrap();
        assert_eq!(b.vid, 2391);
        assert_eq!(b.pid, 5973);
    }

    #[test]
    fn requires_lock_is_always_true() {
        let a = UsbtmcAdapter::new("bench1", &opts("vid: 1\npid: 1")).unwrap();
        assert!(a.requires_lock());
    }

    #[test]
    fn dev_dep_msg_out_header_shape_and_padding() {
        let msg = UsbtmcAdapter::build_dev_dep_msg_out(7, b"*IDN?\n");
        assert_eq!(msg[0], USBTMC_DEV_DEP_MSG_OUT);
        assert_eq!(msg[1], 7);
        assert_eq!(msg[2], !7u8);
        assert_eq!(u32::from_le_bytes(msg[4..8].try_into().unwrap()), 6);
        assert_eq!(msg.len() % 4, 0);
    }

    #[test]
    fn parse_dev_dep_msg_in_extracts_declared_payload() {
        let mut response = vec![USBTMC_DEV_DEP_MSG_IN, 1, !1u8, 0];
        response.extend_from_slice(&5u32.to_le_bytes());
        response.extend_from_slice(&[0x01, 0, 0, 0]);
        response.extend_from_slice(b"hello");
        response.extend_from_slice(&[0, 0, 0]); // padding
        let payload = UsbtmcAdapter::parse_dev_dep_msg_in(&response).unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn next_tag_skips_zero_and_wraps() {
        let counter = AtomicU8::new(254);
        assert_eq!(next_tag(&counter), 255);
        assert_eq!(next_tag(&counter), 1);
    }
}
