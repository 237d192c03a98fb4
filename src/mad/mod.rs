use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd};
use std::time;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::ca::Hca;
use crate::{dump_bytes, ib_user_mad_enable_pkey, ib_user_mad_reg_req, ib_user_mad_register_agent};

pub mod fields;
pub mod perf;
pub mod types;

pub use fields::port_info;
pub use types::{dr_smp_mad, ib_mad, ib_mad_addr, ib_user_mad, node_info};

pub const IB_SMI_CLASS: u8 = 0x1;
pub const IB_SA_CLASS: u8 = 0x3;
pub const IB_PERFORMANCE_CLASS: u8 = 0x4;
pub const IB_SMI_DIRECT_CLASS: u8 = 0x81;

pub const IB_MAD_METHOD_GET: u8 = 0x1;
pub const IB_MAD_METHOD_SET: u8 = 0x2;
pub const IB_MAD_METHOD_GET_RESP: u8 = 0x81;

pub const IB_DEFAULT_QKEY: u32 = 0x80010000;

/// Management classes registered for a monitoring transport: subnet
/// management (LID and directed route) plus subnet administration and
/// performance management.
pub const DEFAULT_MGMT_CLASSES: [u8; 4] = [
    IB_SMI_CLASS,
    IB_SA_CLASS,
    IB_PERFORMANCE_CLASS,
    IB_SMI_DIRECT_CLASS,
];

/// An open umad character device with the agents registered on it.
/// Closing the file unregisters the agents, so dropping the port is the
/// transport teardown.
#[derive(Debug)]
pub struct IbMadPort {
    pub file: fs::File,
    pub agents: HashMap<u8, u32>,
}

impl IbMadPort {
    /// Agent ID registered for a management class, or zero when the port
    /// was constructed without registration (tests).
    pub fn agent_for(&self, mgmt_class: u8) -> u32 {
        self.agents.get(&mgmt_class).copied().unwrap_or(0)
    }
}

/// Opens the adapter's umad character device and registers one agent per
/// requested management class.
pub fn open_transport(hca: &Hca, classes: &[u8]) -> Result<IbMadPort, io::Error> {
    let path = hca.umad_dev_path.as_ref().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("HCA {} has no UMAD character device", hca.name),
        )
    })?;

    let file = fs::File::options()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            log::debug!("open_transport - error opening {:?}: {}", path, e);
            e
        })?;

    let mut port = IbMadPort {
        file,
        agents: HashMap::new(),
    };

    let fd = port.file.as_raw_fd();
    match unsafe { ib_user_mad_enable_pkey(fd) } {
        Ok(rc) => log::debug!("open_transport - enabled PKeys, rc: {}", rc),
        Err(e) => {
            log::debug!("open_transport - error enabling PKeys: {}", e);
            return Err(io::Error::new(io::ErrorKind::Other, e));
        }
    }

    for &mgmt_class in classes {
        let agent_id = register_agent(&mut port, mgmt_class)?;
        port.agents.insert(mgmt_class, agent_id);
    }

    Ok(port)
}

pub fn register_agent(port: &mut IbMadPort, mgmt_class: u8) -> Result<u32, io::Error> {
    let mut req = ib_user_mad_reg_req {
        id: 0,
        method_mask: unsafe { MaybeUninit::<[u32; 4]>::zeroed().assume_init() },
        qpn: if mgmt_class == IB_SMI_CLASS || mgmt_class == IB_SMI_DIRECT_CLASS {
            0
        } else {
            1
        },
        mgmt_class,
        mgmt_class_version: 1,
        oui: unsafe { MaybeUninit::<[u8; 3]>::zeroed().assume_init() },
        rmpp_version: 0,
    };

    let req_ptr: *mut ib_user_mad_reg_req = &mut req;
    let fd = port.file.as_raw_fd();
    let r = unsafe { ib_user_mad_register_agent(fd, req_ptr) };
    match r {
        Ok(_rc) => {
            log::debug!(
                "register_agent - registered class 0x{:02x}, agent_id: {}",
                mgmt_class,
                req.id
            );
            Ok(req.id)
        }
        Err(e) => {
            log::debug!(
                "register_agent - failed to register class 0x{:02x}, errno: {}",
                mgmt_class,
                e
            );
            Err(io::Error::new(io::ErrorKind::Other, e))
        }
    }
}

pub fn send(port: &mut IbMadPort, umad: &ib_user_mad) -> io::Result<usize> {
    if port.file.as_raw_fd() < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid file descriptor"));
    }
    if umad.length as usize > umad.data.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "length exceeds buffer"));
    }
    let bytes = umad.to_bytes();
    log::trace!("send - MAD bytes:\n{}", dump_bytes(&bytes));
    port.file.write(&bytes)
}

pub fn recv(port: &mut IbMadPort, umad: &mut ib_user_mad, timeout_ms: u32) -> io::Result<usize> {
    if port.file.as_raw_fd() < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid file descriptor"));
    }

    {
        let mut fds = [PollFd::new(port.file.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(timeout_ms.min(i32::MAX as u32) as i32)
            .unwrap_or(PollTimeout::MAX);
        let n = poll(&mut fds, timeout).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for MAD"));
        }
    }

    let mut buf = vec![0u8; std::mem::size_of::<ib_user_mad>()];
    let rc = port.file.read(&mut buf)?;
    log::trace!("recv - MAD bytes:\n{}", dump_bytes(&buf));
    if rc != buf.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
    }
    if let Some(val) = ib_user_mad::from_bytes(&buf) {
        *umad = val;
    } else {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "length incorrect"));
    }
    Ok(rc)
}

/// Sends a umad and waits for the response with a matching transaction
/// ID, retrying with doubled timeouts. Mismatched responses are
/// discarded.
pub fn send_recv_match(
    port: &mut IbMadPort,
    umad_to_send: &ib_user_mad,
    timeout_ms: u32,
    retries: u32,
) -> io::Result<ib_user_mad> {
    let mut current_timeout = timeout_ms;
    let backoff_factor = 2;
    let expected_tid = umad_to_send.get_tid()?;

    for attempt in 0..=retries {
        log::trace!(
            "-> Sending MAD with TID 0x{:X} (Attempt {}/{})",
            expected_tid,
            attempt + 1,
            retries + 1
        );
        if let Err(e) = send(port, umad_to_send) {
            log::debug!("Fatal error sending MAD with TID 0x{:X}: {:?}", expected_tid, e);
            return Err(io::Error::new(e.kind(), format!("Fatal send error: {}", e)));
        }

        let deadline = time::Instant::now() + time::Duration::from_millis(current_timeout as u64);

        loop {
            let now = time::Instant::now();
            if now >= deadline {
                log::debug!(
                    "Attempt {} timed out waiting for TID 0x{:X}",
                    attempt + 1,
                    expected_tid
                );
                break;
            }
            let remaining_time = (deadline - now).as_millis() as u32;
            let mut recv_umad = ib_user_mad {
                agent_id: 0,
                status: 0,
                timeout_ms: timeout_ms,
                retries,
                length: 0,
                addr: ib_mad_addr {
                    qpn: 0,
                    qkey: IB_DEFAULT_QKEY.to_be(),
                    lid: 0xffff,
                    sl: 0,
                    path_bits: 0,
                    grh_present: 0,
                    hop_limit: 63,
                    gid_index: 0,
                    traffic_class: 0,
                    gid: [0; 16],
                    flow_label: 0,
                    pkey_index: 0,
                    reserved: [0; 6],
                },
                data: [0; 256],
            };

            match recv(port, &mut recv_umad, remaining_time) {
                Ok(_) => {
                    if umad_to_send.is_tid_equal(&recv_umad) {
                        log::trace!("<- Matched response for TID 0x{:X}", expected_tid);
                        return Ok(recv_umad);
                    } else {
                        log::trace!(
                            "Discarding mismatched TID. Expected 0x{:X}, got 0x{:X}",
                            expected_tid,
                            recv_umad.get_tid().unwrap_or(0)
                        );
                        continue;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "Receive error on attempt {} for TID 0x{:X}: {:?}",
                        attempt + 1,
                        expected_tid,
                        e,
                    );
                    continue;
                }
            }
        }
        current_timeout *= backoff_factor;
    }

    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("All {} retries failed for TID {}", retries, expected_tid),
    ))
}
