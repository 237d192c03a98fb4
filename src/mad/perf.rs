// Performance management (GSI class 0x04) plumbing: LID-routed queries
// on QP1 for ClassPortInfo, PortCounters and PortCountersExtended, and
// the PortCounters reset.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use super::fields::{self, PC_COUNTER_SELECT, PC_COUNTER_SELECT2, PC_PORT_SELECT};
use super::types::{ib_mad, ib_mad_addr, ib_user_mad};
use super::{send_recv_match, IbMadPort, IB_DEFAULT_QKEY, IB_MAD_METHOD_GET, IB_MAD_METHOD_SET, IB_PERFORMANCE_CLASS};

pub const CLASS_PORT_INFO: u16 = 0x0001;
pub const IB_GSI_PORT_COUNTERS: u16 = 0x0012;
pub const IB_GSI_PORT_COUNTERS_EXT: u16 = 0x001d;

/// Attribute data area of a performance MAD, sized per the GSI layout
/// (24-byte MAD header, 8-byte PM key, 32 reserved bytes, 192 data
/// bytes).
pub const PM_DATA_LEN: usize = 192;

/// Offset of the PM attribute data within `ib_mad.data`.
pub const PM_DATA_OFFSET: usize = 40;

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
#[allow(non_camel_case_types)]
pub struct perf_mad {
    pub pm_key: u64,
    pub reserved: [u8; 32],
    pub data: [u8; 192],
}

impl perf_mad {
    pub fn to_bytes(&self) -> Vec<u8> {
        unsafe {
            std::slice::from_raw_parts(
                self as *const perf_mad as *const u8,
                std::mem::size_of::<perf_mad>(),
            )
            .to_vec()
        }
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn next_tid() -> u64 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

fn build_perf_umad(
    port: &IbMadPort,
    lid: u16,
    method: u8,
    attr_id: u16,
    pm_data: &[u8; PM_DATA_LEN],
    timeout_ms: u32,
    retries: u32,
) -> ib_user_mad {
    let perf = perf_mad {
        pm_key: 0,
        reserved: [0; 32],
        data: *pm_data,
    };

    let mut mad = ib_mad {
        base_version: 0x1,
        mgmt_class: IB_PERFORMANCE_CLASS,
        class_version: 0x1,
        method,
        status: 0,
        hop_ptr: 0,
        hop_cnt: 0,
        tid: next_tid().to_be(),
        attr_id: attr_id.to_be(),
        additional_status: 0,
        attr_mod: 0,
        data: [0; 232],
    };

    let perf_bytes = perf.to_bytes();
    mad.data[..perf_bytes.len()].copy_from_slice(&perf_bytes);

    let mut umad = ib_user_mad {
        agent_id: port.agent_for(IB_PERFORMANCE_CLASS),
        status: 0,
        timeout_ms,
        retries,
        length: 0,
        addr: ib_mad_addr {
            // GSI MADs go to QP1
            qpn: (1 as u32).to_be(),
            qkey: IB_DEFAULT_QKEY.to_be(),
            lid: lid.to_be(),
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

    let mad_bytes = mad.to_bytes();
    umad.data[..mad_bytes.len()].copy_from_slice(&mad_bytes);

    umad
}

/// Offset of the PM attribute data within `ib_user_mad.data` of a
/// response.
pub const GSI_DATA_OFFSET: usize = 24 + PM_DATA_OFFSET;

/// Sends a PMA query for `attr_id` against the port selected by
/// `portnum` on the node addressed by `lid`, returning the raw attribute
/// data.
pub fn pma_query(
    port: &mut IbMadPort,
    lid: u16,
    portnum: u8,
    attr_id: u16,
    timeout_ms: u32,
    retries: u32,
) -> io::Result<[u8; PM_DATA_LEN]> {
    let mut pm_data = [0u8; PM_DATA_LEN];
    if attr_id != CLASS_PORT_INFO {
        fields::set_field(&mut pm_data, PC_PORT_SELECT, portnum as u64);
    }

    let umad = build_perf_umad(port, lid, IB_MAD_METHOD_GET, attr_id, &pm_data, timeout_ms, retries);
    let resp = send_recv_match(port, &umad, timeout_ms, retries)?;

    let mut out = [0u8; PM_DATA_LEN];
    out.copy_from_slice(&resp.data[GSI_DATA_OFFSET..GSI_DATA_OFFSET + PM_DATA_LEN]);
    Ok(out)
}

/// Resets the PortCounters selected by `select_mask` (bits 0-15 via
/// CounterSelect, bits 16-23 via CounterSelect2).
pub fn pma_reset(
    port: &mut IbMadPort,
    lid: u16,
    portnum: u8,
    select_mask: u32,
    timeout_ms: u32,
    retries: u32,
) -> io::Result<()> {
    let mut pm_data = [0u8; PM_DATA_LEN];
    fields::set_field(&mut pm_data, PC_PORT_SELECT, portnum as u64);
    fields::set_field(&mut pm_data, PC_COUNTER_SELECT, (select_mask & 0xffff) as u64);
    fields::set_field(&mut pm_data, PC_COUNTER_SELECT2, ((select_mask >> 16) & 0xff) as u64);

    let umad = build_perf_umad(
        port,
        lid,
        IB_MAD_METHOD_SET,
        IB_GSI_PORT_COUNTERS,
        &pm_data,
        timeout_ms,
        retries,
    );
    send_recv_match(port, &umad, timeout_ms, retries)?;

    Ok(())
}
