// Wire and kernel ABI structs. Layouts are fixed by ib_user_mad.h and the
// IBTA MAD base header; all multi-byte fields are big-endian on the wire
// and are stored here exactly as received.

use std::io;
use std::mem::MaybeUninit;

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
#[allow(non_camel_case_types)]
pub struct ib_mad {
    pub base_version: u8,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub method: u8,
    pub status: u16,
    pub hop_ptr: u8,
    pub hop_cnt: u8,
    pub tid: u64,
    pub attr_id: u16,
    pub additional_status: u16,
    pub attr_mod: u32,
    pub data: [u8; 232],
}

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
#[allow(non_camel_case_types)]
pub struct ib_mad_addr {
    pub qpn: u32,
    pub qkey: u32,
    pub lid: u16,
    pub sl: u8,
    pub path_bits: u8,
    pub grh_present: u8,
    pub gid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub gid: [u8; 16],
    pub flow_label: u32,
    pub pkey_index: u16,
    pub reserved: [u8; 6],
}

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
#[allow(non_camel_case_types)]
pub struct ib_user_mad {
    pub agent_id: u32,
    pub status: u32,
    pub timeout_ms: u32,
    pub retries: u32,
    pub length: u32,
    pub addr: ib_mad_addr,
    pub data: [u8; 256],
}

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
#[allow(non_camel_case_types)]
pub struct dr_smp_mad {
    pub m_key: u64,
    pub drslid: u16,
    pub drdlid: u16,
    pub reserved: [u8; 28],
    pub attr_layout: [u8; 64],
    pub initial_path: [u8; 64],
    pub return_path: [u8; 64],
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
#[repr(C, packed)]
#[allow(non_camel_case_types)]
pub struct node_info {
    pub base_version: u8,
    pub class_version: u8,
    pub node_type: u8,
    pub nports: u8,
    pub system_guid: u64,
    pub node_guid: u64,
    pub port_guid: u64,
    pub partition_cap: u16,
    pub device_id: u16,
    pub revision: u32,
    pub local_port: u8,
    pub vendor_id: [u8; 3],
    pub reserved: [u8; 24],
}

macro_rules! raw_bytes_impl {
    ($t:ty) => {
        impl $t {
            pub fn to_bytes(&self) -> Vec<u8> {
                unsafe {
                    std::slice::from_raw_parts(
                        self as *const $t as *const u8,
                        std::mem::size_of::<$t>(),
                    )
                    .to_vec()
                }
            }

            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                if bytes.len() < std::mem::size_of::<$t>() {
                    return None;
                }
                let mut val = MaybeUninit::<$t>::uninit();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        val.as_mut_ptr() as *mut u8,
                        std::mem::size_of::<$t>(),
                    );
                    Some(val.assume_init())
                }
            }
        }
    };
}

raw_bytes_impl!(ib_mad);
raw_bytes_impl!(ib_mad_addr);
raw_bytes_impl!(ib_user_mad);
raw_bytes_impl!(dr_smp_mad);
raw_bytes_impl!(node_info);

// Offset of the MAD transaction ID within ib_user_mad.data (the 8-byte
// TID follows the first eight header bytes of the embedded MAD).
const TID_OFFSET: usize = 8;

impl ib_user_mad {
    /// Transaction ID of the embedded MAD, as sent (big-endian raw).
    pub fn get_tid(&self) -> Result<u64, io::Error> {
        let bytes: [u8; 8] = self.data[TID_OFFSET..TID_OFFSET + 8]
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "MAD too short for TID"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn is_tid_equal(&self, other: &ib_user_mad) -> bool {
        self.data[TID_OFFSET..TID_OFFSET + 8] == other.data[TID_OFFSET..TID_OFFSET + 8]
    }
}
