// IBTA attribute layouts as bit-field tables, plus typed views over raw
// attribute blobs. Offsets are bit positions within the attribute data
// area, per the layout tables in the IBTA specification.

/// One bit-field within an attribute blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub width: usize,
}

pub fn get_bitfield(data: &[u8], bit_offset: usize, width: usize) -> u64 {
    assert!((1..=64).contains(&width), "width must be 1-64");

    let start_byte = bit_offset / 8;
    let pos_in_first_byte = bit_offset % 8;
    let needed_bytes = (pos_in_first_byte + width + 7) / 8;

    assert!(start_byte + needed_bytes <= data.len(), "buffer too short");

    let mut tmp = 0u128;
    for &b in &data[start_byte..start_byte + needed_bytes] {
        tmp = (tmp << 8) | b as u128;
    }

    let leading = needed_bytes * 8 - (pos_in_first_byte + width);
    let val = (tmp >> leading) & ((1u128 << width) - 1);

    val as u64
}

pub fn set_bitfield(data: &mut [u8], bit_offset: usize, width: usize, val: u64) {
    assert!((1..=64).contains(&width), "width must be 1-64");
    let val = if width < 64 {
        val & ((1 << width) - 1)
    } else {
        val
    };

    let start_byte = bit_offset / 8;
    let pos_in_first_byte = bit_offset % 8;
    let needed_bytes = (pos_in_first_byte + width + 7) / 8;
    let end_byte = start_byte + needed_bytes;

    assert!(end_byte <= data.len(), "buffer too short");

    let mut cur_val = 0u128;
    for &b in &data[start_byte..end_byte] {
        cur_val = (cur_val << 8) | b as u128;
    }

    let total_bits = needed_bytes * 8;
    let shift = total_bits - (pos_in_first_byte + width);

    let mask = ((1u128 << width) - 1) << shift;
    let mut new_val = (cur_val & !mask) | ((val as u128) << shift);

    for i in (start_byte..end_byte).rev() {
        data[i] = (new_val & 0xff) as u8;
        new_val >>= 8;
    }
}

/// Extracts a bit-field from a raw attribute blob.
pub fn get_field(data: &[u8], f: Field) -> u64 {
    get_bitfield(data, f.offset, f.width)
}

/// Stores a bit-field into a raw attribute blob.
pub fn set_field(data: &mut [u8], f: Field, val: u64) {
    set_bitfield(data, f.offset, f.width, val)
}

// PortInfo (SMP attribute 0x15)
pub const PORT_INFO_MKEY: Field = Field { offset: 0, width: 64 };
pub const PORT_INFO_GID_PREFIX: Field = Field { offset: 64, width: 64 };
pub const PORT_INFO_LID: Field = Field { offset: 128, width: 16 };
pub const PORT_INFO_SM_LID: Field = Field { offset: 144, width: 16 };
pub const PORT_INFO_CAP_MASK: Field = Field { offset: 160, width: 32 };
pub const PORT_INFO_LOCAL_PORT: Field = Field { offset: 224, width: 8 };
pub const PORT_INFO_LINK_WIDTH_ENABLED: Field = Field { offset: 232, width: 8 };
pub const PORT_INFO_LINK_WIDTH_SUPPORTED: Field = Field { offset: 240, width: 8 };
pub const PORT_INFO_LINK_WIDTH_ACTIVE: Field = Field { offset: 248, width: 8 };
pub const PORT_INFO_LINK_SPEED_SUPPORTED: Field = Field { offset: 256, width: 4 };
pub const PORT_INFO_PORT_STATE: Field = Field { offset: 260, width: 4 };
pub const PORT_INFO_PHYS_STATE: Field = Field { offset: 264, width: 4 };
pub const PORT_INFO_LINK_SPEED_ACTIVE: Field = Field { offset: 280, width: 4 };
pub const PORT_INFO_LINK_SPEED_ENABLED: Field = Field { offset: 284, width: 4 };
pub const PORT_INFO_LINK_SPEED_EXT_ACTIVE: Field = Field { offset: 488, width: 4 };
pub const PORT_INFO_LINK_SPEED_EXT_SUPPORTED: Field = Field { offset: 492, width: 4 };

// ClassPortInfo (PerfMgt attribute 0x01)
pub const CPI_BASE_VERSION: Field = Field { offset: 0, width: 8 };
pub const CPI_CLASS_VERSION: Field = Field { offset: 8, width: 8 };
pub const CPI_CAP_MASK: Field = Field { offset: 16, width: 16 };

// PortCounters (PerfMgt attribute 0x12)
pub const PC_PORT_SELECT: Field = Field { offset: 8, width: 8 };
pub const PC_COUNTER_SELECT: Field = Field { offset: 16, width: 16 };
pub const PC_ERR_SYM: Field = Field { offset: 32, width: 16 };
pub const PC_LINK_RECOVERS: Field = Field { offset: 48, width: 8 };
pub const PC_LINK_DOWNED: Field = Field { offset: 56, width: 8 };
pub const PC_ERR_RCV: Field = Field { offset: 64, width: 16 };
pub const PC_ERR_PHYSRCV: Field = Field { offset: 80, width: 16 };
pub const PC_ERR_SWITCH_REL: Field = Field { offset: 96, width: 16 };
pub const PC_XMT_DISCARDS: Field = Field { offset: 112, width: 16 };
pub const PC_ERR_XMTCONSTR: Field = Field { offset: 128, width: 8 };
pub const PC_ERR_RCVCONSTR: Field = Field { offset: 136, width: 8 };
pub const PC_COUNTER_SELECT2: Field = Field { offset: 144, width: 8 };
pub const PC_ERR_LOCALINTEG: Field = Field { offset: 152, width: 4 };
pub const PC_ERR_EXCESS_OVR: Field = Field { offset: 156, width: 4 };
pub const PC_VL15_DROPPED: Field = Field { offset: 176, width: 16 };
pub const PC_XMT_WAIT: Field = Field { offset: 320, width: 32 };

// PortCountersExtended (PerfMgt attribute 0x1D)
pub const PC_EXT_PORT_SELECT: Field = Field { offset: 8, width: 8 };
pub const PC_EXT_COUNTER_SELECT: Field = Field { offset: 16, width: 16 };
pub const PC_EXT_XMT_BYTES: Field = Field { offset: 64, width: 64 };
pub const PC_EXT_RCV_BYTES: Field = Field { offset: 128, width: 64 };
pub const PC_EXT_XMT_PKTS: Field = Field { offset: 192, width: 64 };
pub const PC_EXT_RCV_PKTS: Field = Field { offset: 256, width: 64 };
pub const PC_EXT_XMT_UPKTS: Field = Field { offset: 320, width: 64 };
pub const PC_EXT_RCV_UPKTS: Field = Field { offset: 384, width: 64 };
pub const PC_EXT_XMT_MPKTS: Field = Field { offset: 448, width: 64 };
pub const PC_EXT_RCV_MPKTS: Field = Field { offset: 512, width: 64 };

// Mellanox ExtendedPortInfo (vendor SMP attribute 0xff90)
pub const MLNX_EXT_PORT_STATE_CHANGE_ENABLE: Field = Field { offset: 16, width: 8 };
pub const MLNX_EXT_PORT_LINK_SPEED_SUPPORTED: Field = Field { offset: 24, width: 8 };
pub const MLNX_EXT_PORT_LINK_SPEED_ENABLED: Field = Field { offset: 40, width: 8 };
pub const MLNX_EXT_PORT_LINK_SPEED_ACTIVE: Field = Field { offset: 56, width: 8 };

/// FDR10 bit within the Mellanox extended link speed fields.
pub const FDR10: u64 = 0x01;

// Capability mask bits, in network byte order so they can be compared
// directly against the on-wire mask words (CL_HTON convention).
pub const IB_PORT_CAP_HAS_EXT_SPEEDS: u32 = (1u32 << 14).to_be();

pub const IB_PM_ALL_PORT_SELECT: u16 = (1u16 << 8).to_be();
pub const IB_PM_EXT_WIDTH_SUPPORTED: u16 = (1u16 << 9).to_be();
pub const IB_PM_EXT_WIDTH_NOIETF_SUP: u16 = (1u16 << 10).to_be();
pub const IB_PM_PC_XMIT_WAIT_SUP: u16 = (1u16 << 12).to_be();

/// Raw PortInfo attribute data with named bit-field accessors.
#[derive(Clone, Copy, Debug, PartialEq)]
#[allow(non_camel_case_types)]
pub struct port_info {
    pub data: [u8; 64],
}

impl Default for port_info {
    fn default() -> Self {
        port_info { data: [0; 64] }
    }
}

impl port_info {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 64 {
            return None;
        }
        let mut data = [0u8; 64];
        data.copy_from_slice(&bytes[..64]);
        Some(port_info { data })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn m_key(&self) -> u64 {
        get_field(&self.data, PORT_INFO_MKEY)
    }

    pub fn set_mkey(&mut self, val: u64) {
        set_field(&mut self.data, PORT_INFO_MKEY, val)
    }

    pub fn lid(&self) -> u16 {
        get_field(&self.data, PORT_INFO_LID) as u16
    }

    pub fn set_lid(&mut self, val: u16) {
        set_field(&mut self.data, PORT_INFO_LID, val as u64)
    }

    pub fn cap_mask(&self) -> u32 {
        get_field(&self.data, PORT_INFO_CAP_MASK) as u32
    }

    pub fn set_cap_mask(&mut self, val: u32) {
        set_field(&mut self.data, PORT_INFO_CAP_MASK, val as u64)
    }

    pub fn local_portnum(&self) -> u8 {
        get_field(&self.data, PORT_INFO_LOCAL_PORT) as u8
    }

    pub fn set_local_portnum(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_LOCAL_PORT, val as u64)
    }

    pub fn port_state(&self) -> u8 {
        get_field(&self.data, PORT_INFO_PORT_STATE) as u8
    }

    pub fn set_port_state(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_PORT_STATE, val as u64)
    }

    pub fn port_physical_state(&self) -> u8 {
        get_field(&self.data, PORT_INFO_PHYS_STATE) as u8
    }

    pub fn set_port_physical_state(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_PHYS_STATE, val as u64)
    }

    pub fn link_width_active(&self) -> u8 {
        get_field(&self.data, PORT_INFO_LINK_WIDTH_ACTIVE) as u8
    }

    pub fn set_link_width_active(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_LINK_WIDTH_ACTIVE, val as u64)
    }

    pub fn link_width_supported(&self) -> u8 {
        get_field(&self.data, PORT_INFO_LINK_WIDTH_SUPPORTED) as u8
    }

    pub fn set_link_width_supported(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_LINK_WIDTH_SUPPORTED, val as u64)
    }

    pub fn set_link_width_enabled(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_LINK_WIDTH_ENABLED, val as u64)
    }

    pub fn link_speed_active(&self) -> u8 {
        get_field(&self.data, PORT_INFO_LINK_SPEED_ACTIVE) as u8
    }

    pub fn set_link_speed_active(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_LINK_SPEED_ACTIVE, val as u64)
    }

    pub fn link_speed_supported(&self) -> u8 {
        get_field(&self.data, PORT_INFO_LINK_SPEED_SUPPORTED) as u8
    }

    pub fn set_link_speed_supported(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_LINK_SPEED_SUPPORTED, val as u64)
    }

    pub fn set_link_speed_enabled(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_LINK_SPEED_ENABLED, val as u64)
    }

    pub fn link_speed_ext_active(&self) -> u8 {
        get_field(&self.data, PORT_INFO_LINK_SPEED_EXT_ACTIVE) as u8
    }

    pub fn set_link_speed_ext_active(&mut self, val: u8) {
        set_field(&mut self.data, PORT_INFO_LINK_SPEED_EXT_ACTIVE, val as u64)
    }
}
