// Owned snapshot model emitted by a discovery sweep, together with the
// IBTA counter metadata and display tables.

use std::collections::HashMap;
use std::fmt;

use crate::mad::fields::{self, Field};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Ca = 1,
    Switch = 2,
    Router = 3,
}

impl TryFrom<u8> for NodeType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NodeType::Ca),
            2 => Ok(NodeType::Switch),
            3 => Ok(NodeType::Router),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    NoStateChange = 0,
    Down = 1,
    Initialize = 2,
    Armed = 3,
    Active = 4,
}

impl TryFrom<u8> for PortState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PortState::NoStateChange),
            1 => Ok(PortState::Down),
            2 => Ok(PortState::Initialize),
            3 => Ok(PortState::Armed),
            4 => Ok(PortState::Active),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPhysState {
    NoStateChange = 0,
    Sleep = 1,
    Polling = 2,
    Disabled = 3,
    PortConfigurationTraining = 4,
    LinkUp = 5,
    LinkErrorRecovery = 6,
    PhyTest = 7,
}

impl TryFrom<u8> for PortPhysState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PortPhysState::NoStateChange),
            1 => Ok(PortPhysState::Sleep),
            2 => Ok(PortPhysState::Polling),
            3 => Ok(PortPhysState::Disabled),
            4 => Ok(PortPhysState::PortConfigurationTraining),
            5 => Ok(PortPhysState::LinkUp),
            6 => Ok(PortPhysState::LinkErrorRecovery),
            7 => Ok(PortPhysState::PhyTest),
            _ => Err(()),
        }
    }
}

const PORT_STATES: [&str; 5] = [
    "No state change", // Valid only on Set() port state
    "Down",            // Includes failed links
    "Initialize",
    "Armed",
    "Active",
];

const PORT_PHYS_STATES: [&str; 8] = [
    "No state change", // Valid only on Set() port state
    "Sleep",
    "Polling",
    "Disabled",
    "PortConfigurationTraining",
    "LinkUp",
    "LinkErrorRecovery",
    "Phy Test",
];

pub fn port_state_to_str(state: u64) -> String {
    match PORT_STATES.get(state as usize) {
        Some(s) => (*s).to_owned(),
        None => format!("undefined({})", state),
    }
}

pub fn port_phys_state_to_str(state: u64) -> String {
    match PORT_PHYS_STATES.get(state as usize) {
        Some(s) => (*s).to_owned(),
        None => format!("undefined({})", state),
    }
}

pub fn link_width_to_str(width: u64) -> String {
    match width {
        1 => "1X".to_owned(),
        2 => "4X".to_owned(),
        4 => "8X".to_owned(),
        8 => "12X".to_owned(),
        n => format!("undefined({})", n),
    }
}

pub fn link_speed_to_str(speed: u64) -> String {
    match speed {
        0 => "Extended speed".to_owned(),
        1 => "SDR".to_owned(),
        2 => "DDR".to_owned(),
        4 => "QDR".to_owned(),
        n => format!("undefined({})", n),
    }
}

pub fn link_speed_ext_to_str(speed: u64) -> String {
    match speed {
        0 => "No extended speed active".to_owned(),
        1 => "FDR".to_owned(),
        2 => "EDR".to_owned(),
        n => format!("undefined({})", n),
    }
}

/// Performance counters harvested from switch ports. The standard set is
/// 32-bit, the extended set 64-bit; the two are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    SymbolErrorCounter,
    LinkErrorRecoveryCounter,
    LinkDownedCounter,
    PortRcvErrors,
    PortRcvRemotePhysicalErrors,
    PortRcvSwitchRelayErrors,
    PortXmitDiscards,
    PortXmitConstraintErrors,
    PortRcvConstraintErrors,
    LocalLinkIntegrityErrors,
    ExcessiveBufferOverrunErrors,
    VL15Dropped,
    PortXmitWait,
    PortXmitData,
    PortRcvData,
    PortXmitPkts,
    PortRcvPkts,
    PortUnicastXmitPkts,
    PortUnicastRcvPkts,
    PortMulticastXmitPkts,
    PortMulticastRcvPkts,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Variant names are the IBTA display names
        write!(f, "{:?}", self)
    }
}

/// Metadata for a standard 32-bit counter: where it sits in the
/// PortCounters blob, its saturation limit, and the bit that selects it
/// in a PortCounters reset.
#[derive(Debug, Clone, Copy)]
pub struct StdCounterMeta {
    pub counter: Counter,
    pub field: Field,
    pub limit: u64,
    pub select: u32,
}

pub const STD_COUNTERS: [StdCounterMeta; 13] = [
    StdCounterMeta { counter: Counter::SymbolErrorCounter, field: fields::PC_ERR_SYM, limit: 0xffff, select: 0x1 },
    StdCounterMeta { counter: Counter::LinkErrorRecoveryCounter, field: fields::PC_LINK_RECOVERS, limit: 0xff, select: 0x2 },
    StdCounterMeta { counter: Counter::LinkDownedCounter, field: fields::PC_LINK_DOWNED, limit: 0xff, select: 0x4 },
    StdCounterMeta { counter: Counter::PortRcvErrors, field: fields::PC_ERR_RCV, limit: 0xffff, select: 0x8 },
    StdCounterMeta { counter: Counter::PortRcvRemotePhysicalErrors, field: fields::PC_ERR_PHYSRCV, limit: 0xffff, select: 0x10 },
    StdCounterMeta { counter: Counter::PortRcvSwitchRelayErrors, field: fields::PC_ERR_SWITCH_REL, limit: 0xffff, select: 0x20 },
    StdCounterMeta { counter: Counter::PortXmitDiscards, field: fields::PC_XMT_DISCARDS, limit: 0xffff, select: 0x40 },
    StdCounterMeta { counter: Counter::PortXmitConstraintErrors, field: fields::PC_ERR_XMTCONSTR, limit: 0xff, select: 0x80 },
    StdCounterMeta { counter: Counter::PortRcvConstraintErrors, field: fields::PC_ERR_RCVCONSTR, limit: 0xff, select: 0x100 },
    StdCounterMeta { counter: Counter::LocalLinkIntegrityErrors, field: fields::PC_ERR_LOCALINTEG, limit: 0xf, select: 0x200 },
    StdCounterMeta { counter: Counter::ExcessiveBufferOverrunErrors, field: fields::PC_ERR_EXCESS_OVR, limit: 0xf, select: 0x400 },
    StdCounterMeta { counter: Counter::VL15Dropped, field: fields::PC_VL15_DROPPED, limit: 0xffff, select: 0x800 },
    // Requires cap mask IB_PM_PC_XMIT_WAIT_SUP; resets via CounterSelect2
    StdCounterMeta { counter: Counter::PortXmitWait, field: fields::PC_XMT_WAIT, limit: 0xffffffff, select: 0x10000 },
];

/// Metadata for an extended 64-bit counter. Extended counters saturate
/// at the 64-bit maximum and are never reset.
#[derive(Debug, Clone, Copy)]
pub struct ExtCounterMeta {
    pub counter: Counter,
    pub field: Field,
}

pub const EXT_COUNTERS: [ExtCounterMeta; 8] = [
    ExtCounterMeta { counter: Counter::PortXmitData, field: fields::PC_EXT_XMT_BYTES },
    ExtCounterMeta { counter: Counter::PortRcvData, field: fields::PC_EXT_RCV_BYTES },
    ExtCounterMeta { counter: Counter::PortXmitPkts, field: fields::PC_EXT_XMT_PKTS },
    ExtCounterMeta { counter: Counter::PortRcvPkts, field: fields::PC_EXT_RCV_PKTS },
    ExtCounterMeta { counter: Counter::PortUnicastXmitPkts, field: fields::PC_EXT_XMT_UPKTS },
    ExtCounterMeta { counter: Counter::PortUnicastRcvPkts, field: fields::PC_EXT_RCV_UPKTS },
    ExtCounterMeta { counter: Counter::PortMulticastXmitPkts, field: fields::PC_EXT_XMT_MPKTS },
    ExtCounterMeta { counter: Counter::PortMulticastRcvPkts, field: fields::PC_EXT_RCV_MPKTS },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterValue {
    Std(u32),
    Ext(u64),
}

/// One port of a node in an emitted snapshot. For a Down port only the
/// GUID is meaningful; counters are present only for Active / LinkUp
/// ports with a linked peer.
#[derive(Debug, Clone, Default)]
pub struct Port {
    pub num: u8,
    pub guid: u64,
    pub remote_guid: u64,
    pub remote_desc: String,
    pub link_width: Option<String>,
    pub link_speed: Option<String>,
    pub counters: HashMap<Counter, CounterValue>,
}

/// One node of an emitted snapshot. Ports are populated only for
/// switches.
#[derive(Debug, Clone)]
pub struct Node {
    pub guid: u64,
    pub node_type: NodeType,
    pub node_desc: String,
    pub vendor_id: u32,
    pub device_id: u16,
    pub ports: Vec<Port>,
}

/// An immutable snapshot of one fabric, produced by a single discovery
/// pass of one local port and shared with every writer.
#[derive(Debug, Clone)]
pub struct Fabric {
    pub hostname: String,
    pub ca_name: String,
    pub source_port: u32,
    pub nodes: Vec<Node>,
}
