// An in-process simulated fabric that speaks umad bytes over a plain
// file descriptor (tests use one end of a UnixStream pair). Answers
// directed-route SMPs for discovery and LID-routed Performance-class
// MADs for counter harvest and reset.

use std::{
    cell::RefCell,
    fs,
    io::{self, Read, Write},
    rc::{Rc, Weak},
    sync, time,
};

use crate::mad::fields::{self, port_info};
use crate::mad::perf::{self, PM_DATA_LEN, PM_DATA_OFFSET};
use crate::mad::types::{dr_smp_mad, ib_mad, ib_user_mad, node_info};
use crate::mad::{
    IB_MAD_METHOD_GET, IB_MAD_METHOD_SET, IB_PERFORMANCE_CLASS, IB_SMI_DIRECT_CLASS,
};
use crate::netdisc::SmiAttr;
use crate::types::STD_COUNTERS;

const MIN_UMAD_SIZE: usize = 320;
const FIRST_HOP: [u8; 64] = [0; 64];

#[derive(Debug, Clone)]
pub struct Port {
    pub num: u8,
    pub port_info: port_info,
    pub ext_info: [u8; 64],
    pub counters: [u8; PM_DATA_LEN],
    pub counters_ext: [u8; PM_DATA_LEN],
    pub remote_port: Option<Weak<RefCell<Port>>>,
    pub parent: Weak<RefCell<Node>>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub description: String,
    pub node_info: node_info,
    pub pma_cap_mask: u16,
    pub ports: Vec<Rc<RefCell<Port>>>,
}

#[derive(Debug)]
pub struct Fabric {
    pub file: fs::File,
    pub nodes: Vec<Rc<RefCell<Node>>>,
    pub switches: Vec<Weak<RefCell<Node>>>,
    pub hcas: Vec<Weak<RefCell<Node>>>,
    pub dr_paths: std::collections::HashMap<[u8; 64], Weak<RefCell<Port>>>,
    pub response_delay: Option<u64>,
}

pub fn connect_ports(port_a_rc: &Rc<RefCell<Port>>, port_b_rc: &Rc<RefCell<Port>>) {
    let mut port_a = port_a_rc.borrow_mut();
    let mut port_b = port_b_rc.borrow_mut();

    // Link the ports to each other
    port_a.remote_port = Some(Rc::downgrade(port_b_rc));
    port_b.remote_port = Some(Rc::downgrade(port_a_rc));

    // Set port states to ACTIVE and LINK_UP now that they are connected
    port_a.port_info.set_port_state(4); // ACTIVE
    port_a.port_info.set_port_physical_state(5); // LINK_UP
    port_a.port_info.set_link_speed_active(1);
    port_a.port_info.set_link_width_active(1);

    port_b.port_info.set_port_state(4); // ACTIVE
    port_b.port_info.set_port_physical_state(5); // LINK_UP
    port_b.port_info.set_link_speed_active(1);
    port_b.port_info.set_link_width_active(1);

    log::info!(
        "Connected port {} on node '{}' to port {} on node '{}'",
        port_a.num,
        port_a.parent.upgrade().map_or("?".to_string(), |p| p.borrow().description.clone()),
        port_b.num,
        port_b.parent.upgrade().map_or("?".to_string(), |p| p.borrow().description.clone())
    );
}

impl Fabric {
    pub fn new(file: fs::File) -> Self {
        Fabric {
            file,
            nodes: Vec::new(),
            switches: Vec::new(),
            hcas: Vec::new(),
            dr_paths: std::collections::HashMap::new(),
            response_delay: None,
        }
    }

    pub fn add_switch(&mut self, switch: Node) -> Rc<RefCell<Node>> {
        let switch_rc = Rc::new(RefCell::new(switch));
        self.switches.push(Rc::downgrade(&switch_rc));
        self.nodes.push(switch_rc.clone());

        switch_rc
    }

    pub fn add_hca(&mut self, hca: Node) -> Rc<RefCell<Node>> {
        let hca_rc = Rc::new(RefCell::new(hca));
        self.hcas.push(Rc::downgrade(&hca_rc));
        self.nodes.push(hca_rc.clone());

        hca_rc
    }

    fn delay_response(&self, tid: u64) {
        if let Some(max_delay) = self.response_delay {
            if max_delay > 0 {
                let delay = rand::random_range(0..=max_delay);
                log::trace!("[tid: {}] Delaying response by {}us", tid, delay);
                std::thread::sleep(time::Duration::from_micros(delay));
            }
        }
    }

    fn send_dr_response(
        &mut self,
        tid: u64,
        umad: &ib_user_mad,
        mad: &ib_mad,
        dr_smp: &dr_smp_mad,
        attr_data: &[u8],
    ) -> Result<(), io::Error> {
        self.delay_response(tid);

        let mut resp_umad = *umad;
        let mut resp_mad = *mad;
        let mut resp_dr = *dr_smp;

        resp_dr.attr_layout[..attr_data.len()].copy_from_slice(attr_data);
        let dr_bytes = resp_dr.to_bytes();
        resp_mad.data[..dr_bytes.len()].copy_from_slice(&dr_bytes);
        let mad_bytes = resp_mad.to_bytes();
        resp_umad.data[..mad_bytes.len()].copy_from_slice(&mad_bytes);

        self.file.write_all(&resp_umad.to_bytes())
    }

    fn send_pm_response(
        &mut self,
        tid: u64,
        umad: &ib_user_mad,
        mad: &ib_mad,
        attr_data: &[u8; PM_DATA_LEN],
    ) -> Result<(), io::Error> {
        self.delay_response(tid);

        let mut resp_umad = *umad;
        let mut resp_mad = *mad;

        resp_mad.method = crate::mad::IB_MAD_METHOD_GET_RESP;
        resp_mad.data[PM_DATA_OFFSET..PM_DATA_OFFSET + PM_DATA_LEN].copy_from_slice(attr_data);

        let mad_bytes = resp_mad.to_bytes();
        resp_umad.data[..mad_bytes.len()].copy_from_slice(&mad_bytes);

        self.file.write_all(&resp_umad.to_bytes())
    }

    // Walk the directed-route path, returning the final node and the
    // port the MAD arrived on.
    fn traverse_path(
        &self,
        tid: u64,
        dr_smp: &dr_smp_mad,
    ) -> Result<(Rc<RefCell<Node>>, Rc<RefCell<Port>>), io::Error> {
        let mut current_node: Option<Rc<RefCell<Node>>> = None;
        let mut current_port: Option<Rc<RefCell<Port>>> = None;

        for (index, portnum) in dr_smp.initial_path.iter().enumerate() {
            if index == 0 && *portnum == 0 {
                let node_weak = self.dr_paths.get(&FIRST_HOP).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("[tid: {}] Unable to find first hop in dr_paths.", tid),
                    )
                })?;

                let first_hop_port = node_weak.upgrade().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("[tid: {}] First hop reference is stale.", tid),
                    )
                })?;

                let parent_node = first_hop_port.borrow().parent.upgrade().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("[tid: {}] First hop port has no parent.", tid),
                    )
                })?;

                log::trace!(
                    "[tid: {}] Path[{}]: Starting at node '{}'",
                    tid,
                    index,
                    parent_node.borrow().description
                );

                current_node = Some(parent_node);
                current_port = Some(first_hop_port);
                continue;
            }

            // A port number of 0 signifies the end of the path.
            if *portnum == 0 {
                break;
            }

            let node_rc = current_node.clone().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("[tid: {}] Path traversal failed at index {}.", tid, index),
                )
            })?;

            let node_ref = node_rc.borrow();
            log::trace!(
                "[tid: {}] Path[{}]: Traversing from node '{}' via port {}.",
                tid,
                index,
                node_ref.description,
                *portnum
            );

            let egress_port_rc = node_ref
                .ports
                .iter()
                .find(|p| p.borrow().num == *portnum)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!(
                            "[tid: {}] Could not find egress port {} on node '{}'",
                            tid, *portnum, node_ref.description
                        ),
                    )
                })?;

            let remote_port_rc = egress_port_rc
                .borrow()
                .remote_port
                .as_ref()
                .and_then(|w| w.upgrade())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!(
                            "[tid: {}] Port {} on node '{}' is not connected.",
                            tid, *portnum, node_ref.description
                        ),
                    )
                })?;

            let next_node_rc = remote_port_rc.borrow().parent.upgrade().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("[tid: {}] Remote port has no parent node.", tid),
                )
            })?;

            drop(node_ref);

            current_node = Some(next_node_rc);
            current_port = Some(remote_port_rc);
        }

        match (current_node, current_port) {
            (Some(n), Some(p)) => Ok((n, p)),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("[tid: {}] Path traversal reached no node.", tid),
            )),
        }
    }

    fn process_dr_smp(&mut self, umad: &ib_user_mad, mad: &ib_mad, tid: u64) -> Result<(), io::Error> {
        let dr_smp = dr_smp_mad::from_bytes(&mad.data)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Unable to parse DR SMP"))?;

        let (node_rc, port_rc) = self.traverse_path(tid, &dr_smp)?;

        let attr_id = u16::from_be(mad.attr_id);
        log::debug!(
            "[tid: {}] Path traversal finished at node '{}'. Processing AttrID: 0x{:04X}",
            tid,
            node_rc.borrow().description,
            attr_id
        );

        match attr_id {
            x if x == SmiAttr::NodeDesc as u16 => {
                let node_ref = node_rc.borrow();
                log::debug!(
                    "[tid: {}] Responding with NodeDesc '{}'",
                    tid,
                    node_ref.description
                );

                let desc = node_ref.description.clone();
                drop(node_ref);
                self.send_dr_response(tid, umad, mad, &dr_smp, desc.as_bytes())?;
            }

            x if x == SmiAttr::NodeInfo as u16 => {
                let node_ref = node_rc.borrow();
                let port_ref = port_rc.borrow();

                log::debug!(
                    "[tid: {}] Responding with NodeInfo for '{}' from perspective of port {}",
                    tid,
                    node_ref.description,
                    port_ref.num
                );

                let mut resp_ni = node_ref.node_info.clone();
                resp_ni.local_port = port_ref.num;
                let ni_bytes = resp_ni.to_bytes();

                drop(port_ref);
                drop(node_ref);
                self.send_dr_response(tid, umad, mad, &dr_smp, &ni_bytes)?;
            }

            x if x == SmiAttr::PortInfo as u16 => {
                let portnum = u32::from_be(mad.attr_mod) as u8;
                let node_ref = node_rc.borrow();

                let target_port_rc = node_ref
                    .ports
                    .iter()
                    .find(|p| p.borrow().num == portnum)
                    .cloned()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!(
                                "[tid: {}] Could not find port {} on node '{}'",
                                tid, portnum, node_ref.description
                            ),
                        )
                    })?;

                let pi = target_port_rc.borrow().port_info;
                log::debug!(
                    "[tid: {}] Responding with PortInfo for port {} on node '{}' (LID: {}), state: {}, phys: {}",
                    tid,
                    portnum,
                    node_ref.description,
                    pi.lid(),
                    pi.port_state(),
                    pi.port_physical_state(),
                );

                drop(node_ref);
                self.send_dr_response(tid, umad, mad, &dr_smp, &pi.to_bytes())?;
            }

            x if x == SmiAttr::MlnxExtPortInfo as u16 => {
                let portnum = u32::from_be(mad.attr_mod) as u8;
                let node_ref = node_rc.borrow();

                let target_port_rc = node_ref
                    .ports
                    .iter()
                    .find(|p| p.borrow().num == portnum)
                    .cloned()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!(
                                "[tid: {}] Could not find port {} on node '{}'",
                                tid, portnum, node_ref.description
                            ),
                        )
                    })?;

                let ext = target_port_rc.borrow().ext_info;
                drop(node_ref);
                self.send_dr_response(tid, umad, mad, &dr_smp, &ext)?;
            }

            _ => {
                log::warn!("[tid: {}] Unhandled SMP AttrID: 0x{:04X}", tid, attr_id);
            }
        }

        Ok(())
    }

    fn find_node_by_lid(&self, lid: u16) -> Option<Rc<RefCell<Node>>> {
        self.nodes
            .iter()
            .find(|n| {
                n.borrow()
                    .ports
                    .iter()
                    .any(|p| p.borrow().port_info.lid() == lid)
            })
            .cloned()
    }

    fn process_perf(&mut self, umad: &ib_user_mad, mad: &ib_mad, tid: u64) -> Result<(), io::Error> {
        let dlid = u16::from_be(umad.addr.lid);
        let attr_id = u16::from_be(mad.attr_id);

        let node_rc = self.find_node_by_lid(dlid).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("[tid: {}] No node with LID {}", tid, dlid),
            )
        })?;

        let mut req_data = [0u8; PM_DATA_LEN];
        req_data.copy_from_slice(&mad.data[PM_DATA_OFFSET..PM_DATA_OFFSET + PM_DATA_LEN]);

        match attr_id {
            perf::CLASS_PORT_INFO => {
                let cap_mask = node_rc.borrow().pma_cap_mask;
                log::debug!(
                    "[tid: {}] Responding with ClassPortInfo for LID {}, cap mask {:#06x}",
                    tid,
                    dlid,
                    cap_mask
                );

                let mut resp = [0u8; PM_DATA_LEN];
                fields::set_field(&mut resp, fields::CPI_BASE_VERSION, 0x1);
                fields::set_field(&mut resp, fields::CPI_CLASS_VERSION, 0x1);
                fields::set_field(&mut resp, fields::CPI_CAP_MASK, cap_mask as u64);

                self.send_pm_response(tid, umad, mad, &resp)?;
            }

            perf::IB_GSI_PORT_COUNTERS => {
                let portnum = fields::get_field(&req_data, fields::PC_PORT_SELECT) as u8;
                let node_ref = node_rc.borrow();

                let port_rc = node_ref
                    .ports
                    .iter()
                    .find(|p| p.borrow().num == portnum)
                    .cloned()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!(
                                "[tid: {}] No port {} on node '{}'",
                                tid, portnum, node_ref.description
                            ),
                        )
                    })?;

                if mad.method == IB_MAD_METHOD_SET {
                    // PortCounters reset: zero every counter whose select
                    // bit is present in CounterSelect / CounterSelect2.
                    let sel = fields::get_field(&req_data, fields::PC_COUNTER_SELECT) as u32
                        | (fields::get_field(&req_data, fields::PC_COUNTER_SELECT2) as u32) << 16;

                    log::debug!(
                        "[tid: {}] Resetting counters on '{}' port {}, select mask {:#x}",
                        tid,
                        node_ref.description,
                        portnum,
                        sel
                    );

                    let mut port_ref = port_rc.borrow_mut();
                    for meta in STD_COUNTERS.iter() {
                        if sel & meta.select != 0 {
                            fields::set_field(&mut port_ref.counters, meta.field, 0);
                        }
                    }
                } else if mad.method != IB_MAD_METHOD_GET {
                    log::warn!("[tid: {}] Unhandled PerfMgt method 0x{:02X}", tid, mad.method);
                }

                let mut resp = port_rc.borrow().counters;
                fields::set_field(&mut resp, fields::PC_PORT_SELECT, portnum as u64);

                drop(node_ref);
                self.send_pm_response(tid, umad, mad, &resp)?;
            }

            perf::IB_GSI_PORT_COUNTERS_EXT => {
                let portnum = fields::get_field(&req_data, fields::PC_EXT_PORT_SELECT) as u8;
                let node_ref = node_rc.borrow();

                let port_rc = node_ref
                    .ports
                    .iter()
                    .find(|p| p.borrow().num == portnum)
                    .cloned()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!(
                                "[tid: {}] No port {} on node '{}'",
                                tid, portnum, node_ref.description
                            ),
                        )
                    })?;

                let mut resp = port_rc.borrow().counters_ext;
                fields::set_field(&mut resp, fields::PC_EXT_PORT_SELECT, portnum as u64);

                drop(node_ref);
                self.send_pm_response(tid, umad, mad, &resp)?;
            }

            _ => {
                log::warn!("[tid: {}] Unhandled PerfMgt AttrID: 0x{:04X}", tid, attr_id);
            }
        }

        Ok(())
    }

    pub fn process_one_umad(&mut self) -> Result<(), io::Error> {
        let mut buf: [u8; 320] = [0; 320];
        let r = self.file.read(&mut buf)?;
        log::trace!("Read {} bytes from UMAD file.", r);

        if r < MIN_UMAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "UMAD too small: expected at least {} bytes, got {}",
                    MIN_UMAD_SIZE, r
                ),
            ));
        }

        let umad = ib_user_mad::from_bytes(&buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Failed to parse ib_user_mad"))?;

        let mad = ib_mad::from_bytes(&umad.data)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Failed to parse ib_mad"))?;

        // Use the transaction ID for correlated logging
        let tid = u64::from_be(mad.tid);
        log::debug!(
            "[tid: {}] Received MAD. Class: 0x{:02X}, AttrID: 0x{:04X}",
            tid,
            mad.mgmt_class,
            u16::from_be(mad.attr_id)
        );

        match mad.mgmt_class {
            IB_SMI_DIRECT_CLASS => self.process_dr_smp(&umad, &mad, tid),
            IB_PERFORMANCE_CLASS => self.process_perf(&umad, &mad, tid),
            _ => {
                log::warn!(
                    "[tid: {}] Received unhandled MAD management class: 0x{:02X}",
                    tid,
                    mad.mgmt_class
                );
                Ok(())
            }
        }
    }

    pub fn run(&mut self, done: sync::mpsc::Receiver<bool>) -> Result<(), io::Error> {
        log::info!("Starting UMAD processing loop...");
        loop {
            // Non-blocking check for the done signal
            match done.try_recv() {
                Ok(true) => {
                    log::info!("Stop signal received. Shutting down UMAD processing loop.");
                    break;
                }
                Ok(false) => { /* Continue */ }
                Err(sync::mpsc::TryRecvError::Empty) => { /* No signal, continue */ }
                Err(sync::mpsc::TryRecvError::Disconnected) => {
                    log::warn!("MPSC channel disconnected. Shutting down.");
                    break;
                }
            }

            if let Err(e) = self.process_one_umad() {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    log::error!("Error processing UMAD packet: {}. Kind: {:?}", e, e.kind());
                }
            }
        }
        log::info!("UMAD processing loop has finished.");
        Ok(())
    }
}

impl Port {
    pub fn new_port(num: u8, lid: u16, parent: Rc<RefCell<Node>>) -> Port {
        let mut pi = port_info::default();

        pi.set_local_portnum(num);
        pi.set_lid(lid);

        pi.set_port_state(1); // Down
        pi.set_port_physical_state(2); // Polling

        pi.set_link_speed_supported(1);
        pi.set_link_speed_enabled(1);
        pi.set_link_speed_active(1);
        pi.set_link_width_supported(1);
        pi.set_link_width_enabled(1);
        pi.set_link_width_active(1);

        Port {
            num,
            port_info: pi,
            ext_info: [0; 64],
            counters: [0; PM_DATA_LEN],
            counters_ext: [0; PM_DATA_LEN],
            remote_port: None,
            parent: Rc::downgrade(&parent),
        }
    }

    pub fn set_counter(&mut self, field: fields::Field, value: u64) {
        fields::set_field(&mut self.counters, field, value);
    }

    pub fn set_ext_counter(&mut self, field: fields::Field, value: u64) {
        fields::set_field(&mut self.counters_ext, field, value);
    }
}

impl Node {
    pub fn new_hca(description: &str, guid: u64) -> Node {
        Node {
            description: description.to_owned(),
            node_info: node_info {
                base_version: 0x1,
                class_version: 0x1,
                node_type: 0x1, // Channel Adapter
                nports: 1,
                system_guid: guid.to_be(),
                node_guid: guid.to_be(),
                port_guid: guid.to_be(),
                partition_cap: 128,
                device_id: (128 as u16).to_be(),
                revision: 0,
                local_port: 1,
                vendor_id: [0x00, 0x02, 0xc9],
                reserved: [0; 24],
            },
            pma_cap_mask: u16::from_be(
                fields::IB_PM_EXT_WIDTH_SUPPORTED | fields::IB_PM_PC_XMIT_WAIT_SUP,
            ),
            ports: Vec::new(),
        }
    }

    pub fn new_switch(description: &str, guid: u64, nports: u8) -> Node {
        Node {
            description: description.to_owned(),
            node_info: node_info {
                base_version: 0x1,
                class_version: 0x1,
                node_type: 0x2, // Switch
                nports,
                system_guid: guid.to_be(),
                node_guid: guid.to_be(),
                port_guid: guid.to_be(),
                partition_cap: 8,
                device_id: (0xd2f2 as u16).to_be(),
                revision: (0x0000_00a0 as u32).to_be(),
                local_port: 0, // Port 0 is the management port
                vendor_id: [0x00, 0xcf, 0x09],
                reserved: [0; 24],
            },
            pma_cap_mask: u16::from_be(
                fields::IB_PM_EXT_WIDTH_SUPPORTED | fields::IB_PM_PC_XMIT_WAIT_SUP,
            ),
            ports: Vec::new(),
        }
    }
}
