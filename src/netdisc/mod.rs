// Directed-route subnet discovery. One call to discover_fabric() walks
// the subnet visible through a local port and returns a raw fabric graph
// whose lifetime is bounded by the sweep: every emitted snapshot is
// copied out of it before it is dropped.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, RwLock, Weak},
    time,
};

use tokio::sync::mpsc;

use crate::{
    bitops,
    ca::Hca,
    mad::{
        self,
        fields::port_info,
        types::{dr_smp_mad, ib_mad, ib_mad_addr, ib_user_mad, node_info},
        IbMadPort,
    },
    nodenamemap::NodeNameMap,
    perfquery, types,
};

const START_PATH: [u8; 64] = [0; 64];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmiAttr {
    NodeDesc = 0x0010,
    NodeInfo = 0x0011,
    PortInfo = 0x0015,
    MlnxExtPortInfo = 0xff90,
}

/// Knobs for one discovery pass, the equivalent of ibnd_config_t.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Longest directed-route path followed, in hops.
    pub max_hops: u8,
    pub timeout_ms: u32,
    pub retries: u32,
    /// Cap on SMPs sent in one pass; 0 means uncapped. Exceeding the cap
    /// aborts the pass with a transient error.
    pub max_smps: u64,
    /// Also fetch the Mellanox ExtendedPortInfo attribute (FDR10
    /// detection).
    pub vendor_ext: bool,
    pub m_key: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            max_hops: 63,
            timeout_ms: 1000,
            retries: 2,
            max_smps: 0,
            vendor_ext: true,
            m_key: 0,
        }
    }
}

/// One port of a discovered node, holding the raw PortInfo blob it
/// answered with. `remote_port` is linked once the peer responds on the
/// extended path.
#[derive(Debug, Clone)]
pub struct RawPort {
    pub num: u8,
    pub guid: u64,
    pub info: port_info,
    pub ext_info: [u8; 64],
    pub remote_port: Option<Weak<RwLock<RawPort>>>,
    pub parent: Weak<RwLock<RawNode>>,
}

/// One discovered node. `ports` is indexed by port number; entries may
/// be vacant (query timed out), and non-switch nodes have no entry at
/// index 0.
#[derive(Debug)]
pub struct RawNode {
    pub guid: u64,
    pub node_type: u8,
    pub nodedesc: String,
    pub vendor_id: u32,
    pub device_id: u16,
    pub lid: u16,
    pub nports: u8,
    pub ports: Vec<Option<Arc<RwLock<RawPort>>>>,
}

/// The raw fabric graph owned by one discovery pass.
#[derive(Debug, Default)]
pub struct Fabric {
    pub nodes: Vec<Arc<RwLock<RawNode>>>,
    node_map: HashMap<u64, Arc<RwLock<RawNode>>>,
    pub mads_sent: u64,
    pub mad_timeouts: u64,
    pub mad_errors: u64,
}

fn lock_err<T: std::fmt::Debug>(e: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("Lock poisoned: {:?}", e))
}

fn format_path(path: &[u8; 64]) -> String {
    let mut hop_vec: Vec<String> = Vec::new();

    // The actual path starts at index 1.
    for &hop in path.iter().skip(1) {
        if hop == 0 {
            break;
        }
        hop_vec.push(hop.to_string());
    }
    if hop_vec.is_empty() {
        "Direct".to_string()
    } else {
        format!("0 -> {}", hop_vec.join(" -> "))
    }
}

fn get_hop_count(path: &[u8; 64]) -> u8 {
    path.iter().skip(1).take_while(|&&p| p != 0).count() as u8
}

struct Discoverer<'a> {
    port: &'a mut IbMadPort,
    conf: &'a DiscoveryConfig,
    fabric: Fabric,
    ni_timings: Vec<time::Duration>,
    smps_sent: u64,
    tid: u64,
}

impl<'a> Discoverer<'a> {
    fn build_dr_smp_umad(&mut self, path: [u8; 64], attr: SmiAttr, attr_mod: u32, hop_cnt: u8) -> ib_user_mad {
        self.tid += 1;

        let dr_smp = dr_smp_mad {
            m_key: self.conf.m_key.to_be(),
            drslid: 0xffff,
            drdlid: 0xffff,
            reserved: [0; 28],
            attr_layout: [0; 64],
            initial_path: path,
            return_path: [0; 64],
        };

        let mut smp = ib_mad {
            base_version: 0x1,
            mgmt_class: mad::IB_SMI_DIRECT_CLASS,
            class_version: 0x1,
            method: mad::IB_MAD_METHOD_GET,
            status: 0x0,
            hop_ptr: 0,
            hop_cnt,
            tid: self.tid.to_be(),
            attr_id: (attr as u16).to_be(),
            additional_status: 0x0,
            attr_mod: attr_mod.to_be(),
            data: [0; 232],
        };

        let dr_bytes = dr_smp.to_bytes();
        smp.data[..dr_bytes.len()].copy_from_slice(&dr_bytes);

        let mut umad = ib_user_mad {
            agent_id: self.port.agent_for(mad::IB_SMI_DIRECT_CLASS),
            status: 0x0,
            timeout_ms: self.conf.timeout_ms,
            retries: self.conf.retries,
            length: 0,
            addr: ib_mad_addr {
                qpn: 0,
                qkey: mad::IB_DEFAULT_QKEY.to_be(),
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

        let smp_bytes = smp.to_bytes();
        umad.data[..smp_bytes.len()].copy_from_slice(&smp_bytes);

        umad
    }

    fn send_dr(&mut self, umad: ib_user_mad) -> io::Result<ib_user_mad> {
        if self.conf.max_smps > 0 && self.smps_sent >= self.conf.max_smps {
            self.fabric.mad_errors += 1;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("SMP budget of {} exhausted", self.conf.max_smps),
            ));
        }
        self.smps_sent += 1;
        self.fabric.mads_sent += 1;

        match mad::send_recv_match(self.port, &umad, self.conf.timeout_ms, self.conf.retries) {
            Ok(resp) => Ok(resp),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                self.fabric.mad_timeouts += 1;
                Err(e)
            }
            Err(e) => {
                self.fabric.mad_errors += 1;
                Err(e)
            }
        }
    }

    fn fetch_node_info(&mut self, path: [u8; 64], hop_cnt: u8) -> io::Result<node_info> {
        let start_ts = time::Instant::now();
        log::debug!("Fetching NodeInfo for path: [{}]", format_path(&path));

        let umad = self.build_dr_smp_umad(path, SmiAttr::NodeInfo, 0x0, hop_cnt);
        let resp = self.send_dr(umad)?;

        self.ni_timings.push(time::Instant::now() - start_ts);

        let ni = node_info::from_bytes(&resp.data[64..]).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Could not parse NodeInfo data.")
        })?;

        log::trace!("<- Received NodeInfo: {:?}", ni);
        Ok(ni)
    }

    fn fetch_node_desc(&mut self, path: [u8; 64], hop_cnt: u8) -> io::Result<String> {
        log::debug!("Fetching NodeDesc for path: [{}]", format_path(&path));

        let umad = self.build_dr_smp_umad(path, SmiAttr::NodeDesc, 0x0, hop_cnt);
        let resp = self.send_dr(umad)?;

        let dr = dr_smp_mad::from_bytes(&resp.data[24..]).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Could not parse DR SMP data.")
        })?;

        let mut node_desc = String::from_utf8_lossy(&dr.attr_layout)
            .trim_end_matches('\0')
            .to_string();

        if let Some(null_idx) = node_desc.find('\0') {
            node_desc.truncate(null_idx);
        }

        log::trace!("<- Received NodeDesc: '{}'", node_desc);
        Ok(node_desc)
    }

    fn fetch_port_info(&mut self, path: [u8; 64], port_num: u8, hop_cnt: u8) -> io::Result<port_info> {
        log::debug!(
            "Fetching PortInfo for port {} on path: [{}]",
            port_num,
            format_path(&path)
        );

        let umad = self.build_dr_smp_umad(path, SmiAttr::PortInfo, port_num as u32, hop_cnt);
        let resp = self.send_dr(umad)?;

        let pi = port_info::from_bytes(&resp.data[64..]).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "could not parse portinfo data.")
        })?;

        log::trace!(
            "<- Received PortInfo for port {}: state {} phys {}",
            port_num,
            types::port_state_to_str(pi.port_state() as u64),
            types::port_phys_state_to_str(pi.port_physical_state() as u64)
        );

        Ok(pi)
    }

    fn fetch_ext_port_info(&mut self, path: [u8; 64], port_num: u8, hop_cnt: u8) -> io::Result<[u8; 64]> {
        let umad = self.build_dr_smp_umad(path, SmiAttr::MlnxExtPortInfo, port_num as u32, hop_cnt);
        let resp = self.send_dr(umad)?;

        let mut ext = [0u8; 64];
        ext.copy_from_slice(&resp.data[64..128]);
        Ok(ext)
    }

    fn discover_node(&mut self, path: [u8; 64], hop_cnt: u8) -> io::Result<Arc<RwLock<RawNode>>> {
        let ni = self.fetch_node_info(path, hop_cnt)?;
        let nodedesc = self.fetch_node_desc(path, hop_cnt)?;

        let guid = bitops::ntohll(ni.node_guid);
        let port_guid = bitops::ntohll(ni.port_guid);
        let node_type = ni.node_type;
        let nports = ni.nports;
        let vendor_id = u32::from_be_bytes([0, ni.vendor_id[0], ni.vendor_id[1], ni.vendor_id[2]]);

        let node = RawNode {
            guid,
            node_type,
            nodedesc,
            vendor_id,
            device_id: bitops::ntohs(ni.device_id),
            lid: 0,
            nports,
            ports: vec![None; nports as usize + 1],
        };

        log::debug!(
            "Discovered node: '{}' (GUID: {:#016x}, type: {}, ports: {})",
            node.nodedesc,
            node.guid,
            node.node_type,
            node.nports
        );

        let node_arc = Arc::new(RwLock::new(node));

        // Switches expose the management port at index 0.
        let first_port = if node_type == types::NodeType::Switch as u8 { 0 } else { 1 };

        for p in first_port..=nports {
            match self.fetch_port_info(path, p, hop_cnt) {
                Ok(pi) => {
                    let mut ext_info = [0u8; 64];
                    if self.conf.vendor_ext && node_type == types::NodeType::Switch as u8 && p > 0 {
                        match self.fetch_ext_port_info(path, p, hop_cnt) {
                            Ok(ext) => ext_info = ext,
                            Err(e) => log::debug!(
                                "No ExtendedPortInfo for port {} on path [{}]: {}",
                                p,
                                format_path(&path),
                                e
                            ),
                        }
                    }

                    let raw_port = RawPort {
                        num: p,
                        guid: port_guid,
                        info: pi,
                        ext_info,
                        remote_port: None,
                        parent: Arc::downgrade(&node_arc),
                    };

                    let mut node_ref = node_arc.write().map_err(lock_err)?;
                    node_ref.ports[p as usize] = Some(Arc::new(RwLock::new(raw_port)));
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    log::debug!(
                        "Timeout getting PortInfo for port {} on path [{}]",
                        p,
                        format_path(&path)
                    );
                }
                Err(e) => {
                    log::error!(
                        "Error getting PortInfo for port {} on path [{}]: {}",
                        p,
                        format_path(&path),
                        e
                    );
                    return Err(e);
                }
            }
        }

        {
            // The node's LID comes from the management port for switches,
            // from the probed port otherwise.
            let mut node_ref = node_arc.write().map_err(lock_err)?;
            let lid_port = if node_type == types::NodeType::Switch as u8 { 0 } else { ni.local_port };

            let mut lid = 0u16;
            if let Some(Some(port_arc)) = node_ref.ports.get(lid_port as usize) {
                lid = port_arc.read().map_err(lock_err)?.info.lid();
            }
            node_ref.lid = lid;
        }

        self.fabric.nodes.push(node_arc.clone());
        self.fabric.node_map.insert(guid, node_arc.clone());

        Ok(node_arc)
    }

    fn push_switch_ports(
        &self,
        stack: &mut VecDeque<(Arc<RwLock<RawPort>>, [u8; 64])>,
        node_arc: &Arc<RwLock<RawNode>>,
        path: [u8; 64],
    ) -> io::Result<()> {
        let node = node_arc.read().map_err(lock_err)?;
        if node.node_type != types::NodeType::Switch as u8 {
            return Ok(());
        }

        for port_arc in node.ports.iter().rev().flatten() {
            let port = port_arc.read().map_err(lock_err)?;
            if port.num == 0 {
                continue;
            }
            if port.info.port_state() == types::PortState::Active as u8 {
                log::debug!(
                    "Adding switch port {} on '{}' to discovery stack. Path: [{}]",
                    port.num,
                    node.nodedesc,
                    format_path(&path)
                );
                stack.push_front((port_arc.clone(), path));
            }
        }

        Ok(())
    }

    fn run(&mut self) -> io::Result<()> {
        let mut stack: VecDeque<(Arc<RwLock<RawPort>>, [u8; 64])> = VecDeque::new();

        let start_ts = time::Instant::now();

        let first_node_arc = self.discover_node(START_PATH, 0).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Could not discover first-hop node: {}", e),
            )
        })?;

        {
            let first_node = first_node_arc.read().map_err(lock_err)?;

            for port_arc in first_node.ports.iter().flatten() {
                let num = port_arc.read().map_err(lock_err)?.num;
                if num == 0 {
                    continue;
                }
                stack.push_back((port_arc.clone(), START_PATH));
            }
        }

        while let Some((local_port_arc, path_to_node)) = stack.pop_front() {
            // Already linked means the peer probed us first.
            if local_port_arc.read().map_err(lock_err)?.remote_port.is_some() {
                continue;
            }

            let local_port_num = local_port_arc.read().map_err(lock_err)?.num;

            let hop_cnt = get_hop_count(&path_to_node) + 1;
            if hop_cnt > self.conf.max_hops || (hop_cnt as usize) >= path_to_node.len() {
                log::warn!(
                    "Path too long, cannot discover beyond port {} at [{}]",
                    local_port_num,
                    format_path(&path_to_node)
                );
                continue;
            }

            let mut path_to_remote = path_to_node;
            path_to_remote[hop_cnt as usize] = local_port_num;

            let remote_ni = match self.fetch_node_info(path_to_remote, hop_cnt) {
                Ok(ni) => ni,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    log::debug!(
                        "Port {} appears unconnected (timeout on path [{}]).",
                        local_port_num,
                        format_path(&path_to_remote),
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let remote_guid = bitops::ntohll(remote_ni.node_guid);

            let remote_node_arc = if let Some(found) = self.fabric.node_map.get(&remote_guid) {
                log::trace!("Remote node {:#016x} already discovered.", remote_guid);
                found.clone()
            } else {
                match self.discover_node(path_to_remote, hop_cnt) {
                    Ok(new_node_arc) => {
                        self.push_switch_ports(&mut stack, &new_node_arc, path_to_remote)?;
                        new_node_arc
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to discover remote node at path [{}]: {}",
                            format_path(&path_to_remote),
                            e
                        );
                        continue;
                    }
                }
            };

            // Link the two port records through the port number the
            // remote reported in its NodeInfo.
            let remote_port_num = remote_ni.local_port;
            let remote_node = remote_node_arc.read().map_err(lock_err)?;

            match remote_node
                .ports
                .get(remote_port_num as usize)
                .and_then(|p| p.as_ref())
            {
                Some(remote_port_arc) => {
                    log::trace!(
                        "Linking port {} <--> '{}' port {}",
                        local_port_num,
                        remote_node.nodedesc,
                        remote_port_num
                    );

                    local_port_arc.write().map_err(lock_err)?.remote_port =
                        Some(Arc::downgrade(remote_port_arc));
                    remote_port_arc.write().map_err(lock_err)?.remote_port =
                        Some(Arc::downgrade(&local_port_arc));
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "Inconsistent fabric: remote node {:#016x} ('{}') reported port {} which was not found",
                            remote_node.guid, remote_node.nodedesc, remote_port_num
                        ),
                    ));
                }
            }
        }

        let ts_diff = time::Instant::now() - start_ts;
        log::info!(
            "Discovery complete. Found {} nodes, sent {} SMPs ({} timeouts, {} errors).",
            self.fabric.nodes.len(),
            self.fabric.mads_sent,
            self.fabric.mad_timeouts,
            self.fabric.mad_errors
        );

        if !self.ni_timings.is_empty() {
            let zero = time::Duration::new(0, 0);
            let ni_min = self.ni_timings.iter().min().unwrap_or(&zero);
            let ni_max = self.ni_timings.iter().max().unwrap_or(&zero);
            let ni_sum: u128 = self.ni_timings.iter().map(|d| d.as_micros()).sum();
            let ni_avg = ni_sum / self.ni_timings.len() as u128;
            log::debug!(
                "Discovery duration: {:.2}s, NI RTT avg: {}us, max: {}us, min: {}us",
                ts_diff.as_secs_f64(),
                ni_avg,
                ni_max.as_micros(),
                ni_min.as_micros()
            );
        }

        Ok(())
    }
}

/// Walks the subnet reachable through `port`, returning the raw fabric
/// graph.
pub fn discover_fabric(port: &mut IbMadPort, conf: &DiscoveryConfig) -> io::Result<Fabric> {
    let mut d = Discoverer {
        port,
        conf,
        fabric: Fabric::default(),
        ni_timings: Vec::new(),
        smps_sent: 0,
        tid: 0,
    };

    d.run()?;
    Ok(d.fabric)
}

/// Copies the raw graph into owned snapshot nodes, harvesting counters
/// from switch ports on the way.
pub fn walk_fabric(
    fabric: &Fabric,
    transport: &mut IbMadPort,
    conf: &DiscoveryConfig,
    threshold: u32,
    nnmap: &NodeNameMap,
) -> Vec<types::Node> {
    let mut nodes: Vec<types::Node> = Vec::new();

    for node_arc in &fabric.nodes {
        let node = match node_arc.read() {
            Ok(n) => n,
            Err(e) => {
                log::error!("Skipping node with poisoned lock: {:?}", e);
                continue;
            }
        };

        let node_type = match types::NodeType::try_from(node.node_type) {
            Ok(t) => t,
            Err(_) => {
                log::warn!(
                    "Skipping node {:#016x} with unknown node type {}",
                    node.guid,
                    node.node_type
                );
                continue;
            }
        };

        let mut my_node = types::Node {
            guid: node.guid,
            node_type,
            node_desc: nnmap.remap_node_name(node.guid, &node.nodedesc),
            vendor_id: node.vendor_id,
            device_id: node.device_id,
            ports: Vec::new(),
        };

        if node_type == types::NodeType::Switch {
            my_node.ports = perfquery::walk_ports(&node, transport, conf, threshold, nnmap);
        }

        nodes.push(my_node);
    }

    nodes
}

/// One sweep of one adapter: discovers the fabric behind every
/// InfiniBand local port and emits one snapshot per port into `output`.
/// The MAD transport is closed before the raw fabric is dropped, and
/// both are released on every path out of the per-port block.
pub fn net_discover(
    hca: &Hca,
    conf: &DiscoveryConfig,
    threshold: u32,
    nnmap: &NodeNameMap,
    output: Option<&mpsc::Sender<types::Fabric>>,
) {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();

    let start = time::Instant::now();
    let mut total_nodes = 0usize;
    let mut total_ports = 0usize;

    for hca_port in &hca.ports {
        if hca_port.link_layer != "InfiniBand" && hca_port.link_layer != "IB" {
            log::debug!(
                "Skipping CA {} port {} with link layer {}",
                hca.name,
                hca_port.number,
                hca_port.link_layer
            );
            continue;
        }

        log::debug!("Polling CA {} port {}", hca.name, hca_port.number);

        let mut transport = match mad::open_transport(hca, &mad::DEFAULT_MGMT_CLASSES) {
            Ok(t) => t,
            Err(e) => {
                log::error!(
                    "Unable to open MAD transport for CA {} port {}: {}",
                    hca.name,
                    hca_port.number,
                    e
                );
                continue;
            }
        };

        let fabric = match discover_fabric(&mut transport, conf) {
            Ok(f) => f,
            Err(e) => {
                log::error!("Unable to discover fabric: {}", e);
                continue;
            }
        };

        let nodes = walk_fabric(&fabric, &mut transport, conf, threshold, nnmap);

        total_nodes += nodes.len();
        total_ports += nodes.iter().map(|n| n.ports.len()).sum::<usize>();

        // Transport closes first, then the raw graph; the snapshot holds
        // owned data only.
        drop(transport);
        drop(fabric);

        if let Some(output) = output {
            let snapshot = types::Fabric {
                hostname: hostname.clone(),
                ca_name: hca.name.clone(),
                source_port: hca_port.number,
                nodes,
            };

            if output.blocking_send(snapshot).is_err() {
                log::warn!("Snapshot output channel closed, discarding snapshot");
            }
        }
    }

    log::info!(
        "NetDiscover completed in {:.2}s: {} nodes, {} ports",
        start.elapsed().as_secs_f64(),
        total_nodes,
        total_ports
    );
}
