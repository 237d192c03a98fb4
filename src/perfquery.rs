// Per-switch port walk and counter harvest.
//
// Note: in PortCounters, PortCountersExtended, PortXmitDataSL and
// PortRcvDataSL, components that represent data (e.g. PortXmitData and
// PortRcvData) indicate octets divided by 4 rather than just octets.

use std::collections::HashMap;
use std::io;

use crate::bitops;
use crate::mad::fields::{self, port_info};
use crate::mad::{perf, IbMadPort};
use crate::netdisc::{DiscoveryConfig, RawNode};
use crate::nodenamemap::NodeNameMap;
use crate::types::{self, Counter, CounterValue, EXT_COUNTERS, STD_COUNTERS};

/// Retrieves all counters for a single port, resetting any standard
/// counter found above its configured threshold.
pub fn get_port_counters(
    transport: &mut IbMadPort,
    lid: u16,
    port_num: u8,
    conf: &DiscoveryConfig,
    threshold: u32,
) -> io::Result<HashMap<Counter, CounterValue>> {
    let mut counters: HashMap<Counter, CounterValue> = HashMap::new();

    // PerfMgt ClassPortInfo is a required attribute
    let cpi = perf::pma_query(
        transport,
        lid,
        port_num,
        perf::CLASS_PORT_INFO,
        conf.timeout_ms,
        conf.retries,
    )
    .map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("Port {} CLASS_PORT_INFO query failed: {}", port_num, e),
        )
    })?;

    // Keep capMask in network byte order for easier bitwise operations
    // with the capability constants.
    let cap_mask = bitops::htons(fields::get_field(&cpi, fields::CPI_CAP_MASK) as u16);

    // Fetch standard (32 bit (or less)) counters
    match perf::pma_query(
        transport,
        lid,
        port_num,
        perf::IB_GSI_PORT_COUNTERS,
        conf.timeout_ms,
        conf.retries,
    ) {
        Ok(buf) => {
            let mut sel_mask: u32 = 0;

            for meta in STD_COUNTERS.iter() {
                if meta.counter == Counter::PortXmitWait
                    && cap_mask & fields::IB_PM_PC_XMIT_WAIT_SUP == 0
                {
                    continue; // Counter not supported
                }

                let value = fields::get_field(&buf, meta.field) as u32;
                counters.insert(meta.counter, CounterValue::Std(value));

                if value as u64 > meta.limit * threshold as u64 / 100 {
                    log::warn!(
                        "Port {} counter {} ({}) exceeds {}% of its limit {}",
                        port_num,
                        meta.counter,
                        value,
                        threshold,
                        meta.limit
                    );
                    sel_mask |= meta.select;
                }
            }

            if sel_mask > 0 {
                log::warn!(
                    "Resetting counters on lid {} port {}, select mask {:#x}",
                    lid,
                    port_num,
                    sel_mask
                );

                if let Err(e) = perf::pma_reset(
                    transport,
                    lid,
                    port_num,
                    sel_mask,
                    conf.timeout_ms,
                    conf.retries,
                ) {
                    log::error!("PortCounters reset failed: {}", e);
                }
            }
        }
        Err(e) => log::warn!("Port {} PORT_COUNTERS query failed: {}", port_num, e),
    }

    if cap_mask & fields::IB_PM_EXT_WIDTH_SUPPORTED == 0
        && cap_mask & fields::IB_PM_EXT_WIDTH_NOIETF_SUP == 0
    {
        // Pre-QDR hardware carries only the standard counters.
        log::warn!("Port {} does not support extended counters", port_num);
        return Ok(counters);
    }

    // Fetch extended (64 bit) counters
    match perf::pma_query(
        transport,
        lid,
        port_num,
        perf::IB_GSI_PORT_COUNTERS_EXT,
        conf.timeout_ms,
        conf.retries,
    ) {
        Ok(buf) => {
            for meta in EXT_COUNTERS.iter() {
                counters.insert(meta.counter, CounterValue::Ext(fields::get_field(&buf, meta.field)));
            }
        }
        Err(e) => log::warn!("Port {} PORT_COUNTERS_EXT query failed: {}", port_num, e),
    }

    Ok(counters)
}

/// Walks the ports of one switch node, classifying link state and
/// harvesting counters from active, linked ports.
pub fn walk_ports(
    node: &RawNode,
    transport: &mut IbMadPort,
    conf: &DiscoveryConfig,
    threshold: u32,
    nnmap: &NodeNameMap,
) -> Vec<types::Port> {
    log::debug!(
        "Node type: {}, node descr: {}, num. ports: {}, node GUID: {:#016x}",
        node.node_type,
        nnmap.remap_node_name(node.guid, &node.nodedesc),
        node.nports,
        node.guid
    );

    let mut ports: Vec<types::Port> = Vec::with_capacity(node.nports as usize + 1);

    // Ports are indexed by port number; any entry may be vacant, and
    // non-switch nodes have no management port at index 0.
    for port_num in 0..=node.nports {
        let port_arc = match node.ports.get(port_num as usize).and_then(|p| p.as_ref()) {
            Some(p) => p,
            None => continue,
        };

        let port = match port_arc.read() {
            Ok(p) => p,
            Err(e) => {
                log::error!("Skipping port {} with poisoned lock: {:?}", port_num, e);
                continue;
            }
        };

        let mut my_port = types::Port {
            num: port_num,
            guid: port.guid,
            ..Default::default()
        };

        let port_state = port.info.port_state();
        let phys_state = port.info.port_physical_state();

        // C14-24.2.1 states that a down port allows for invalid data to
        // be returned for all PortInfo components except PortState and
        // PortPhysicalState.
        if port_state == types::PortState::Down as u8 {
            ports.push(my_port);
            continue;
        }

        let link_width = port.info.link_width_active();
        my_port.link_width = Some(types::link_width_to_str(link_width as u64));

        // Extended speed support is advertised by the management port of
        // the containing switch.
        let cap_mask_src: port_info = if node.node_type == types::NodeType::Switch as u8 {
            node.ports
                .first()
                .and_then(|p| p.as_ref())
                .and_then(|p| p.read().ok().map(|g| g.info))
                .unwrap_or(port.info)
        } else {
            port.info
        };

        let cap_mask = bitops::htonl(cap_mask_src.cap_mask());

        let mut link_speed_ext = 0u8;
        if cap_mask & fields::IB_PORT_CAP_HAS_EXT_SPEEDS != 0 {
            link_speed_ext = port.info.link_speed_ext_active();
        }

        if link_speed_ext > 0 {
            my_port.link_speed = Some(types::link_speed_ext_to_str(link_speed_ext as u64));
        } else {
            let fdr10 = fields::get_field(&port.ext_info, fields::MLNX_EXT_PORT_LINK_SPEED_ACTIVE)
                & fields::FDR10;

            if fdr10 != 0 {
                my_port.link_speed = Some("FDR10".to_owned());
            } else {
                my_port.link_speed =
                    Some(types::link_speed_to_str(port.info.link_speed_active() as u64));
            }
        }

        log::debug!(
            "Port {}, port state: {}, phys state: {}, link width: {}, link speed: {}",
            port_num,
            types::port_state_to_str(port_state as u64),
            types::port_phys_state_to_str(phys_state as u64),
            my_port.link_width.as_deref().unwrap_or(""),
            my_port.link_speed.as_deref().unwrap_or("")
        );

        // Remote port may be absent while the port is polling / armed.
        if let Some(remote_arc) = port.remote_port.as_ref().and_then(|w| w.upgrade()) {
            if let Ok(remote) = remote_arc.read() {
                if let Some(remote_node_arc) = remote.parent.upgrade() {
                    if let Ok(remote_node) = remote_node_arc.read() {
                        my_port.remote_guid = remote_node.guid;
                        my_port.remote_desc =
                            nnmap.remap_node_name(remote_node.guid, &remote_node.nodedesc);
                    }
                }

                // Port counters will only be fetched if port is ACTIVE + LINKUP
                if port_state == types::PortState::Active as u8
                    && phys_state == types::PortPhysState::LinkUp as u8
                {
                    // Determine max width supported by both ends
                    let max_width = bitops::max_pow2_divisor(
                        port.info.link_width_supported() as u64,
                        remote.info.link_width_supported() as u64,
                    );

                    if link_width as u64 != max_width {
                        log::warn!(
                            "Port {} link width is not the max width supported by both ports",
                            port_num
                        );
                    }

                    match get_port_counters(transport, node.lid, port_num, conf, threshold) {
                        Ok(counters) => my_port.counters = counters,
                        Err(e) => {
                            log::error!("Cannot get counters for port {}: {}", port_num, e)
                        }
                    }
                }
            }
        }

        ports.push(my_port);
    }

    ports
}
