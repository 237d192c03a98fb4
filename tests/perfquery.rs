#[cfg(test)]
mod perfquery_tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use fabricmon::mad::fields;
    use fabricmon::mad::IbMadPort;
    use fabricmon::netdisc::{self, DiscoveryConfig};
    use fabricmon::nodenamemap::NodeNameMap;
    use fabricmon::sim;
    use fabricmon::types::{Counter, CounterValue, Node, NodeType};

    const HCA_GUID: u64 = 0x7ffc_0000_0000_0001;
    const SW_GUID: u64 = 0x7ffc_0000_0000_0100;

    // One HCA linked to port 1 of a two-port switch; switch port 2 is
    // left Down. The HCA is the first hop of the directed-route tree.
    fn build_fabric(
        fabric: &mut sim::Fabric,
        customize: impl FnOnce(&Rc<RefCell<sim::Node>>, &Rc<RefCell<sim::Node>>),
    ) {
        let hca_rc = fabric.add_hca(sim::Node::new_hca("host0001", HCA_GUID));
        let hca_port = Rc::new(RefCell::new(sim::Port::new_port(1, 100, hca_rc.clone())));
        hca_rc.borrow_mut().ports.push(hca_port.clone());

        let sw_rc = fabric.add_switch(sim::Node::new_switch("ibsw1", SW_GUID, 2));
        {
            let mut sw_ref = sw_rc.borrow_mut();
            for i in 0..=2 {
                let port = sim::Port::new_port(i, 200, sw_rc.clone());
                sw_ref.ports.push(Rc::new(RefCell::new(port)));
            }
        }

        let sw_port1 = sw_rc.borrow().ports[1].clone();
        sim::connect_ports(&hca_port, &sw_port1);

        fabric.dr_paths.insert([0; 64], Rc::downgrade(&hca_port));

        customize(&hca_rc, &sw_rc);
    }

    // Runs `passes` discover + walk cycles against a simulated fabric,
    // returning the snapshot nodes of every pass.
    fn run_scans<F>(customize: F, threshold: u32, nnmap: &NodeNameMap, passes: usize) -> Vec<Vec<Node>>
    where
        F: FnOnce(&Rc<RefCell<sim::Node>>, &Rc<RefCell<sim::Node>>) + Send + 'static,
    {
        let _ = env_logger::try_init();

        let (client, server) = UnixStream::pair().unwrap();
        let client_file = unsafe { fs::File::from_raw_fd(client.into_raw_fd()) };
        let server_file = unsafe { fs::File::from_raw_fd(server.into_raw_fd()) };

        let (tx, rx) = channel::<bool>();
        let barrier = Arc::new(Barrier::new(2));
        let barrier_clone = barrier.clone();

        thread::spawn(move || {
            let mut fabric = sim::Fabric::new(server_file);
            build_fabric(&mut fabric, customize);
            barrier_clone.wait();
            let _ = fabric.run(rx);
        });

        let mut port = IbMadPort {
            file: client_file,
            agents: HashMap::new(),
        };

        barrier.wait();

        let conf = DiscoveryConfig {
            timeout_ms: 200,
            retries: 1,
            ..Default::default()
        };

        let mut results = Vec::new();
        for _ in 0..passes {
            let raw = netdisc::discover_fabric(&mut port, &conf).expect("discovery failed");
            results.push(netdisc::walk_fabric(&raw, &mut port, &conf, threshold, nnmap));
        }

        let _ = tx.send(true);
        results
    }

    fn empty_nnmap() -> NodeNameMap {
        NodeNameMap::new("/nonexistent/ib-node-name-map")
    }

    fn switch_node(nodes: &[Node]) -> &Node {
        nodes
            .iter()
            .find(|n| n.node_type == NodeType::Switch)
            .expect("no switch in snapshot")
    }

    #[test]
    fn single_switch_one_active_port() {
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                sw.borrow().ports[1]
                    .borrow_mut()
                    .set_ext_counter(fields::PC_EXT_XMT_BYTES, 42);
            },
            90,
            &nnmap,
            1,
        );

        let sw = switch_node(&scans[0]);
        assert_eq!(sw.guid, SW_GUID);
        assert_eq!(sw.node_desc, "ibsw1");

        let port1 = sw.ports.iter().find(|p| p.num == 1).expect("port 1 missing");
        assert_eq!(port1.remote_guid, HCA_GUID);
        assert_eq!(
            port1.counters.get(&Counter::PortXmitData),
            Some(&CounterValue::Ext(42))
        );
        assert!(port1.link_width.is_some());
        assert!(port1.link_speed.is_some());
    }

    #[test]
    fn down_port_emits_guid_only() {
        let nnmap = empty_nnmap();
        let scans = run_scans(|_hca, _sw| {}, 90, &nnmap, 1);

        let sw = switch_node(&scans[0]);
        let port2 = sw.ports.iter().find(|p| p.num == 2).expect("port 2 missing");

        assert_eq!(port2.guid, SW_GUID);
        assert_eq!(port2.remote_guid, 0);
        assert!(port2.counters.is_empty());
        assert!(port2.link_width.is_none());
        assert!(port2.link_speed.is_none());
    }

    #[test]
    fn xmit_wait_gated_on_cap_mask() {
        // Without PC_XMIT_WAIT_SUP the populated counter must not be
        // emitted.
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                sw.borrow_mut().pma_cap_mask = u16::from_be(fields::IB_PM_EXT_WIDTH_SUPPORTED);
                sw.borrow().ports[1]
                    .borrow_mut()
                    .set_counter(fields::PC_XMT_WAIT, 77);
            },
            90,
            &nnmap,
            1,
        );

        let sw = switch_node(&scans[0]);
        let port1 = sw.ports.iter().find(|p| p.num == 1).unwrap();

        assert!(!port1.counters.contains_key(&Counter::PortXmitWait));
        assert!(port1.counters.contains_key(&Counter::SymbolErrorCounter));
    }

    #[test]
    fn xmit_wait_present_when_supported() {
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                sw.borrow().ports[1]
                    .borrow_mut()
                    .set_counter(fields::PC_XMT_WAIT, 77);
            },
            90,
            &nnmap,
            1,
        );

        let sw = switch_node(&scans[0]);
        let port1 = sw.ports.iter().find(|p| p.num == 1).unwrap();

        assert_eq!(
            port1.counters.get(&Counter::PortXmitWait),
            Some(&CounterValue::Std(77))
        );
    }

    #[test]
    fn threshold_breach_resets_selected_counter_only() {
        // SymbolErrorCounter at 0xfffe with a 90% threshold of limit
        // 0xffff must be reset; LinkDownedCounter at 10 must survive.
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                let sw_ref = sw.borrow();
                let mut port1 = sw_ref.ports[1].borrow_mut();
                port1.set_counter(fields::PC_ERR_SYM, 0xfffe);
                port1.set_counter(fields::PC_LINK_DOWNED, 10);
            },
            90,
            &nnmap,
            2,
        );

        // First pass reports the pre-reset values
        let port1 = switch_node(&scans[0])
            .ports
            .iter()
            .find(|p| p.num == 1)
            .unwrap()
            .clone();
        assert_eq!(
            port1.counters.get(&Counter::SymbolErrorCounter),
            Some(&CounterValue::Std(0xfffe))
        );
        assert_eq!(
            port1.counters.get(&Counter::LinkDownedCounter),
            Some(&CounterValue::Std(10))
        );

        // Second pass observes the reset of the selected counter only
        let port1 = switch_node(&scans[1])
            .ports
            .iter()
            .find(|p| p.num == 1)
            .unwrap()
            .clone();
        assert_eq!(
            port1.counters.get(&Counter::SymbolErrorCounter),
            Some(&CounterValue::Std(0))
        );
        assert_eq!(
            port1.counters.get(&Counter::LinkDownedCounter),
            Some(&CounterValue::Std(10))
        );
    }

    #[test]
    fn below_threshold_never_resets() {
        // 0xE665 == 0xffff * 90 / 100; an equal value must not trigger.
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                sw.borrow().ports[1]
                    .borrow_mut()
                    .set_counter(fields::PC_ERR_SYM, 0xe665);
            },
            90,
            &nnmap,
            2,
        );

        for scan in &scans {
            let port1 = switch_node(scan).ports.iter().find(|p| p.num == 1).unwrap();
            assert_eq!(
                port1.counters.get(&Counter::SymbolErrorCounter),
                Some(&CounterValue::Std(0xe665))
            );
        }
    }

    #[test]
    fn extended_counters_gated_on_cap_mask() {
        // Neither EXT_WIDTH_SUPPORTED nor EXT_WIDTH_NOIETF_SUP: only
        // standard counters are emitted.
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                sw.borrow_mut().pma_cap_mask = 0;
                sw.borrow().ports[1]
                    .borrow_mut()
                    .set_ext_counter(fields::PC_EXT_XMT_BYTES, 42);
            },
            90,
            &nnmap,
            1,
        );

        let sw = switch_node(&scans[0]);
        let port1 = sw.ports.iter().find(|p| p.num == 1).unwrap();

        assert!(!port1.counters.contains_key(&Counter::PortXmitData));
        assert!(port1
            .counters
            .values()
            .all(|v| matches!(v, CounterValue::Std(_))));
        assert!(port1.counters.contains_key(&Counter::SymbolErrorCounter));
    }

    #[test]
    fn extended_counters_never_reset() {
        // An extended counter beyond every standard limit must survive
        // both passes untouched.
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                sw.borrow().ports[1]
                    .borrow_mut()
                    .set_ext_counter(fields::PC_EXT_RCV_BYTES, u64::MAX - 1);
            },
            90,
            &nnmap,
            2,
        );

        for scan in &scans {
            let port1 = switch_node(scan).ports.iter().find(|p| p.num == 1).unwrap();
            assert_eq!(
                port1.counters.get(&Counter::PortRcvData),
                Some(&CounterValue::Ext(u64::MAX - 1))
            );
        }
    }

    #[test]
    fn fdr10_speed_from_vendor_attribute() {
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                let sw_ref = sw.borrow();
                let mut port1 = sw_ref.ports[1].borrow_mut();
                fields::set_field(
                    &mut port1.ext_info,
                    fields::MLNX_EXT_PORT_LINK_SPEED_ACTIVE,
                    fields::FDR10,
                );
            },
            90,
            &nnmap,
            1,
        );

        let sw = switch_node(&scans[0]);
        let port1 = sw.ports.iter().find(|p| p.num == 1).unwrap();
        assert_eq!(port1.link_speed.as_deref(), Some("FDR10"));
    }

    #[test]
    fn extended_speed_preferred_when_advertised() {
        let nnmap = empty_nnmap();
        let scans = run_scans(
            |_hca, sw| {
                let sw_ref = sw.borrow();
                // Extended speed support is advertised by the management
                // port's capability mask.
                sw_ref.ports[0]
                    .borrow_mut()
                    .port_info
                    .set_cap_mask(u32::from_be(fields::IB_PORT_CAP_HAS_EXT_SPEEDS));
                sw_ref.ports[1].borrow_mut().port_info.set_link_speed_ext_active(2);
            },
            90,
            &nnmap,
            1,
        );

        let sw = switch_node(&scans[0]);
        let port1 = sw.ports.iter().find(|p| p.num == 1).unwrap();
        assert_eq!(port1.link_speed.as_deref(), Some("EDR"));
    }

    #[test]
    fn base_speed_without_extensions() {
        let nnmap = empty_nnmap();
        let scans = run_scans(|_hca, _sw| {}, 90, &nnmap, 1);

        let sw = switch_node(&scans[0]);
        let port1 = sw.ports.iter().find(|p| p.num == 1).unwrap();
        assert_eq!(port1.link_speed.as_deref(), Some("SDR"));
        assert_eq!(port1.link_width.as_deref(), Some("1X"));
    }
}
