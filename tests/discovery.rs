#[cfg(test)]
mod discovery_tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::io::Write;
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use fabricmon::mad::IbMadPort;
    use fabricmon::netdisc::{self, DiscoveryConfig};
    use fabricmon::nodenamemap::NodeNameMap;
    use fabricmon::sim;
    use fabricmon::types::{Node, NodeType};

    const HCA_GUID: u64 = 0x7ffc_0000_0000_0001;
    const SW1_GUID: u64 = 0xb7c31c3b29d0c791;
    const SW2_GUID: u64 = 0xa31de6b2f83b0a91;

    // hca <-> sw1 port 1; sw1 port 2 <-> sw2 port 1.
    fn build_chain_fabric(fabric: &mut sim::Fabric) {
        let hca_rc = fabric.add_hca(sim::Node::new_hca("host0001", HCA_GUID));
        let hca_port = Rc::new(RefCell::new(sim::Port::new_port(1, 100, hca_rc.clone())));
        hca_rc.borrow_mut().ports.push(hca_port.clone());

        let sw1_rc = fabric.add_switch(sim::Node::new_switch("ibsw1", SW1_GUID, 2));
        let sw2_rc = fabric.add_switch(sim::Node::new_switch("ibsw2", SW2_GUID, 2));

        for (sw_rc, lid) in [(&sw1_rc, 200u16), (&sw2_rc, 300u16)] {
            let mut sw_ref = sw_rc.borrow_mut();
            for i in 0..=2 {
                let port = sim::Port::new_port(i, lid, (*sw_rc).clone());
                sw_ref.ports.push(Rc::new(RefCell::new(port)));
            }
        }

        let sw1_port1 = sw1_rc.borrow().ports[1].clone();
        let sw1_port2 = sw1_rc.borrow().ports[2].clone();
        let sw2_port1 = sw2_rc.borrow().ports[1].clone();

        sim::connect_ports(&hca_port, &sw1_port1);
        sim::connect_ports(&sw1_port2, &sw2_port1);

        fabric.dr_paths.insert([0; 64], Rc::downgrade(&hca_port));
    }

    // Discovers the chain fabric `passes` times, returning the snapshot
    // nodes of every pass. The raw fabric is dropped before the nodes
    // are returned, so whatever the caller inspects is owned data only.
    fn discover_chain(nnmap: &NodeNameMap, passes: usize) -> Vec<Vec<Node>> {
        let _ = env_logger::try_init();

        let (client, server) = UnixStream::pair().unwrap();
        let client_file = unsafe { fs::File::from_raw_fd(client.into_raw_fd()) };
        let server_file = unsafe { fs::File::from_raw_fd(server.into_raw_fd()) };

        let (tx, rx) = channel::<bool>();
        let barrier = Arc::new(Barrier::new(2));
        let barrier_clone = barrier.clone();

        thread::spawn(move || {
            let mut fabric = sim::Fabric::new(server_file);
            build_chain_fabric(&mut fabric);
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
            let nodes = netdisc::walk_fabric(&raw, &mut port, &conf, 90, nnmap);
            drop(raw);
            results.push(nodes);
        }

        drop(port);
        let _ = tx.send(true);
        results
    }

    #[test]
    fn chain_topology_discovered() {
        let nnmap = NodeNameMap::new("/nonexistent/ib-node-name-map");
        let scans = discover_chain(&nnmap, 1);
        let nodes = &scans[0];

        assert_eq!(nodes.len(), 3);

        // Nodes are emitted in discovered order, local CA first.
        assert_eq!(nodes[0].node_type, NodeType::Ca);
        assert_eq!(nodes[0].guid, HCA_GUID);
        assert!(nodes[0].ports.is_empty(), "non-switch nodes carry no ports");

        let sw1 = nodes.iter().find(|n| n.guid == SW1_GUID).unwrap();
        let sw2 = nodes.iter().find(|n| n.guid == SW2_GUID).unwrap();

        assert_eq!(sw1.node_type, NodeType::Switch);
        assert_eq!(sw1.node_desc, "ibsw1");

        let sw1_port1 = sw1.ports.iter().find(|p| p.num == 1).unwrap();
        assert_eq!(sw1_port1.remote_guid, HCA_GUID);
        assert_eq!(sw1_port1.remote_desc, "host0001");

        let sw1_port2 = sw1.ports.iter().find(|p| p.num == 2).unwrap();
        assert_eq!(sw1_port2.remote_guid, SW2_GUID);
        assert_eq!(sw1_port2.remote_desc, "ibsw2");

        let sw2_port1 = sw2.ports.iter().find(|p| p.num == 1).unwrap();
        assert_eq!(sw2_port1.remote_guid, SW1_GUID);
    }

    #[test]
    fn snapshot_valid_after_fabric_destroyed() {
        // discover_chain drops the raw fabric and the transport before
        // returning; every field of the snapshot must still be intact.
        let nnmap = NodeNameMap::new("/nonexistent/ib-node-name-map");
        let scans = discover_chain(&nnmap, 1);
        let nodes = &scans[0];

        for node in nodes {
            assert_ne!(node.guid, 0);
            assert!(!node.node_desc.is_empty());
        }

        let sw1 = nodes.iter().find(|n| n.guid == SW1_GUID).unwrap();
        assert_eq!(sw1.device_id, 0xd2f2);
        assert_eq!(sw1.vendor_id, 0x00cf09);
        for port in &sw1.ports {
            if port.remote_guid != 0 {
                assert!(!port.remote_desc.is_empty());
            }
        }
    }

    #[test]
    fn node_name_map_remaps_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ib-node-name-map");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "0xb7c31c3b29d0c791 ibsw1(root-sw)").unwrap();
        drop(f);

        let nnmap = NodeNameMap::new(&path);
        let scans = discover_chain(&nnmap, 1);

        let sw1 = scans[0].iter().find(|n| n.guid == SW1_GUID).unwrap();
        assert_eq!(sw1.node_desc, "ibsw1(root-sw)");

        // The unmapped switch keeps its library-provided description.
        let sw2 = scans[0].iter().find(|n| n.guid == SW2_GUID).unwrap();
        assert_eq!(sw2.node_desc, "ibsw2");
    }

    #[test]
    fn node_name_map_hot_update_visible_in_next_sweep() {
        let _ = env_logger::try_init();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ib-node-name-map");
        fs::File::create(&path).unwrap();

        let nnmap = NodeNameMap::new(&path);

        // Two passes over one live simulator; the map is updated between
        // them.
        let (client, server) = UnixStream::pair().unwrap();
        let client_file = unsafe { fs::File::from_raw_fd(client.into_raw_fd()) };
        let server_file = unsafe { fs::File::from_raw_fd(server.into_raw_fd()) };

        let (tx, rx) = channel::<bool>();
        let barrier = Arc::new(Barrier::new(2));
        let barrier_clone = barrier.clone();

        thread::spawn(move || {
            let mut fabric = sim::Fabric::new(server_file);
            build_chain_fabric(&mut fabric);
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

        let raw = netdisc::discover_fabric(&mut port, &conf).unwrap();
        let before = netdisc::walk_fabric(&raw, &mut port, &conf, 90, &nnmap);
        drop(raw);
        assert_eq!(
            before.iter().find(|n| n.guid == SW1_GUID).unwrap().node_desc,
            "ibsw1"
        );

        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "0xb7c31c3b29d0c791 ibsw1(root-sw)").unwrap();
        drop(f);
        nnmap.reload().unwrap();

        let raw = netdisc::discover_fabric(&mut port, &conf).unwrap();
        let after = netdisc::walk_fabric(&raw, &mut port, &conf, 90, &nnmap);
        drop(raw);
        assert_eq!(
            after.iter().find(|n| n.guid == SW1_GUID).unwrap().node_desc,
            "ibsw1(root-sw)"
        );

        let _ = tx.send(true);
    }
}
