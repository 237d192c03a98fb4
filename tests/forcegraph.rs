#[cfg(test)]
mod forcegraph_tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc;

    use fabricmon::types::{Fabric, Node, NodeType, Port};
    use fabricmon::writer::forcegraph::ForceGraphWriter;
    use fabricmon::writer::FmWriter;

    fn sample_fabric() -> Fabric {
        let sw_port = Port {
            num: 1,
            guid: 0xb7c31c3b29d0c791,
            remote_guid: 0x7ffc_0000_0000_0001,
            remote_desc: "host0001".to_owned(),
            link_width: Some("4X".to_owned()),
            link_speed: Some("FDR".to_owned()),
            counters: HashMap::new(),
        };

        Fabric {
            hostname: "testhost".to_owned(),
            ca_name: "mlx5_0".to_owned(),
            source_port: 1,
            nodes: vec![
                Node {
                    guid: 0xb7c31c3b29d0c791,
                    node_type: NodeType::Switch,
                    node_desc: "ibsw1".to_owned(),
                    vendor_id: 0x00cf09,
                    device_id: 0xd2f2,
                    ports: vec![sw_port],
                },
                Node {
                    guid: 0x7ffc_0000_0000_0001,
                    node_type: NodeType::Ca,
                    node_desc: "host0001".to_owned(),
                    vendor_id: 0x0002c9,
                    device_id: 128,
                    ports: Vec::new(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn writes_topology_json_per_snapshot() {
        let _ = env_logger::try_init();

        let dir = tempfile::tempdir().unwrap();

        let writer = ForceGraphWriter {
            output_dir: dir.path().to_owned(),
        };

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(writer.receive(rx));

        tx.send(sample_fabric()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let path = dir.path().join("testhost-mlx5_0-p1.json");
        let content = std::fs::read_to_string(&path).expect("topology file missing");
        let topo: serde_json::Value = serde_json::from_str(&content).unwrap();

        let nodes = topo["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["id"], "b7c31c3b29d0c791");
        assert_eq!(nodes[0]["desc"], "ibsw1");
        assert_eq!(nodes[0]["nodetype"], 2);
        assert_eq!(nodes[0]["vendor_id"], 0x00cf09);
        assert_eq!(nodes[0]["device_id"], 0xd2f2);

        let links = topo["links"].as_array().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["source"], "b7c31c3b29d0c791");
        assert_eq!(links[0]["target"], "7ffc000000000001");
        assert_eq!(links[0]["link_width"], "4X");
        assert_eq!(links[0]["link_speed"], "FDR");
    }

    #[tokio::test]
    async fn replaces_existing_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testhost-mlx5_0-p1.json");

        std::fs::write(&path, "stale").unwrap();

        let writer = ForceGraphWriter {
            output_dir: dir.path().to_owned(),
        };

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(writer.receive(rx));

        tx.send(sample_fabric()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with('{'), "stale content not replaced");

        // No stray temp files left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
