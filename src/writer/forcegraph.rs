// JSON serialisation for the d3.js force graph topology view.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use crate::types::{Fabric, Node};

use super::FmWriter;

#[derive(Debug, Serialize)]
struct D3Node {
    id: String,
    desc: String,
    nodetype: i32,
    vendor_id: u32,
    device_id: u16,
}

#[derive(Debug, Serialize)]
struct D3Link {
    source: String,
    target: String,
    link_width: String,
    link_speed: String,
}

#[derive(Debug, Default, Serialize)]
struct D3Topology {
    nodes: Vec<D3Node>,
    links: Vec<D3Link>,
}

pub struct ForceGraphWriter {
    pub output_dir: PathBuf,
}

impl FmWriter for ForceGraphWriter {
    async fn receive(self, mut input: mpsc::Receiver<Fabric>) {
        while let Some(fabric) = input.recv().await {
            let filename = format!(
                "{}-{}-p{}.json",
                fabric.hostname, fabric.ca_name, fabric.source_port
            );

            let topo = make_topology(&fabric.nodes);

            if let Err(e) = write_topology(&self.output_dir.join(filename), &topo) {
                log::error!("Cannot write d3.js JSON topology: {}", e);
            }
        }

        log::debug!("ForceGraphWriter input channel closed.");
    }
}

// Transforms snapshot nodes into d3.js nodes and links. Only linked
// ports produce links; descriptions were already remapped by the
// discovery engine.
fn make_topology(nodes: &[Node]) -> D3Topology {
    let mut topo = D3Topology::default();

    for node in nodes {
        topo.nodes.push(D3Node {
            id: format!("{:016x}", node.guid),
            desc: node.node_desc.clone(),
            nodetype: node.node_type as i32,
            vendor_id: node.vendor_id,
            device_id: node.device_id,
        });

        for port in &node.ports {
            if port.remote_guid != 0 {
                topo.links.push(D3Link {
                    source: format!("{:016x}", node.guid),
                    target: format!("{:016x}", port.remote_guid),
                    link_width: port.link_width.clone().unwrap_or_default(),
                    link_speed: port.link_speed.clone().unwrap_or_default(),
                });
            }
        }
    }

    topo
}

// Writes to a temp file in the target directory and renames it into
// place, so a concurrent reader never sees a partial file.
fn write_topology(path: &Path, topo: &D3Topology) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "output path has no parent"))?;

    let tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(tmp.as_file(), topo)?;

    tmp.persist(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(())
}
