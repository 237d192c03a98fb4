// InfluxDB line-protocol batch writer.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::config::InfluxDbConf;
use crate::types::{CounterValue, Fabric, NodeType};

use super::FmWriter;

pub struct InfluxDbWriter {
    pub conf: InfluxDbConf,
}

impl FmWriter for InfluxDbWriter {
    async fn receive(self, mut input: mpsc::Receiver<Fabric>) {
        let client = match reqwest::Client::builder()
            .connect_timeout(self.conf.timeout)
            .timeout(self.conf.timeout)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                log::error!("Cannot build InfluxDB HTTP client: {}", e);
                return;
            }
        };

        let write_url = format!("{}/write", self.conf.url.trim_end_matches('/'));

        while let Some(fabric) = input.recv().await {
            let lines = make_batch(&fabric);
            if lines.is_empty() {
                continue;
            }

            log::info!("InfluxDB batch contains {} points", lines.len());

            let mut query: Vec<(&str, &str)> =
                vec![("db", self.conf.database.as_str()), ("precision", "s")];
            if let Some(rp) = self.conf.retention_policy.as_deref() {
                query.push(("rp", rp));
            }

            let mut req = client.post(&write_url).query(&query);
            if !self.conf.username.is_empty() {
                req = req.basic_auth(&self.conf.username, Some(&self.conf.password));
            }

            match req.body(lines.join("\n")).send().await {
                Ok(resp) => {
                    if !resp.status().is_success() {
                        log::error!("InfluxDB write returned status {}", resp.status());
                    }
                }
                Err(e) => log::error!("InfluxDB write failed: {}", e),
            }
        }

        log::debug!("InfluxDBWriter input channel closed.");
    }
}

// Line protocol forbids unescaped commas, equals signs and spaces in tag
// values.
fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

// One point per counter sample. Only switch nodes contribute points.
fn make_batch(fabric: &Fabric) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    for node in &fabric.nodes {
        if node.node_type != NodeType::Switch {
            continue;
        }

        for port in &node.ports {
            for (counter, value) in &port.counters {
                // InfluxDB < 1.6 does not support uint64; truncate
                // 64-bit counters to 63 bits.
                let value: i64 = match value {
                    CounterValue::Std(v) => *v as i64,
                    CounterValue::Ext(v) => (v & 0x7fff_ffff_ffff_ffff) as i64,
                };

                let mut tags = vec![
                    format!("host={}", escape_tag(&fabric.hostname)),
                    format!("hca={}", escape_tag(&fabric.ca_name)),
                    format!("src_port={}", fabric.source_port),
                    format!("guid={:016x}", node.guid),
                    format!("node_desc={}", escape_tag(&node.node_desc)),
                    format!("port={}", port.num),
                    format!("counter={}", counter),
                ];

                if port.remote_guid != 0 {
                    tags.push(format!("remote_guid={:016x}", port.remote_guid));
                    tags.push(format!("remote_node_desc={}", escape_tag(&port.remote_desc)));
                }

                lines.push(format!(
                    "fabricmon_counters,{} value={}i {}",
                    tags.join(","),
                    value,
                    now
                ));
            }
        }
    }

    lines
}
