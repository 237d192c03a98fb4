// Sweep scheduling and snapshot fan-out.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::{interval, MissedTickBehavior};

use crate::ca::Hca;
use crate::config::FabricmonConf;
use crate::error::Error;
use crate::netdisc::{self, DiscoveryConfig};
use crate::nodenamemap::NodeNameMap;
use crate::types::Fabric;
use crate::writer::{self, forcegraph::ForceGraphWriter, influxdb::InfluxDbWriter};

/// Duplicates every received snapshot to all writer channels, in list
/// order, so every writer observes the identical sequence. Sends block,
/// so a slow writer backpressures the sweep instead of dropping
/// snapshots.
pub async fn splitter(mut input: mpsc::Receiver<Fabric>, outputs: Vec<mpsc::Sender<Fabric>>) {
    while let Some(fabric) = input.recv().await {
        for output in &outputs {
            if output.send(fabric.clone()).await.is_err() {
                log::warn!("Writer channel closed; dropping snapshot for that writer");
            }
        }
    }

    log::debug!("Splitter input channel closed.");
}

// Discovery and MAD queries are blocking native I/O; they run
// synchronously on the scheduler task and the ticker simply coalesces
// when a sweep overruns the poll interval.
fn sweep(
    hcas: &[Hca],
    conf: &DiscoveryConfig,
    threshold: u32,
    nnmap: &NodeNameMap,
    output: Option<&mpsc::Sender<Fabric>>,
) {
    for hca in hcas {
        netdisc::net_discover(hca, conf, threshold, nnmap, output);
    }
}

/// Runs the daemon: spawns one task per configured writer plus the
/// fan-out splitter, performs a first sweep with a null output, then
/// sweeps on every tick until SIGINT / SIGTERM. With `daemonize` false a
/// single output sweep runs instead of the loop.
pub async fn run(
    conf: &FabricmonConf,
    hcas: Vec<Hca>,
    nnmap: NodeNameMap,
    daemonize: bool,
) -> Result<(), Error> {
    let mut writer_txs: Vec<mpsc::Sender<Fabric>> = Vec::new();
    let mut writer_handles = Vec::new();

    if conf.topology.enabled {
        let (tx, handle) = writer::spawn(ForceGraphWriter {
            output_dir: conf.topology.output_dir.clone(),
        });
        writer_txs.push(tx);
        writer_handles.push(handle);
    }

    for influx_conf in &conf.influxdb {
        let (tx, handle) = writer::spawn(InfluxDbWriter {
            conf: influx_conf.clone(),
        });
        writer_txs.push(tx);
        writer_handles.push(handle);
    }

    let (fanout_tx, fanout_rx) = mpsc::channel(1);
    let splitter_handle = tokio::spawn(splitter(fanout_rx, writer_txs));

    let disc_conf = DiscoveryConfig {
        m_key: conf.m_key,
        ..Default::default()
    };
    let threshold = conf.counter_reset_threshold;

    // First sweep warms the management plane and surfaces permission
    // problems before the daemon reports itself healthy.
    task::block_in_place(|| sweep(&hcas, &disc_conf, threshold, &nnmap, None));

    if daemonize {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let mut ticker = interval(conf.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    task::block_in_place(|| {
                        sweep(&hcas, &disc_conf, threshold, &nnmap, Some(&fanout_tx))
                    });
                }
                _ = sigint.recv() => {
                    log::info!("Received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    log::info!("Received SIGTERM, shutting down");
                    break;
                }
            }
        }
    } else {
        task::block_in_place(|| sweep(&hcas, &disc_conf, threshold, &nnmap, Some(&fanout_tx)));
    }

    // Closing the splitter input cascades: the splitter drops the writer
    // senders, which terminates every writer task.
    drop(fanout_tx);

    let _ = splitter_handle.await;
    for handle in writer_handles {
        let _ = handle.await;
    }

    // Adapter handles are released here.
    drop(hcas);

    Ok(())
}
