// Snapshot writers. A writer consumes fabric snapshots from its channel
// until the channel is closed by the fan-out.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::Fabric;

pub mod forcegraph;
pub mod influxdb;

/// Writer channels hold at most one snapshot; a slow writer
/// backpressures the fan-out and, through it, the sweep.
pub const WRITER_CHAN_CAPACITY: usize = 1;

pub trait FmWriter: Send + 'static {
    fn receive(self, input: mpsc::Receiver<Fabric>) -> impl Future<Output = ()> + Send;
}

/// Spawns a writer on its own task, returning the sending half of its
/// channel and the task handle.
pub fn spawn<W: FmWriter>(writer: W) -> (mpsc::Sender<Fabric>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(WRITER_CHAN_CAPACITY);
    let handle = tokio::spawn(writer.receive(rx));
    (tx, handle)
}
