// InfiniBand node name map lookups, backed by a watched file. The file
// format is described in man page ibnetdiscover(8).

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use inotify::{EventMask, Inotify, WatchMask};
use tokio::io::unix::AsyncFd;

pub const DEFAULT_NODE_NAME_MAP: &str = "/etc/opensm/ib-node-name-map";

const WATCH_EVENTS: WatchMask = WatchMask::MODIFY
    .union(WatchMask::CLOSE_WRITE)
    .union(WatchMask::DELETE_SELF)
    .union(WatchMask::MOVE_SELF)
    .union(WatchMask::ATTRIB);

/// A mapping of 64-bit GUIDs to node names / descriptions. Handles are
/// cheap to clone; lookups see either the previous or the freshly
/// reloaded map, never a partial parse.
#[derive(Debug, Clone)]
pub struct NodeNameMap {
    path: PathBuf,
    nodes: Arc<RwLock<HashMap<u64, String>>>,
}

// Tokenizes a line, honouring quoted strings. Quote characters are kept
// in the emitted field.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut last_quote: Option<char> = None;

    for c in line.chars() {
        match last_quote {
            Some(q) if c == q => {
                last_quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                last_quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }

    if !current.is_empty() {
        fields.push(current);
    }

    fields
}

// GUIDs appear as hex (0x prefixed) or decimal literals.
fn parse_guid(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        token.parse::<u64>().ok()
    }
}

impl NodeNameMap {
    /// Opens and parses the SM node name map. A missing or unreadable
    /// file is logged and yields an empty map, to be filled by a later
    /// reload.
    pub fn new<P: AsRef<Path>>(path: P) -> NodeNameMap {
        let map = NodeNameMap {
            path: path.as_ref().to_owned(),
            nodes: Arc::new(RwLock::new(HashMap::new())),
        };

        if let Err(e) = map.reload() {
            log::error!("Cannot load node name map {:?}: {}", map.path, e);
        }

        map
    }

    /// Maps `guid` to its configured description, or returns `node_desc`
    /// unmodified when the GUID is not in the map.
    pub fn remap_node_name(&self, guid: u64, node_desc: &str) -> String {
        match self.nodes.read() {
            Ok(nodes) => nodes
                .get(&guid)
                .cloned()
                .unwrap_or_else(|| node_desc.to_owned()),
            Err(e) => {
                log::error!("Node name map lock poisoned: {:?}", e);
                node_desc.to_owned()
            }
        }
    }

    /// Re-parses the backing file and atomically swaps the shared map.
    /// On error the previous map is retained.
    pub fn reload(&self) -> io::Result<()> {
        let mut nodes: HashMap<u64, String> = HashMap::new();

        let file = fs::File::open(&self.path)?;
        let reader = io::BufReader::new(file);

        for line in reader.lines() {
            let line = line?;
            if line.trim_start().starts_with('#') {
                continue;
            }

            let fields = split_fields(&line);
            if fields.len() < 2 || fields[1].starts_with('#') {
                continue;
            }

            let guid = match parse_guid(&fields[0]) {
                Some(g) => g,
                None => continue,
            };

            nodes.insert(guid, fields[1].clone());
        }

        match self.nodes.write() {
            Ok(mut shared) => *shared = nodes,
            Err(e) => return Err(io::Error::new(io::ErrorKind::Other, format!("{:?}", e))),
        }

        Ok(())
    }

    /// Watches the backing file and reloads it on mutation. Permission
    /// only changes are ignored; a removal (editors writing via rename)
    /// re-adds the watch on the original path before reloading.
    pub async fn watch(self) {
        let mut inotify = match Inotify::init() {
            Ok(i) => i,
            Err(e) => {
                log::error!("Cannot create inotify instance: {}", e);
                return;
            }
        };

        if let Err(e) = inotify.watches().add(&self.path, WATCH_EVENTS) {
            log::error!("Cannot add watch for node name map {:?}: {}", self.path, e);
        }

        let async_fd = match AsyncFd::new(inotify.as_raw_fd()) {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("Cannot create async fd for inotify: {}", e);
                return;
            }
        };

        loop {
            let mut guard = match async_fd.readable().await {
                Ok(g) => g,
                Err(e) => {
                    log::error!("Failure checking inotify readiness: {}", e);
                    return;
                }
            };

            let mut buffer = [0u8; 1024];
            let mut need_rewatch = false;
            let mut need_reload = false;

            match inotify.read_events(&mut buffer) {
                Ok(events) => {
                    for event in events {
                        log::info!("Node name map watcher event: {:?}", event.mask);

                        // Ignore chmod, everything else requires a reload
                        if event.mask == EventMask::ATTRIB {
                            continue;
                        }

                        if event
                            .mask
                            .intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF | EventMask::IGNORED)
                        {
                            need_rewatch = true;
                        }

                        need_reload = true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                    continue;
                }
                Err(e) => {
                    log::error!("Error reading inotify events: {}", e);
                }
            }

            guard.clear_ready();

            if need_rewatch {
                if let Err(e) = inotify.watches().add(&self.path, WATCH_EVENTS) {
                    log::error!(
                        "Cannot re-add watch for node name map {:?}: {}",
                        self.path,
                        e
                    );
                }
            }

            if need_reload {
                match self.reload() {
                    Ok(()) => log::info!("Node name map reloaded"),
                    Err(e) => log::error!("Failed to reload node name map: {}", e),
                }
            }
        }
    }
}
