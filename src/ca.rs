// Channel adapter enumeration from sysfs, the functional equivalent of
// umad_get_cas_names() / umad_get_ca().

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const SYS_INFINIBAND: &str = "/sys/class/infiniband";

const SYS_CA_FW_VERS: &str = "fw_ver";
const SYS_CA_HW_VERS: &str = "hw_rev";
const SYS_CA_TYPE: &str = "hca_type";
const SYS_CA_NODE_GUID: &str = "node_guid";
const SYS_CA_SYS_GUID: &str = "sys_image_guid";

const SYS_PORT_LINK_LAYER: &str = "link_layer";

const SYS_CA_UMAD_PATH: &str = "device/infiniband_mad";
const DEV_CA_UMAD_PATH: &str = "/dev/infiniband";

/// One local port of a channel adapter. Port numbers may be
/// non-contiguous.
#[derive(Debug, Clone)]
pub struct HcaPort {
    pub number: u32,
    pub link_layer: String,
}

/// A local channel adapter. Plain owned data; dropping the value
/// releases the handle.
#[derive(Debug, Clone)]
pub struct Hca {
    pub name: String,
    pub hca_type: Option<String>,
    pub fw_ver: Option<String>,
    pub hw_rev: Option<String>,
    pub node_guid: u64,
    pub system_guid: u64,
    pub ports: Vec<HcaPort>,
    pub umad_dev_path: Option<PathBuf>,
}

fn read_sys_string(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_owned())
}

// sysfs renders GUIDs as colon-separated hex quads, e.g.
// "0011:2233:4455:6677".
fn read_sys_guid(dir: &Path, name: &str) -> u64 {
    read_sys_string(dir, name)
        .and_then(|s| u64::from_str_radix(&s.replace(':', ""), 16).ok())
        .unwrap_or(0)
}

fn get_ports(hca_path: &Path) -> Result<Vec<HcaPort>, io::Error> {
    let mut ports: Vec<HcaPort> = Vec::new();

    let ports_path = hca_path.join("ports");
    if !ports_path.exists() {
        log::debug!("get_ports - no ports directory under {:?}", hca_path);
        return Ok(ports);
    }

    for entry in fs::read_dir(&ports_path)? {
        let entry = entry?;
        let file_name = entry.file_name();

        let number = match file_name.to_string_lossy().parse::<u32>() {
            Ok(n) => n,
            Err(e) => {
                log::trace!("get_ports - skipping entry {:?}: {:?}", file_name, e);
                continue;
            }
        };

        let link_layer =
            read_sys_string(&entry.path(), SYS_PORT_LINK_LAYER).unwrap_or_default();

        log::trace!(
            "get_ports - found port {} ({}) under {:?}",
            number,
            link_layer,
            hca_path
        );
        ports.push(HcaPort { number, link_layer });
    }

    ports.sort_by_key(|p| p.number);
    Ok(ports)
}

fn get_umad_dev_path(hca_path: &Path) -> Option<PathBuf> {
    let sys_path = hca_path.join(SYS_CA_UMAD_PATH);

    if !sys_path.exists() {
        log::debug!("get_umad_dev_path - sys path {:?} does not exist", sys_path);
        return None;
    }

    for entry in fs::read_dir(sys_path).ok()? {
        let entry = entry.ok()?;
        if let Some(file_name) = entry.file_name().to_str() {
            if file_name.starts_with("umad") {
                let dev_path = PathBuf::from(DEV_CA_UMAD_PATH).join(file_name);
                if dev_path.exists() {
                    log::debug!("get_umad_dev_path - found device path {:?}", dev_path);
                    return Some(dev_path);
                }
            }
        }
    }

    None
}

pub fn get_ca_names() -> Result<Vec<String>, io::Error> {
    let mut names: Vec<String> = Vec::new();

    for entry in fs::read_dir(SYS_INFINIBAND)? {
        let entry = entry?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }

    names.sort();
    Ok(names)
}

pub fn get_ca(name: &str) -> Result<Hca, io::Error> {
    let hca_path = PathBuf::from(SYS_INFINIBAND).join(name);

    if !hca_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such adapter: {}", name),
        ));
    }

    Ok(Hca {
        name: name.to_owned(),
        hca_type: read_sys_string(&hca_path, SYS_CA_TYPE),
        fw_ver: read_sys_string(&hca_path, SYS_CA_FW_VERS),
        hw_rev: read_sys_string(&hca_path, SYS_CA_HW_VERS),
        node_guid: read_sys_guid(&hca_path, SYS_CA_NODE_GUID),
        system_guid: read_sys_guid(&hca_path, SYS_CA_SYS_GUID),
        ports: get_ports(&hca_path)?,
        umad_dev_path: get_umad_dev_path(&hca_path),
    })
}

pub fn get_cas() -> Result<Vec<Hca>, io::Error> {
    let mut hcas: Vec<Hca> = Vec::new();

    for name in get_ca_names()? {
        let hca = get_ca(&name)?;

        log::info!(
            "Found HCA {} ({}) with {} ports, firmware {}, hardware {}, node GUID {:#018x}, system GUID {:#018x}",
            hca.name,
            hca.hca_type.as_deref().unwrap_or("unknown"),
            hca.ports.len(),
            hca.fw_ver.as_deref().unwrap_or("unknown"),
            hca.hw_rev.as_deref().unwrap_or("unknown"),
            hca.node_guid,
            hca.system_guid,
        );

        hcas.push(hca);
    }

    Ok(hcas)
}
