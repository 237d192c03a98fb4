#[cfg(test)]
mod nodenamemap_tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use fabricmon::nodenamemap::NodeNameMap;

    fn write_map(path: &std::path::Path, content: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn parse_fidelity() {
        let _ = env_logger::try_init();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ib-node-name-map");

        write_map(
            &path,
            "0xb7c31c3b29d0c791 ibsw1(root-sw)\n\
             0xa31de6b2f83b0a91 ibsw2\n\
             0x4878ef07ca6bf2a0 \"sw1 - root\"\n\
             0x9cf5e55c63d7a4a3 \"sw1 #root#\"\n",
        );

        let map = NodeNameMap::new(&path);

        assert_eq!(
            map.remap_node_name(0xb7c31c3b29d0c791, "fallback"),
            "ibsw1(root-sw)"
        );
        assert_eq!(map.remap_node_name(0xa31de6b2f83b0a91, "fallback"), "ibsw2");
        // Quotes are preserved verbatim
        assert_eq!(
            map.remap_node_name(0x4878ef07ca6bf2a0, "fallback"),
            "\"sw1 - root\""
        );
        assert_eq!(
            map.remap_node_name(0x9cf5e55c63d7a4a3, "fallback"),
            "\"sw1 #root#\""
        );
    }

    #[test]
    fn comments_and_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ib-node-name-map");

        write_map(
            &path,
            "# full line comment\n\
             \n\
             0x1 # commented-out description\n\
             not-a-guid some-name\n\
             0x2 kept\n\
             12345 decimal-guid\n",
        );

        let map = NodeNameMap::new(&path);

        assert_eq!(map.remap_node_name(0x1, "fb"), "fb");
        assert_eq!(map.remap_node_name(0x2, "fb"), "kept");
        assert_eq!(map.remap_node_name(12345, "fb"), "decimal-guid");
    }

    #[test]
    fn lookup_fallback_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ib-node-name-map");
        write_map(&path, "0x10 mapped\n");

        let map = NodeNameMap::new(&path);

        assert_eq!(map.remap_node_name(0x10, "other"), "mapped");
        assert_eq!(map.remap_node_name(0x11, "other"), "other");
        assert_eq!(map.remap_node_name(0, ""), "");
    }

    #[test]
    fn missing_file_yields_empty_map() {
        let map = NodeNameMap::new("/nonexistent/ib-node-name-map");
        assert_eq!(map.remap_node_name(0x1, "fb"), "fb");
    }

    // Concurrent lookups must observe either the old or the new map,
    // never a half-parsed one.
    #[test]
    fn reload_is_atomic_under_concurrent_lookups() {
        let _ = env_logger::try_init();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ib-node-name-map");

        write_map(&path, "0xb7c31c3b29d0c791 alpha\n");
        let map = NodeNameMap::new(&path);

        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();

        for _ in 0..4 {
            let map = map.clone();
            let stop = stop.clone();
            readers.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let desc = map.remap_node_name(0xb7c31c3b29d0c791, "fallback");
                    assert!(
                        desc == "alpha" || desc == "beta",
                        "observed partial map: {:?}",
                        desc
                    );
                }
            }));
        }

        for i in 0..200 {
            let name = if i % 2 == 0 { "beta" } else { "alpha" };
            write_map(&path, &format!("0xb7c31c3b29d0c791 {}\n", name));
            map.reload().unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
    }
}
