#[cfg(test)]
mod config_tests {
    use std::io::Write;
    use std::time::Duration;

    use fabricmon::config;
    use fabricmon::error::Error;

    fn write_conf(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabricmon.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn defaults_applied() {
        let (_dir, path) = write_conf("counter_reset_threshold: 90\n");

        let conf = config::read_config(&path).unwrap();

        assert_eq!(conf.poll_interval, Duration::from_secs(10));
        assert_eq!(conf.counter_reset_threshold, 90);
        assert_eq!(conf.m_key, 0);
        assert!(conf.influxdb.is_empty());
        assert_eq!(conf.logging.log_level, log::LevelFilter::Info);
        assert!(!conf.topology.enabled);
    }

    #[test]
    fn full_config_parses() {
        let (_dir, path) = write_conf(
            "poll_interval: 30s\n\
             counter_reset_threshold: 75\n\
             m_key: 42\n\
             logging:\n\
             \x20 log_level: debug\n\
             influxdb:\n\
             \x20 - url: http://localhost:8086\n\
             \x20   database: fabricmon\n\
             \x20   username: writer\n\
             \x20   password: secret\n\
             \x20   retention_policy: two_weeks\n\
             \x20   timeout: 5s\n",
        );

        let conf = config::read_config(&path).unwrap();

        assert_eq!(conf.poll_interval, Duration::from_secs(30));
        assert_eq!(conf.m_key, 42);
        assert_eq!(conf.logging.log_level, log::LevelFilter::Debug);
        assert_eq!(conf.influxdb.len(), 1);

        let influx = &conf.influxdb[0];
        assert_eq!(influx.url, "http://localhost:8086");
        assert_eq!(influx.database, "fabricmon");
        assert_eq!(influx.retention_policy.as_deref(), Some("two_weeks"));
        assert_eq!(influx.timeout, Duration::from_secs(5));
    }

    #[test]
    fn influxdb_timeout_defaults_to_ten_seconds() {
        let (_dir, path) = write_conf(
            "counter_reset_threshold: 90\n\
             influxdb:\n\
             \x20 - url: http://localhost:8086\n\
             \x20   database: fabricmon\n",
        );

        let conf = config::read_config(&path).unwrap();
        assert_eq!(conf.influxdb[0].timeout, Duration::from_secs(10));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        for threshold in ["24", "101", "0"] {
            let (_dir, path) =
                write_conf(&format!("counter_reset_threshold: {}\n", threshold));
            match config::read_config(&path) {
                Err(Error::ConfigInvalid(_)) => {}
                other => panic!("expected ConfigInvalid, got {:?}", other.map(|_| ())),
            }
        }

        for threshold in ["25", "100"] {
            let (_dir, path) =
                write_conf(&format!("counter_reset_threshold: {}\n", threshold));
            assert!(config::read_config(&path).is_ok());
        }
    }

    #[test]
    fn missing_threshold_rejected() {
        let (_dir, path) = write_conf("poll_interval: 10s\n");
        assert!(matches!(
            config::read_config(&path),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn unknown_keys_rejected() {
        let (_dir, path) = write_conf(
            "counter_reset_threshold: 90\n\
             no_such_option: true\n",
        );
        assert!(matches!(
            config::read_config(&path),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn topology_requires_writable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (_cdir, path) = write_conf(&format!(
            "counter_reset_threshold: 90\n\
             topology:\n\
             \x20 enabled: true\n\
             \x20 output_dir: {}\n",
            dir.path().display()
        ));
        assert!(config::read_config(&path).is_ok());

        let (_cdir2, path2) = write_conf(
            "counter_reset_threshold: 90\n\
             topology:\n\
             \x20 enabled: true\n\
             \x20 output_dir: /nonexistent/topology\n",
        );
        assert!(matches!(
            config::read_config(&path2),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn missing_config_file() {
        assert!(matches!(
            config::read_config("/nonexistent/fabricmon.yml"),
            Err(Error::ConfigRead(_))
        ));
    }
}
