//! Integration tests for imagestash
//!
//! Every scenario runs against both storage drivers unless it depends on
//! reliable access-time metadata, which the xattr driver can only provide
//! on filesystems with user xattr support.

mod scenarios {
    use imagestash::{BoxError, CacheConfig, CacheError, DriverKind, ImageCache};
    use std::fs;
    use std::io::Read;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn open_cache(dir: &Path, driver: DriverKind, max_size: u64) -> ImageCache {
        let mut config = CacheConfig::new(dir);
        config.driver = driver;
        config.max_size = max_size;
        ImageCache::new(config).unwrap()
    }

    fn for_each_driver(test: impl Fn(ImageCache)) {
        for driver in [DriverKind::Xattr, DriverKind::Sqlite] {
            let dir = TempDir::new().unwrap();
            test(open_cache(dir.path(), driver, u64::MAX));
        }
    }

    fn chunk_stream(parts: Vec<Vec<u8>>) -> impl Iterator<Item = Result<Vec<u8>, BoxError>> {
        parts.into_iter().map(Ok)
    }

    fn sha256_hex(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(data))
    }

    fn drain(cache: &ImageCache, id: &str, checksum: Option<&str>, parts: Vec<Vec<u8>>) -> Vec<u8> {
        let mut delivered = Vec::new();
        for item in cache.get_caching_iter(id, checksum, chunk_stream(parts)) {
            delivered.extend(item.unwrap());
        }
        delivered
    }

    fn read_back(cache: &ImageCache, id: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        cache.open_for_read(id).unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn visibility_lifecycle() {
        for_each_driver(|cache| {
            // Identifiers are opaque; image UUIDs are the typical shape.
            let id = uuid::Uuid::new_v4().to_string();
            assert!(!cache.is_cached(&id));

            drain(&cache, &id, None, vec![b"payload".to_vec()]);
            assert!(cache.is_cached(&id));

            cache.delete_cached_image(&id).unwrap();
            assert!(!cache.is_cached(&id));
        });
    }

    #[test]
    fn round_trip_is_byte_exact_for_any_chunking() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let chunkings: Vec<Vec<Vec<u8>>> = vec![
            vec![data.clone()],
            data.chunks(1).map(|c| c.to_vec()).collect(),
            data.chunks(7).map(|c| c.to_vec()).collect(),
            data.chunks(4096).map(|c| c.to_vec()).collect(),
        ];

        for_each_driver(|cache| {
            for (i, parts) in chunkings.clone().into_iter().enumerate() {
                let id = format!("img-{}", i);
                let delivered = drain(&cache, &id, None, parts);

                assert_eq!(delivered, data);
                assert_eq!(read_back(&cache, &id), data);
            }
        });
    }

    #[test]
    fn queue_idempotence() {
        for_each_driver(|cache| {
            assert!(cache.queue_image("img").unwrap());
            assert!(!cache.queue_image("img").unwrap());

            drain(&cache, "done", None, vec![b"x".to_vec()]);
            assert!(!cache.queue_image("done").unwrap());
        });
    }

    #[test]
    fn queued_images_are_oldest_first() {
        for_each_driver(|cache| {
            for id in ["first", "second", "third"] {
                cache.queue_image(id).unwrap();
            }
            // Force distinct, known request times.
            for (i, id) in ["first", "second", "third"].iter().enumerate() {
                let marker = cache.config().cache_dir.join("queue").join(id);
                let mtime = SystemTime::now() - Duration::from_secs(300 - i as u64 * 60);
                filetime::set_file_mtime(marker, filetime::FileTime::from_system_time(mtime))
                    .unwrap();
            }

            assert_eq!(cache.get_queued_images().unwrap(), ["first", "second", "third"]);
        });
    }

    // Scenario: backend raises mid-stream; everything produced before the
    // failure is still delivered, nothing is promoted, and the caller sees
    // the backend's own error.
    #[test]
    fn backend_failure_never_promotes() {
        for_each_driver(|cache| {
            let backend: Vec<Result<Vec<u8>, BoxError>> = vec![
                Ok(b"a".to_vec()),
                Ok(b"b".to_vec()),
                Ok(b"c".to_vec()),
                Err("upstream exploded".into()),
                Ok(b"d".to_vec()),
                Ok(b"e".to_vec()),
                Ok(b"f".to_vec()),
            ];

            let mut delivered = Vec::new();
            let mut errors = Vec::new();
            for item in cache.get_caching_iter("img", None, backend.into_iter()) {
                match item {
                    Ok(chunk) => delivered.extend(chunk),
                    Err(e) => errors.push(e),
                }
            }

            assert_eq!(delivered, b"abc");
            assert_eq!(errors.len(), 1);
            assert!(matches!(errors[0], CacheError::Backend { .. }));
            assert!(!cache.is_cached("img"));
        });
    }

    // Scenario: a correct digest promotes, a wrong digest surfaces a domain
    // error on drain and never promotes.
    #[test]
    fn checksum_validation_gates_promotion() {
        let data = b"12345678990abcdefghijklmnop".to_vec();
        let digest = sha256_hex(&data);

        for_each_driver(|cache| {
            let delivered = drain(&cache, "good", Some(&digest), vec![data.clone()]);
            assert_eq!(delivered, data);
            assert!(cache.is_cached("good"));

            let mut saw_mismatch = false;
            for item in cache.get_caching_iter("bad", Some("foobar"), chunk_stream(vec![data.clone()])) {
                if let Err(e) = item {
                    assert!(matches!(e, CacheError::ChecksumMismatch { .. }));
                    saw_mismatch = true;
                }
            }
            assert!(saw_mismatch);
            assert!(!cache.is_cached("bad"));
        });
    }

    // Scenario: ten 1 KiB artifacts, a 5 KiB budget, each accessed once in
    // ascending order; pruning keeps exactly the five most recently
    // accessed.
    #[test]
    fn prune_keeps_five_most_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(dir.path(), DriverKind::Sqlite, 5 * 1024);

        for i in 0..10 {
            drain(&cache, &format!("img-{:02}", i), None, vec![vec![0u8; 1024]]);
        }
        for i in 0..10 {
            cache.open_for_read(&format!("img-{:02}", i)).unwrap();
        }

        cache.prune().unwrap();

        assert_eq!(cache.get_cache_size().unwrap(), 5 * 1024);
        let remaining: Vec<String> = cache
            .get_cached_images()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        let expected: Vec<String> = (5..10).map(|i| format!("img-{:02}", i)).collect();
        assert_eq!(remaining, expected);
    }

    // Scenario: a zero maximum is the evict-everything policy, not an error.
    #[test]
    fn prune_with_zero_budget_empties_cache() {
        for driver in [DriverKind::Xattr, DriverKind::Sqlite] {
            let dir = TempDir::new().unwrap();
            let cache = open_cache(dir.path(), driver, 0);

            drain(&cache, "img", None, vec![vec![0u8; 1024]]);
            cache.prune().unwrap();

            assert_eq!(cache.get_cache_size().unwrap(), 0);
            assert!(!cache.is_cached("img"));
        }
    }

    #[test]
    fn clean_reaps_only_stalled_files() {
        for_each_driver(|cache| {
            let incomplete = cache.config().cache_dir.join("incomplete");
            fs::write(incomplete.join("stalled"), b"partial").unwrap();
            fs::write(incomplete.join("active"), b"partial").unwrap();

            let past = SystemTime::now() - Duration::from_secs(3600);
            filetime::set_file_mtime(
                incomplete.join("stalled"),
                filetime::FileTime::from_system_time(past),
            )
            .unwrap();

            let reaped = cache.clean(Some(Duration::from_secs(300))).unwrap();

            assert_eq!(reaped, 1);
            assert!(!incomplete.join("stalled").exists());
            assert!(incomplete.join("active").exists());
        });
    }

    #[test]
    fn abandoned_stream_lands_in_invalid_area() {
        for_each_driver(|cache| {
            {
                let mut iter = cache.get_caching_iter(
                    "img",
                    None,
                    chunk_stream(vec![b"one".to_vec(), b"two".to_vec()]),
                );
                let _ = iter.next().unwrap().unwrap();
            }

            assert!(!cache.is_cached("img"));
            assert!(cache.config().cache_dir.join("invalid").join("img").exists());
            assert!(!cache.config().cache_dir.join("incomplete").join("img").exists());
        });
    }

    #[test]
    fn delete_all_cached_images_resets_size() {
        for_each_driver(|cache| {
            for i in 0..3 {
                drain(&cache, &format!("img-{}", i), None, vec![vec![1u8; 512]]);
            }

            assert_eq!(cache.delete_all_cached_images().unwrap(), 3);
            assert_eq!(cache.get_cache_size().unwrap(), 0);
        });
    }

    #[test]
    fn audit_log_records_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.driver = DriverKind::Sqlite;
        config.max_size = 0;
        config.audit_log = true;
        let cache = ImageCache::new(config).unwrap();

        drain(&cache, "img", None, vec![b"bytes".to_vec()]);
        cache.prune().unwrap();

        let log = fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert!(log.lines().any(|l| l.contains("\"promoted\"")));
        assert!(log.lines().any(|l| l.contains("\"evicted\"")));
    }

    #[test]
    fn config_file_drives_cache_construction() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("store");
        let config_path = dir.path().join("config.toml");
        fs::write(
            &config_path,
            format!(
                "cache_dir = {:?}\ndriver = \"sqlite\"\nmax_size = 2048\n",
                cache_dir
            ),
        )
        .unwrap();

        let config = CacheConfig::load(&config_path).unwrap();
        assert_eq!(config.max_size, 2048);

        let cache = ImageCache::new(config).unwrap();
        drain(&cache, "img", None, vec![b"configured".to_vec()]);
        assert!(cache_dir.join("cached").join("img").exists());
    }
}
