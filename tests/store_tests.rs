use lan_sentinel::error::StoreError;
use lan_sentinel::store::{Encoding, Precision, RecordStore};
use lan_sentinel::types::{parse_timestamp, HostResult, PortResult, Protocol, ScanResult};

fn result_at(ts: &str, hosts: Vec<HostResult>, screenshot: Option<Vec<u8>>) -> ScanResult {
    ScanResult::new("10.0.0.0/30", parse_timestamp(ts).unwrap(), hosts, screenshot).unwrap()
}

fn sample(ts: &str) -> ScanResult {
    result_at(
        ts,
        vec![
            HostResult {
                ip: "10.0.0.1".into(),
                hostname: "gw.lan".into(),
                ports: vec![
                    PortResult {
                        port: 22,
                        service: "ssh".into(),
                        version: "9.6p1".into(),
                        protocol: Protocol::Tcp,
                    },
                    PortResult {
                        port: 80,
                        service: "http".into(),
                        version: String::new(),
                        protocol: Protocol::Tcp,
                    },
                ],
            },
            HostResult {
                ip: "10.0.0.2".into(),
                hostname: "unknown".into(),
                ports: vec![],
            },
        ],
        Some(b"\x89PNG\r\n\x1a\n".to_vec()),
    )
}

async fn store(dir: &tempfile::TempDir, encoding: Encoding, precision: Precision) -> RecordStore {
    RecordStore::open(dir.path(), encoding, precision).await.unwrap()
}

#[tokio::test]
async fn open_creates_missing_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let nested = tmp.path().join("a").join("scan_results");
    RecordStore::open(&nested, Encoding::Json, Precision::Seconds)
        .await
        .unwrap();
    assert!(nested.is_dir());
}

#[tokio::test]
async fn both_encodings_round_trip() {
    for encoding in [Encoding::Json, Encoding::Xml] {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, encoding, Precision::Seconds).await;
        let original = sample("2024-05-01 10:00:00");

        let stored = s.persist(original.clone()).await.unwrap();
        let expected_name = format!("scan_20240501_100000.{}", encoding.extension());
        assert_eq!(stored.filename(), Some(expected_name.as_str()));

        let loaded = s.load(&expected_name).await.unwrap();
        assert_eq!(loaded, stored, "{encoding} round trip");
        assert_eq!(loaded.hosts(), original.hosts());
        assert_eq!(loaded.hosts()[0].ports[1].version, "");
        assert!(loaded.hosts()[1].ports.is_empty());
        assert_eq!(loaded.screenshot(), original.screenshot());
    }
}

#[tokio::test]
async fn no_temporary_files_are_left_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let s = store(&tmp, Encoding::Json, Precision::Seconds).await;
    s.persist(sample("2024-05-01 10:00:00")).await.unwrap();
    let names: Vec<String> = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec!["scan_20240501_100000.json".to_string()]);
}

#[tokio::test]
async fn document_record_is_pretty_and_uses_wire_names() {
    let tmp = tempfile::tempdir().unwrap();
    let s = store(&tmp, Encoding::Json, Precision::Seconds).await;
    let stored = s.persist(sample("2024-05-01 10:00:00")).await.unwrap();
    let text = std::fs::read_to_string(s.path_of(stored.filename().unwrap())).unwrap();
    assert!(text.contains("\n  \"network\": \"10.0.0.0/30\""));
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["filename"], "scan_20240501_100000.json");
    assert_eq!(v["timestamp"], "2024-05-01 10:00:00");
    assert!(v["screenshot"].is_string());
    assert_eq!(v["hosts"][0]["ports"][0]["service"], "ssh");
}

#[tokio::test]
async fn day_precision_overwrites_same_day() {
    let tmp = tempfile::tempdir().unwrap();
    let s = store(&tmp, Encoding::Json, Precision::Day).await;

    let first = s.persist(sample("2024-05-01 08:00:00")).await.unwrap();
    let second = s
        .persist(result_at("2024-05-01 20:30:00", vec![], None))
        .await
        .unwrap();
    assert_eq!(first.filename(), second.filename());
    assert_eq!(second.filename(), Some("scan_20240501.json"));

    let listed = s.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    let loaded = s.load("scan_20240501.json").await.unwrap();
    assert_eq!(loaded, second);
    assert!(loaded.hosts().is_empty());
}

#[tokio::test]
async fn listing_reads_both_encodings() {
    let tmp = tempfile::tempdir().unwrap();
    let json = store(&tmp, Encoding::Json, Precision::Seconds).await;
    let xml = store(&tmp, Encoding::Xml, Precision::Seconds).await;
    json.persist(sample("2024-05-01 10:00:00")).await.unwrap();
    xml.persist(result_at("2024-05-02 11:00:00", vec![], None))
        .await
        .unwrap();
    std::fs::write(tmp.path().join("notes.txt"), "not a record").unwrap();
    std::fs::write(tmp.path().join("scan_broken.json"), "{ truncated").unwrap();

    let listed = json.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].filename, "scan_20240501_100000.json");
    assert_eq!(listed[0].timestamp, "2024-05-01 10:00:00");
    assert_eq!(listed[0].host_count, 2);
    assert!(listed[0].has_screenshot);
    assert_eq!(listed[1].filename, "scan_20240502_110000.xml");
    assert_eq!(listed[1].host_count, 0);
    assert!(!listed[1].has_screenshot);

    // either store instance reads either encoding
    assert_eq!(xml.load("scan_20240501_100000.json").await.unwrap().hosts().len(), 2);
}

#[tokio::test]
async fn latest_with_no_records_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let s = store(&tmp, Encoding::Json, Precision::Seconds).await;
    let err = s.latest_raw().await.unwrap_err();
    assert!(matches!(err, StoreError::NoRecords));
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "no scans available");
}

#[tokio::test]
async fn latest_is_the_newest_record() {
    let tmp = tempfile::tempdir().unwrap();
    let json = store(&tmp, Encoding::Json, Precision::Seconds).await;
    let xml = store(&tmp, Encoding::Xml, Precision::Seconds).await;
    json.persist(sample("2024-05-01 10:00:00")).await.unwrap();
    let newest = xml
        .persist(result_at("2024-05-02 11:00:00", vec![], None))
        .await
        .unwrap();

    let raw = json.latest_raw().await.unwrap();
    assert_eq!(raw.filename, "scan_20240502_110000.xml");
    assert_eq!(raw.content_type, "application/xml");
    assert_eq!(json.latest().await.unwrap(), newest);
}

#[tokio::test]
async fn raw_fetch_reports_content_type_and_missing_names() {
    let tmp = tempfile::tempdir().unwrap();
    let s = store(&tmp, Encoding::Json, Precision::Seconds).await;
    s.persist(sample("2024-05-01 10:00:00")).await.unwrap();

    let raw = s.read_raw("scan_20240501_100000.json").await.unwrap();
    assert_eq!(raw.content_type, "application/json");
    assert!(!raw.bytes.is_empty());

    for bad in ["scan_19990101_000000.json", "../scan_20240501_100000.json", "scan.txt"] {
        let err = s.read_raw(bad).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)), "{bad}: {err}");
    }
}

#[tokio::test]
async fn malformed_record_is_reported_not_panicked() {
    let tmp = tempfile::tempdir().unwrap();
    let s = store(&tmp, Encoding::Xml, Precision::Seconds).await;
    std::fs::write(tmp.path().join("scan_bad.xml"), "<scan><metadata>").unwrap();
    let err = s.load("scan_bad.xml").await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRecord { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_of_one_name_never_corrupt_the_record() {
    let tmp = tempfile::tempdir().unwrap();
    let s = std::sync::Arc::new(store(&tmp, Encoding::Json, Precision::Seconds).await);

    for _ in 0..25 {
        let mut writers = tokio::task::JoinSet::new();
        for i in 0..6 {
            let s = s.clone();
            writers.spawn(async move {
                let result = if i % 2 == 0 {
                    sample("2024-05-01 10:00:00")
                } else {
                    result_at("2024-05-01 10:00:00", vec![], None)
                };
                s.persist(result).await
            });
        }
        while let Some(done) = writers.join_next().await {
            done.unwrap().unwrap();
        }

        let loaded = s.load("scan_20240501_100000.json").await.unwrap();
        assert!(loaded.hosts().len() == 2 || loaded.hosts().is_empty());
    }

    let names: Vec<String> = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec!["scan_20240501_100000.json".to_string()]);
}

#[tokio::test]
async fn persist_new_refuses_to_replace_a_record() {
    let tmp = tempfile::tempdir().unwrap();
    let s = store(&tmp, Encoding::Json, Precision::Seconds).await;
    let first = s.persist_new(sample("2024-05-01 10:00:00")).await.unwrap();

    let err = s
        .persist_new(result_at("2024-05-01 10:00:00", vec![], None))
        .await
        .unwrap_err();
    assert!(matches!(&err, StoreError::AlreadyExists(name) if name == "scan_20240501_100000.json"));

    assert_eq!(s.load("scan_20240501_100000.json").await.unwrap(), first);
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
}
