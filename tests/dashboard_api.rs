use std::io::{Read, Write};
use std::net::TcpStream;

use tempfile::TempDir;

use ppe_monitor::api::{ApiConfig, ApiServer};
use ppe_monitor::store::parse_timestamp;
use ppe_monitor::{EquipmentCatalog, EvidenceStore, SqliteStore};

fn get(addr: std::net::SocketAddr, path: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("connect api");
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
    stream.write_all(request.as_bytes()).expect("send request");
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    (head, raw[split + 4..].to_vec())
}

#[test]
fn dashboard_serves_listings_images_and_summary() {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("ppe.db");
    let db_path = db_path.to_str().expect("utf8 path").to_string();

    let mut store = SqliteStore::open(&db_path, &EquipmentCatalog::default()).expect("open store");
    let gloves = store
        .lookup_or_create_equipment("No Gloves")
        .expect("equipment");
    let ts = parse_timestamp("2024-06-03 09:00:00").expect("timestamp");
    let frame = vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
    let id = store
        .insert_detection(&ts, &frame, Some(gloves))
        .expect("insert");

    let handle = ApiServer::new(ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        db_path: db_path.clone(),
    })
    .spawn()
    .expect("spawn api");

    let (head, body) = get(handle.addr, "/health");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, br#"{"status":"ok"}"#.to_vec());

    let (head, body) = get(handle.addr, "/detections?page=1");
    assert!(head.starts_with("HTTP/1.1 200"));
    let page: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(page["total"], 1);
    assert_eq!(page["total_pages"], 1);
    assert_eq!(page["detections"][0]["equipment"], "No Gloves");

    let (head, body) = get(handle.addr, &format!("/image/{}", id));
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(body, frame);

    let (head, _) = get(handle.addr, "/image/4242");
    assert!(head.starts_with("HTTP/1.1 404"));

    let (head, body) = get(
        handle.addr,
        "/summary?start=2024-06-01T00%3A00&end=2024-06-30",
    );
    assert!(head.starts_with("HTTP/1.1 200"));
    let summary: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(summary["total_detections"], 1);
    assert_eq!(summary["compliance_rate"], 0.0);
    assert_eq!(summary["most_common_missing"], "No Gloves");
    assert_eq!(summary["daily"][0]["label"], "03-06-2024");
    assert_eq!(summary["monthly"][0]["label"], "JUN/24");

    handle.stop().expect("stop api");
}

#[test]
fn non_loopback_bind_is_refused() {
    let result = ApiServer::new(ApiConfig {
        addr: "0.0.0.0:0".to_string(),
        db_path: "file:unused?mode=memory".to_string(),
    })
    .spawn();
    assert!(result.is_err());
}
