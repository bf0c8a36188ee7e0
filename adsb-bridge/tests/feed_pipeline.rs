//! End-to-end: a local SBS-1 server feeding the reader, documents collected
//! by a recording publisher.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use adsb_bridge::{FeedReader, Publisher};
use adsb_core::Config;

const POS: &str = "MSG,3,1,1,4840D6,1,2015/05/12,12:34:56.000,2015/05/12,12:34:56.500,,35000,,,52.30786,4.76231,,,0,0,0,0\r\n";
const VEL: &str = "MSG,4,1,1,4840D6,1,2015/05/12,12:34:57.000,2015/05/12,12:34:57.000,,,420,271,,,-640,,,,,0\r\n";
const ID: &str = "MSG,1,1,1,4840D6,1,2015/05/12,12:34:58.000,2015/05/12,12:34:58.000,KLM1023 ,,,,,,,,,,,0\r\n";

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(String, serde_json::Value)>>>);

impl Recorder {
    fn docs(&self) -> Vec<(String, serde_json::Value)> {
        self.0.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<(String, serde_json::Value)> {
        for _ in 0..200 {
            let docs = self.docs();
            if docs.len() >= count {
                return docs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} documents, got {:?}", self.docs());
    }
}

impl Publisher for Recorder {
    fn publish(&self, topic: &str, payload: String) {
        let doc = serde_json::from_str(&payload).unwrap();
        self.0.lock().unwrap().push((topic.to_string(), doc));
    }
}

fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.radar_name = "test".into();
    config.feed.host = "127.0.0.1".into();
    config.feed.port = port;
    config.timing.feed_backoff = 0.05;
    config.timing.sweep_interval = 0.05;
    config.timing.stale_after = 0.3;
    config
}

#[tokio::test]
async fn test_feed_publishes_then_reports_lost() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Split one record across two writes
        socket.write_all(&POS.as_bytes()[..40]).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(&POS.as_bytes()[40..]).await.unwrap();
        socket.write_all(VEL.as_bytes()).await.unwrap();
        socket.write_all(b"garbage\r\n\r\n").await.unwrap();
        socket.write_all(VEL.as_bytes()).await.unwrap();
        socket.write_all(ID.as_bytes()).await.unwrap();
        // Keep the connection open while the aircraft goes stale
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let recorder = Recorder::default();
    let feed = FeedReader::new(&test_config(port), recorder.clone(), None);
    let reader = tokio::spawn(feed.run());

    let docs = recorder.wait_for(3).await;
    // Evicted exactly once
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.docs().len(), 3);
    reader.abort();
    server.abort();

    assert!(docs.iter().all(|(topic, _)| topic == "/adsb/test/json"));

    let first = &docs[0].1;
    assert_eq!(first["icao24"], "4840D6");
    assert_eq!(first["altitude"], 35000);
    assert_eq!(first["groundSpeed"], 420.0);
    assert_eq!(first["track"], 271.0);
    assert_eq!(first["lat"], 52.30786);
    assert_eq!(first["lon"], 4.76231);
    assert_eq!(first["verticalRate"], -640);
    assert_eq!(first["loggedDate"], "2015-05-12T12:34:57");
    assert!(first["callsign"].is_null());
    assert_eq!(first["lost"], false);

    // Repeated velocity record changed nothing; the callsign did
    let second = &docs[1].1;
    assert_eq!(second["callsign"], "KLM1023");
    assert_eq!(second["lost"], false);

    let last = &docs[2].1;
    assert_eq!(last["icao24"], "4840D6");
    assert_eq!(last["callsign"], "KLM1023");
    assert_eq!(last["lost"], true);
}

#[tokio::test]
async fn test_feed_reconnects_after_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(Mutex::new(0u32));

    let counter = Arc::clone(&connections);
    let server = tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            *counter.lock().unwrap() += 1;
            socket.write_all(POS.as_bytes()).await.unwrap();
            socket.write_all(VEL.as_bytes()).await.unwrap();
            drop(socket);
        }
    });

    let recorder = Recorder::default();
    let feed = FeedReader::new(&test_config(port), recorder.clone(), None);
    let reader = tokio::spawn(feed.run());

    for _ in 0..200 {
        if *connections.lock().unwrap() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    reader.abort();
    server.abort();

    assert!(*connections.lock().unwrap() >= 2);
    // Table survives the reconnect: the replayed records changed nothing
    let docs = recorder.docs();
    assert!(!docs.is_empty());
    assert!(docs.iter().all(|(_, doc)| doc["lost"] == false));
}
