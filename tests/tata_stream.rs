//! End-to-end TataLike media stream tests: μ-law decode on the way in,
//! strict 160-byte framing on the way out.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telephony_core::{
    codec, AudioEncoding, MediaServer, TataAdapter, TelephonyAdapter, TelephonyConfig,
    TelephonyEvent,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_server() -> (Arc<TataAdapter>, mpsc::Receiver<TelephonyEvent>, String) {
    let config: TelephonyConfig = serde_json::from_str(
        r#"{"provider": "tataLike", "webhookBaseUrl": "https://voice.example.com"}"#,
    )
    .unwrap();
    let (events_tx, events_rx) = mpsc::channel(256);
    let adapter = Arc::new(TataAdapter::new(&config, events_tx).unwrap());

    let adapters = Arc::new(HashMap::from([(
        adapter.provider(),
        adapter.clone() as Arc<dyn TelephonyAdapter>,
    )]));
    let server = MediaServer::bind("127.0.0.1:0", adapters).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let url = format!("ws://{addr}/telephony/tata/stream");
    (adapter, events_rx, url)
}

async fn connect(url: &str) -> WsClient {
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn send_json(client: &mut WsClient, value: serde_json::Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_event(events: &mut mpsc::Receiver<TelephonyEvent>) -> TelephonyEvent {
    timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_wire_json(client: &mut WsClient) -> serde_json::Value {
    loop {
        let message = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for wire message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn start_envelope() -> serde_json::Value {
    serde_json::json!({
        "event": "start",
        "sequenceNumber": 1,
        "streamSid": "MZ1",
        "start": {
            "streamSid": "MZ1",
            "accountSid": "AC1",
            "callSid": "CA1",
            "from": "+15550001",
            "to": "+15550002",
            "direction": "inbound",
            "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "bitRate": 64, "bitDepth": 8}
        }
    })
}

async fn establish(client: &mut WsClient, events: &mut mpsc::Receiver<TelephonyEvent>) {
    send_json(client, serde_json::json!({"event": "connected"})).await;
    send_json(client, start_envelope()).await;
    match next_event(events).await {
        TelephonyEvent::CallStarted(record) => assert_eq!(record.call_id, "tata_CA1"),
        other => panic!("expected callStarted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_inbound_mulaw_is_expanded() {
    let (_adapter, mut events, url) = start_server().await;
    let mut client = connect(&url).await;
    establish(&mut client, &mut events).await;

    // 160 bytes of μ-law silence arrive as 320 bytes of linear16.
    let payload = BASE64.encode(vec![codec::MULAW_SILENCE; 160]);
    send_json(
        &mut client,
        serde_json::json!({
            "event": "media",
            "sequenceNumber": 2,
            "streamSid": "MZ1",
            "media": {"chunk": 1, "timestamp": 20, "payload": payload}
        }),
    )
    .await;

    match next_event(&mut events).await {
        TelephonyEvent::AudioReceived(packet) => {
            assert_eq!(packet.encoding, AudioEncoding::Linear16);
            assert_eq!(packet.sample_rate, 8_000);
            assert_eq!(packet.payload.len(), 320);
            assert!(packet.payload.iter().all(|&b| b == 0));
        }
        other => panic!("expected audioReceived, got {other:?}"),
    }
}

#[tokio::test]
async fn test_outbound_frames_are_exactly_160_bytes() {
    let (adapter, mut events, url) = start_server().await;
    let mut client = connect(&url).await;
    establish(&mut client, &mut events).await;

    // 400 samples @ 16 kHz -> 200 μ-law bytes: one full frame now, 40
    // bytes left in the residual buffer.
    let pcm = codec::samples_to_bytes(&vec![0i16; 400]);
    adapter.send_audio("tata_CA1", &pcm, 16_000);

    let frame = next_wire_json(&mut client).await;
    assert_eq!(frame["event"], "media");
    assert_eq!(frame["streamSid"], "MZ1");
    assert_eq!(frame["media"]["chunk"], 1);
    let payload = BASE64
        .decode(frame["media"]["payload"].as_str().unwrap())
        .unwrap();
    assert_eq!(payload.len(), 160);

    // Flush pads the 40-byte tail with μ-law silence and marks the end.
    adapter.flush_audio("tata_CA1");

    let padded = next_wire_json(&mut client).await;
    assert_eq!(padded["event"], "media");
    assert_eq!(padded["media"]["chunk"], 2);
    let payload = BASE64
        .decode(padded["media"]["payload"].as_str().unwrap())
        .unwrap();
    assert_eq!(payload.len(), 160);
    assert!(payload[40..].iter().all(|&b| b == codec::MULAW_SILENCE));

    let mark = next_wire_json(&mut client).await;
    assert_eq!(mark["event"], "mark");
    assert_eq!(mark["streamSid"], "MZ1");
    let name = mark["mark"]["name"].as_str().unwrap();
    let suffix = name.strip_prefix("complete_").unwrap();
    assert!(suffix.parse::<u64>().is_ok(), "mark name {name}");

    assert_eq!(adapter.session("tata_CA1").unwrap().pending_marks, 1);

    // A mark acknowledgment clears the pending entry.
    send_json(
        &mut client,
        serde_json::json!({
            "event": "mark",
            "sequenceNumber": 5,
            "streamSid": "MZ1",
            "mark": {"name": name}
        }),
    )
    .await;
    timeout(RECV_TIMEOUT, async {
        loop {
            if adapter.session("tata_CA1").unwrap().pending_marks == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("mark was never acknowledged");
}

#[tokio::test]
async fn test_short_send_stays_in_residual_until_flush() {
    let (adapter, mut events, url) = start_server().await;
    let mut client = connect(&url).await;
    establish(&mut client, &mut events).await;

    // 400 bytes of linear16 @ 16 kHz are 200 samples, which transcode to
    // 100 μ-law bytes: short of a full frame, so nothing hits the wire.
    let pcm = codec::samples_to_bytes(&vec![1000i16; 200]);
    assert_eq!(pcm.len(), 400);
    adapter.send_audio("tata_CA1", &pcm, 16_000);
    assert_eq!(adapter.session("tata_CA1").unwrap().chunks_sent, 0);

    // Flush pads the 100-byte residual out to one full frame and marks it.
    adapter.flush_audio("tata_CA1");

    let frame = next_wire_json(&mut client).await;
    assert_eq!(frame["event"], "media");
    assert_eq!(frame["media"]["chunk"], 1);
    let payload = BASE64
        .decode(frame["media"]["payload"].as_str().unwrap())
        .unwrap();
    assert_eq!(payload.len(), 160);
    assert!(payload[..100].iter().all(|&b| b != codec::MULAW_SILENCE));
    assert!(payload[100..].iter().all(|&b| b == codec::MULAW_SILENCE));

    let mark = next_wire_json(&mut client).await;
    assert_eq!(mark["event"], "mark");
    assert_eq!(adapter.session("tata_CA1").unwrap().chunks_sent, 1);
}

#[tokio::test]
async fn test_outbound_chunk_numbers_are_sequential() {
    let (adapter, mut events, url) = start_server().await;
    let mut client = connect(&url).await;
    establish(&mut client, &mut events).await;

    // 1600 samples @ 16 kHz -> 800 μ-law bytes -> five full frames.
    let pcm = codec::samples_to_bytes(&vec![0i16; 1600]);
    adapter.send_audio("tata_CA1", &pcm, 16_000);

    for expected in 1..=5u64 {
        let frame = next_wire_json(&mut client).await;
        assert_eq!(frame["event"], "media");
        assert_eq!(frame["media"]["chunk"], expected);
        let payload = BASE64
            .decode(frame["media"]["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(payload.len(), 160);
    }
    assert_eq!(adapter.session("tata_CA1").unwrap().chunks_sent, 5);
}

#[tokio::test]
async fn test_duplicate_stream_sid_is_rejected() {
    let (_adapter, mut events, url) = start_server().await;
    let mut first = connect(&url).await;
    establish(&mut first, &mut events).await;

    // A second socket claiming the same streamSid is a protocol error;
    // the offending socket is closed and no second callStarted appears.
    let mut second = connect(&url).await;
    send_json(&mut second, start_envelope()).await;

    let closed = timeout(RECV_TIMEOUT, async {
        loop {
            match second.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "second socket was not closed");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_dtmf_event() {
    let (_adapter, mut events, url) = start_server().await;
    let mut client = connect(&url).await;
    establish(&mut client, &mut events).await;

    send_json(
        &mut client,
        serde_json::json!({
            "event": "dtmf",
            "sequenceNumber": 4,
            "streamSid": "MZ1",
            "dtmf": {"digit": "#"}
        }),
    )
    .await;

    match next_event(&mut events).await {
        TelephonyEvent::Dtmf { call_id, digit } => {
            assert_eq!(call_id, "tata_CA1");
            assert_eq!(digit, "#");
        }
        other => panic!("expected dtmf, got {other:?}"),
    }
}
