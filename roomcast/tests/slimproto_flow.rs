//! End-to-end protocol flow against real sockets: HELO handshake, stream
//! negotiation, HTTP data channel binding, chunk delivery and teardown
//! ordering, with the test driving the event loop by hand.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use roomcast::audio::chunk::Chunk;
use roomcast::conn::{ConnectionEvent, ConnectionHandle, EventSink, TcpServer};
use roomcast::encoder::Format;
use roomcast::pipeline::Consumer;
use roomcast::proto::streamer::{NotifyFactory, Streamer, StreamerSettings};
use roomcast::proto::wire;
use roomcast::util::writer::WriteError;

const SLIM_PORT: u16 = 46130;
const HTTP_PORT: u16 = 46131;
const CLIENT_ID: &str = "00:00:00:00:00:01";

enum Event {
    Command(ConnectionEvent),
    Stream(ConnectionEvent),
    WriteDone(u64, Result<usize, WriteError>),
}

fn helo_frame() -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(b"HELO");
    frame.extend_from_slice(&36u32.to_be_bytes());
    let mut payload = [0u8; 36];
    payload[7] = 0x01; // last MAC byte
    frame.extend_from_slice(&payload);
    frame
}

fn stat_frame(event: &[u8; 4]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(b"STAT");
    frame.extend_from_slice(&53u32.to_be_bytes());
    let mut payload = [0u8; 53];
    payload[0..4].copy_from_slice(event);
    frame.extend_from_slice(&payload);
    frame
}

fn resp_frame() -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(b"RESP");
    frame.extend_from_slice(&19u32.to_be_bytes());
    frame.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\n");
    frame
}

fn chunk(rate: u32, bytes: &[u8]) -> Chunk {
    let mut chunk = Chunk::with_capacity(bytes.len().max(4));
    chunk.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
    chunk.set_size(bytes.len());
    chunk.set_sampling_rate(rate);
    chunk
}

/// Route buffered events into the streamer until the channel stays quiet.
async fn pump(
    streamer: &mut Streamer<ConnectionHandle>,
    events: &mut mpsc::UnboundedReceiver<Event>,
) {
    loop {
        match timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(event)) => match event {
                Event::Command(ConnectionEvent::Open { handle, .. }) => {
                    streamer.on_command_open(handle)
                }
                Event::Command(ConnectionEvent::Data {
                    conn,
                    bytes,
                    received_at,
                }) => streamer.on_command_data(conn, &bytes, received_at),
                Event::Command(ConnectionEvent::Close { conn, .. }) => {
                    streamer.on_command_close(conn)
                }
                Event::Stream(ConnectionEvent::Open { handle, .. }) => {
                    streamer.on_stream_open(handle)
                }
                Event::Stream(ConnectionEvent::Data { conn, bytes, .. }) => {
                    streamer.on_stream_data(conn, &bytes)
                }
                Event::Stream(ConnectionEvent::Close { conn, .. }) => {
                    streamer.on_stream_close(conn)
                }
                Event::WriteDone(conn, result) => streamer.on_write_done(conn, result),
            },
            _ => break,
        }
    }
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("timed out reading from the server")
        .expect("read failed");
    buf
}

#[tokio::test]
async fn test_handshake_streaming_and_teardown() {
    let (tx, mut events) = mpsc::unbounded_channel::<Event>();

    let command_sink: EventSink = {
        let tx = tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(Event::Command(event));
        })
    };
    let stream_sink: EventSink = {
        let tx = tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(Event::Stream(event));
        })
    };
    let notify_factory: NotifyFactory = {
        let tx = tx.clone();
        Arc::new(move |conn| {
            let tx = tx.clone();
            Arc::new(move |result| {
                let _ = tx.send(Event::WriteDone(conn, result));
            })
        })
    };

    let slim_server = TcpServer::new("slimproto", SLIM_PORT, 4, true, command_sink).start();
    let http_server = TcpServer::new("http", HTTP_PORT, 4, true, stream_sink).start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut streamer = Streamer::<ConnectionHandle>::new(
        StreamerSettings {
            http_port: HTTP_PORT,
            format: Format::Pcm,
            channels: 2,
            bits_per_sample: 16,
            bits_per_value: 16,
            gain: None,
        },
        notify_factory,
    );
    streamer.start();

    // --- control channel: HELO and the fixed handshake reply sequence ----
    let mut control = TcpStream::connect(("127.0.0.1", SLIM_PORT)).await.unwrap();
    control.write_all(&helo_frame()).await.unwrap();
    pump(&mut streamer, &mut events).await;

    let mut expected = Vec::new();
    expected.extend_from_slice(&wire::strm_stop());
    expected.extend_from_slice(&wire::setd(wire::DeviceId::RequestName));
    expected.extend_from_slice(&wire::setd(wire::DeviceId::Squeezebox3));
    expected.extend_from_slice(&wire::aude(true, true));
    expected.extend_from_slice(&wire::audg(None));
    let handshake = read_exact(&mut control, expected.len()).await;
    assert_eq!(handshake, expected);

    // --- first chunk starts the stream ------------------------------------
    streamer.consume(&mut chunk(44100, &[1, 2, 3, 4])).unwrap();
    let start = wire::strm_start(Format::Pcm, 16, HTTP_PORT, 44100, CLIENT_ID);
    let received = read_exact(&mut control, start.len()).await;
    assert_eq!(received, start);

    // --- data channel: GET, response headers, WAVE header ----------------
    let mut data = TcpStream::connect(("127.0.0.1", HTTP_PORT)).await.unwrap();
    data.write_all(format!("GET /stream?player={CLIENT_ID} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    pump(&mut streamer, &mut events).await;

    let mut headers = Vec::new();
    while !headers.ends_with(b"\r\n\r\n") {
        headers.extend_from_slice(&read_exact(&mut data, 1).await);
    }
    let headers = String::from_utf8(headers).unwrap();
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(headers.contains("Connection: close\r\n"));
    assert!(headers.contains("Content-Type: audio/x-wave\r\n"));

    let wave_header = read_exact(&mut data, 44).await;
    assert_eq!(&wave_header[0..4], b"RIFF");
    assert_eq!(&wave_header[8..12], b"WAVE");

    // --- link the data channel and deliver a chunk ------------------------
    control.write_all(&stat_frame(b"STMc")).await.unwrap();
    control.write_all(&resp_frame()).await.unwrap();
    pump(&mut streamer, &mut events).await;

    streamer.consume(&mut chunk(44100, &[9, 8, 7, 6])).unwrap();
    pump(&mut streamer, &mut events).await;
    let body = read_exact(&mut data, 4).await;
    assert_eq!(body, vec![9, 8, 7, 6]);

    // --- teardown: encoder drained, sockets closed, clients see EOF ------
    streamer.stop(Box::new(|| {}));
    pump(&mut streamer, &mut events).await;

    let stop = wire::strm_stop();
    let received = read_exact(&mut control, stop.len()).await;
    assert_eq!(received, stop);

    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), data.read_to_end(&mut rest))
        .await
        .expect("timed out waiting for data EOF")
        .expect("data read failed");
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), control.read(&mut buf))
        .await
        .expect("timed out waiting for control EOF")
        .expect("control read failed");
    assert_eq!(read, 0);

    slim_server.stop().await;
    http_server.stop().await;
}
