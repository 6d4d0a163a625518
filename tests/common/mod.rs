#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::http::StatusCode;
use color_eyre::Result;
use futures::StreamExt;
use harness_keel::{
    config::{Config, ControllerEndpoint},
    lock::MemoryLockStore,
    mock::{MockBuilder, MockController},
    scanner::MockOpener,
    server,
    station::Station,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

/// Nothing in the background, so tests only see what they cause.
pub fn quiet_config() -> Config {
    Config {
        controller: Some(ControllerEndpoint::Mock("it".into())),
        ping_interval_secs: 0,
        device_refresh_secs: 0,
        ..Default::default()
    }
}

/// A station with a mock controller answering like the firmware does.
pub async fn scripted_station() -> Result<(Station, MockController)> {
    scripted_station_with(quiet_config()).await
}

/// As [`scripted_station`], with the given configuration.
pub async fn scripted_station_with(config: Config) -> Result<(Station, MockController)> {
    let station = Station::new(config).await?;
    let controller = station
        .mock_controller()
        .ok_or_else(|| color_eyre::eyre::eyre!("Mock controller should be configured"))?;

    Ok((station, controller))
}

/// A station with a controller which never answers by itself.
pub fn mute_station() -> (Station, MockController, MockOpener) {
    let (transport, controller) = MockBuilder::new("mute").build();
    let opener = MockOpener::default();

    let station = Station::assemble(
        quiet_config(),
        Ok(transport),
        Arc::new(MemoryLockStore::default()),
        Arc::new(opener.clone()),
    );

    (station, controller, opener)
}

/// Serve the station on some port, and return the port.
pub async fn serve(station: Station) -> Result<u16> {
    let (port_tx, port_rx) = oneshot::channel();

    tokio::spawn(async move {
        server::serve(station, None, Some(port_tx), futures::future::pending()).await
    });

    let port = port_rx.await?;
    info!("Server on port {port}");

    Ok(port)
}

pub async fn connect(port: u16) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let (stream, http_response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws")).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

pub async fn receive(
    client: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<serde_json::Value> {
    let message = timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

    let text = message.to_text()?;

    Ok(serde_json::from_str(text)?)
}

/// Receive until an event of the given type shows up.
pub async fn receive_type(
    client: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    kind: &str,
) -> Result<serde_json::Value> {
    loop {
        let event = receive(client).await?;
        if event["type"] == kind {
            return Ok(event);
        }
    }
}

/// Send a bare `GET` and leave the connection open.
pub async fn raw_get(port: u16, path: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .await?;

    Ok(stream)
}

/// Read until `needle` shows up, or the connection ends.
/// Returns everything read.
pub async fn read_until(stream: &mut TcpStream, needle: &str, within: Duration) -> Result<String> {
    let mut seen = String::new();
    let mut buf = [0u8; 1024];

    timeout(within, async {
        while !seen.contains(needle) {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            seen += &String::from_utf8_lossy(&buf[..n]);
        }
        Ok::<_, std::io::Error>(())
    })
    .await??;

    Ok(seen)
}

/// Read until the server closes the connection.
pub async fn read_to_close(stream: &mut TcpStream, within: Duration) -> Result<String> {
    let mut seen = vec![];
    timeout(within, stream.read_to_end(&mut seen)).await??;

    Ok(String::from_utf8_lossy(&seen).to_string())
}

/// Open the event stream and read until `needle` shows up in it.
/// Returns everything read.
pub async fn read_event_stream_until(port: u16, needle: &str) -> Result<String> {
    let mut stream = raw_get(port, "/events").await?;

    read_until(&mut stream, needle, Duration::from_secs(5)).await
}
