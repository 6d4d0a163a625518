use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{sink::Sink, stream::Stream, SinkExt, StreamExt};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{events::Subscription, sse::subscription_stream, station::Station};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(station): Extension<Station>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    }

    // Subscribed right away, so the client sees everything after its upgrade request.
    let subscription = station.bus().subscribe();

    ws.on_upgrade(move |socket| {
        let span = info_span!("ws", %addr);

        handle_websocket(socket, subscription).instrument(span)
    })
}

pub(crate) async fn read<S>(mut receiver: S)
where
    S: Unpin,
    S: Stream<Item = Result<Message, axum::Error>>,
{
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => {
                trace!(%text, "Ignoring client text, this socket only streams events");
            }
            Message::Close(frame) => {
                debug!(?frame, "Client closed the socket");
                break;
            }
            other => trace!(?other, "Ignoring client frame"),
        }
    }

    debug!("Read side done");
}

pub(crate) async fn write<S>(mut sender: S, subscription: Subscription)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    let mut events = Box::pin(subscription_stream(subscription));

    while let Some(event) = events.next().await {
        if let Err(e) = sender.send(Message::Text(event.to_json())).await {
            debug!(?e, "Could not forward event, client is likely gone");
            return;
        }
        trace!(%event, "Forwarded");
    }

    // The bus closed.
    debug!("No more events, closing socket");
    let _ = sender.send(Message::Close(None)).await;
}

pub(crate) async fn handle_websocket(websocket: WebSocket, subscription: Subscription) {
    let (stream_sender, stream_receiver) = websocket.split();

    let mut read_handle = tokio::spawn(read(stream_receiver).instrument(info_span!("Read")));
    let mut write_handle =
        tokio::spawn(write(stream_sender, subscription).instrument(info_span!("Write")));

    // Whichever side ends first takes the other one down,
    // which drops the socket halves and the subscription.
    tokio::select! {
        joined = &mut read_handle => {
            if let Err(e) = joined {
                warn!(?e, "Read side panicked");
            }
            write_handle.abort();
        }
        joined = &mut write_handle => {
            if let Err(e) = joined {
                warn!(?e, "Write side panicked");
            }
            read_handle.abort();
        }
    }

    debug!("Socket done");
}
