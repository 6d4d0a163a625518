use std::{convert::Infallible, time::Duration};

use axum::{
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Extension,
};
use futures::{stream, Stream, StreamExt};
use tracing::{debug, trace};

use crate::{
    events::{Event, Subscription, TimestampedEvent},
    station::Station,
};

fn to_sse(event: &TimestampedEvent) -> Result<SseEvent, Infallible> {
    trace!(%event, "Streaming");
    Ok(SseEvent::default().data(event.to_json()))
}

/// The events of a subscription, until the subscription ends.
/// Dropping the stream unsubscribes.
pub(crate) fn subscription_stream(subscription: Subscription) -> impl Stream<Item = TimestampedEvent> {
    stream::unfold(subscription, |mut subscription| async move {
        subscription
            .recv()
            .await
            .map(|event| (event, subscription))
    })
}

pub(crate) async fn sse_handler(
    Extension(station): Extension<Station>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    // Subscribe before taking the snapshot so nothing falls in between.
    let subscription = station.bus().subscribe();
    debug!(subscribers = station.bus().subscriber_count(), "Event stream opened");

    let snapshot = TimestampedEvent::now(Event::DeviceList {
        devices: station.devices(),
    });

    let events = stream::once(async move { snapshot })
        .chain(subscription_stream(subscription))
        .map(|event| to_sse(&event));

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(station.config().heartbeat_secs.max(1)))
            .text("ping"),
    )
}
