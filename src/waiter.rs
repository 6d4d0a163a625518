//! Waiting for a specific line to show up on the event bus.
//!
//! A [`Waiter`] is started (subscribed) before the command it waits for is written,
//! so that a fast device can not answer before anyone is listening.

use std::{fmt::Debug, sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::Error,
    events::{Event, EventBus, Subscription},
    mac::MacAddress,
};

static BLINK_OK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bBLINK-OK\b").expect("BLINK-OK regex is valid"));

static PING_OK: Lazy<Regex> = Lazy::new(|| Regex::new(r"OK|SUCCESS").expect("Ping regex is valid"));

static HELLO: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bHELLO\b").expect("HELLO regex is valid"));

static READY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bREADY\b").expect("READY regex is valid"));

/// Decides whether a line is the one being waited for.
#[derive(Clone)]
pub enum LineMatcher {
    /// The line matches the pattern.
    Token(Regex),

    /// The line matches the pattern and carries the given MAC.
    MacScoped {
        /// Pattern the line must match.
        token: Regex,

        /// The MAC which must appear in the line.
        mac: MacAddress,
    },

    /// The line matches the pattern and carries any MAC.
    AnyMac(Regex),

    /// The line starts with this prefix, case-insensitive.
    Prefix(String),

    /// Anything else.
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Debug for LineMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(token) => f.debug_tuple("Token").field(&token.as_str()).finish(),
            Self::MacScoped { token, mac } => f
                .debug_struct("MacScoped")
                .field("token", &token.as_str())
                .field("mac", mac)
                .finish(),
            Self::AnyMac(token) => f.debug_tuple("AnyMac").field(&token.as_str()).finish(),
            Self::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl LineMatcher {
    /// A blink was acknowledged.
    pub fn blink_ok() -> Self {
        Self::Token(BLINK_OK.clone())
    }

    /// A ping was answered.
    pub fn ping_ok() -> Self {
        Self::Token(PING_OK.clone())
    }

    /// A board announced itself.
    pub fn hello() -> Self {
        Self::AnyMac(HELLO.clone())
    }

    /// The board with this MAC is ready.
    pub fn ready(mac: MacAddress) -> Self {
        Self::MacScoped {
            token: READY.clone(),
            mac,
        }
    }

    /// An echo of a command starting with this verb.
    pub fn echo(verb: &str) -> Self {
        Self::Prefix(verb.to_string())
    }

    /// Check a line.
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Token(token) => token.is_match(line),
            Self::MacScoped { token, mac } => {
                token.is_match(line) && MacAddress::extract_all(line).contains(mac)
            }
            Self::AnyMac(token) => token.is_match(line) && MacAddress::extract(line).is_some(),
            Self::Prefix(prefix) => line
                .trim_start()
                .get(..prefix.len())
                .map_or(false, |start| start.eq_ignore_ascii_case(prefix)),
            Self::Custom(predicate) => predicate(line),
        }
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// This line matched.
    Matched(String),

    /// The caller cancelled.
    Aborted,

    /// Nothing matched in time.
    TimedOut(Duration),

    /// The bus closed, so nothing ever will match.
    ShutDown,
}

impl WaitOutcome {
    /// The matched line, or the matching error condition.
    pub fn into_result(self) -> Result<String, Error> {
        match self {
            WaitOutcome::Matched(line) => Ok(line),
            WaitOutcome::Aborted => Err(Error::ClientAbort),
            WaitOutcome::TimedOut(after) => Err(Error::Timeout(after.as_millis() as u64)),
            WaitOutcome::ShutDown => Err(Error::ShuttingDown),
        }
    }
}

/// A one-shot subscription resolving on the first matching raw line.
#[derive(Debug)]
pub struct Waiter {
    matcher: LineMatcher,
    subscription: Subscription,
    bus: EventBus,
    path: Option<String>,
}

impl Waiter {
    /// Subscribe right away.
    /// Only lines published after this returns are considered.
    pub fn start(bus: &EventBus, matcher: LineMatcher) -> Self {
        trace!(?matcher, "Waiter started");

        Self {
            matcher,
            subscription: bus.subscribe(),
            bus: bus.clone(),
            path: None,
        }
    }

    /// Only consider lines from this port.
    pub fn on_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    fn wanted_path(&self, path: Option<&str>) -> bool {
        match (&self.path, path) {
            (None, _) => true,
            (Some(wanted), Some(path)) => wanted == path,
            (Some(_), None) => false,
        }
    }

    async fn next_match(&mut self) -> String {
        while let Some(event) = self.subscription.recv().await {
            if let Event::RawLine { path, text } = event.inner {
                if self.wanted_path(path.as_deref()) && self.matcher.matches(&text) {
                    return text;
                }
            }
        }

        // The bus is closed so nothing will ever match, and `wait` notices the close.
        futures::future::pending().await
    }

    /// Wait until a line matches, the token is cancelled, the bus closes,
    /// or the timeout (if any) passes.
    ///
    /// The subscription is released once, however the wait ends.
    pub async fn wait(mut self, cancel: CancellationToken, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => futures::future::pending().await,
            }
        };

        let bus = self.bus.clone();

        let outcome = tokio::select! {
            line = self.next_match() => WaitOutcome::Matched(line),
            _ = bus.closed() => WaitOutcome::ShutDown,
            _ = cancel.cancelled() => WaitOutcome::Aborted,
            _ = deadline => WaitOutcome::TimedOut(timeout.unwrap_or_default()),
        };

        debug!(?outcome, "Waiter settled");
        self.subscription.unsubscribe();

        outcome
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    use super::*;

    fn mac(s: &str) -> MacAddress {
        MacAddress::parse(s).unwrap()
    }

    #[test]
    fn matchers() {
        assert!(LineMatcher::blink_ok().matches("BLINK-OK"));
        assert!(LineMatcher::blink_ok().matches("> BLINK-OK 3"));
        assert!(!LineMatcher::blink_ok().matches("XBLINK-OKX"));

        assert!(LineMatcher::ping_ok().matches("OK"));
        assert!(LineMatcher::ping_ok().matches("PING SUCCESS"));
        assert!(!LineMatcher::ping_ok().matches("pong"));

        assert!(LineMatcher::hello().matches("HELLO aa:bb:cc:dd:ee:ff"));
        assert!(!LineMatcher::hello().matches("HELLO world"));

        let ready = LineMatcher::ready(mac("AA:BB:CC:DD:EE:FF"));
        assert!(ready.matches("READY aa:bb:cc:dd:ee:ff"));
        assert!(!ready.matches("READY 11:22:33:44:55:66"));
        assert!(!ready.matches("HELLO AA:BB:CC:DD:EE:FF"));

        let echo = LineMatcher::echo("MONITOR");
        assert!(echo.matches("monitor 1,2 AA:BB:CC:DD:EE:FF"));
        assert!(!echo.matches("MON"));
    }

    #[tokio::test]
    async fn resolves_on_first_match() {
        let bus = EventBus::default();
        let waiter = Waiter::start(&bus, LineMatcher::blink_ok());

        bus.publish(Event::raw_line(None, "noise"));
        bus.publish(Event::raw_line(None, "BLINK-OK"));
        bus.publish(Event::raw_line(None, "BLINK-OK again"));

        let outcome = waiter
            .wait(CancellationToken::new(), Some(Duration::from_secs(1)))
            .await;
        assert_eq!(outcome, WaitOutcome::Matched("BLINK-OK".into()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn path_scoping() {
        let bus = EventBus::default();
        let waiter = Waiter::start(&bus, LineMatcher::ping_ok()).on_path("/dev/ttyA");

        bus.publish(Event::raw_line(Some("/dev/ttyB"), "OK from B"));
        bus.publish(Event::raw_line(Some("/dev/ttyA"), "OK from A"));

        let outcome = waiter
            .wait(CancellationToken::new(), Some(Duration::from_secs(1)))
            .await;
        assert_eq!(outcome, WaitOutcome::Matched("OK from A".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_not_earlier() {
        let bus = EventBus::default();
        let waiter = Waiter::start(&bus, LineMatcher::blink_ok());
        let started = Instant::now();

        let outcome = waiter
            .wait(CancellationToken::new(), Some(Duration::from_millis(5000)))
            .await;

        assert_eq!(outcome, WaitOutcome::TimedOut(Duration::from_millis(5000)));
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert!(started.elapsed() < Duration::from_millis(5100));
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            WaitOutcome::TimedOut(Duration::from_millis(5000)).into_result(),
            Err(Error::Timeout(5000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_one_leaves_the_other() {
        let bus = EventBus::default();
        let cancel_a = CancellationToken::new();

        let a = tokio::spawn(
            Waiter::start(&bus, LineMatcher::blink_ok()).wait(cancel_a.clone(), None),
        );
        let b = tokio::spawn(
            Waiter::start(&bus, LineMatcher::blink_ok())
                .wait(CancellationToken::new(), Some(Duration::from_secs(5))),
        );

        cancel_a.cancel();
        assert_eq!(a.await.unwrap(), WaitOutcome::Aborted);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(Event::raw_line(None, "BLINK-OK"));
        assert_eq!(b.await.unwrap(), WaitOutcome::Matched("BLINK-OK".into()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closing_the_bus_settles_waiters_without_timeout() {
        let bus = EventBus::default();
        let waiter = tokio::spawn(
            Waiter::start(&bus, LineMatcher::hello()).wait(CancellationToken::new(), None),
        );
        tokio::task::yield_now().await;

        bus.close();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::ShutDown);
        assert_eq!(outcome.into_result(), Err(Error::ShuttingDown));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn waiting_on_a_closed_bus_ends_at_once() {
        let bus = EventBus::default();
        bus.close();

        let outcome = Waiter::start(&bus, LineMatcher::blink_ok())
            .wait(CancellationToken::new(), Some(Duration::from_secs(60)))
            .await;
        assert_eq!(outcome, WaitOutcome::ShutDown);
    }

    #[tokio::test]
    async fn dropped_waiter_unsubscribes() {
        let bus = EventBus::default();
        let waiter = Waiter::start(&bus, LineMatcher::hello());
        assert_eq!(bus.subscriber_count(), 1);

        drop(waiter);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
