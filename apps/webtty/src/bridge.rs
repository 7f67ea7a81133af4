//! Messages from the embedding (parent) context.
//!
//! A conforming payload is a string `?arg=<v1>&arg=<v2>...`. Everything else
//! is ignored: the parent context carries traffic that is not ours.

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::protocol::ArgumentBatch;

const ARG_KEY: &str = "arg";

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEnvelope {
    /// Sender origin, e.g. `https://app.example.com`. `None` when the
    /// delivering context cannot tell.
    pub origin: Option<String>,
    pub data: Value,
}

impl BridgeEnvelope {
    pub fn new(origin: Option<String>, data: impl Into<Value>) -> Self {
        Self {
            origin,
            data: data.into(),
        }
    }

    pub fn text(origin: Option<&str>, payload: &str) -> Self {
        Self::new(origin.map(str::to_string), Value::String(payload.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UntrustedSender,
    NotText,
    MissingQueryPrefix,
    NoArguments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    Arguments(ArgumentBatch),
    Ignored(IgnoreReason),
}

type SenderCheck = dyn Fn(&BridgeEnvelope) -> bool + Send + Sync;

/// Decides whether an envelope may be parsed at all.
#[derive(Clone, Default)]
pub enum TrustPolicy {
    #[default]
    AnyOrigin,
    AllowOrigins(Vec<String>),
    Custom(Arc<SenderCheck>),
}

impl TrustPolicy {
    pub fn allow_origins<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TrustPolicy::AllowOrigins(
            origins
                .into_iter()
                .map(|origin| origin.into().trim_end_matches('/').to_string())
                .collect(),
        )
    }

    pub fn is_trusted_sender(&self, envelope: &BridgeEnvelope) -> bool {
        match self {
            TrustPolicy::AnyOrigin => true,
            TrustPolicy::AllowOrigins(allowed) => envelope
                .origin
                .as_deref()
                .map(|origin| origin.trim_end_matches('/'))
                .is_some_and(|origin| allowed.iter().any(|entry| entry == origin)),
            TrustPolicy::Custom(check) => check(envelope),
        }
    }
}

impl fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustPolicy::AnyOrigin => f.write_str("AnyOrigin"),
            TrustPolicy::AllowOrigins(origins) => {
                f.debug_tuple("AllowOrigins").field(origins).finish()
            }
            TrustPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrossContextBridge {
    trust: TrustPolicy,
}

impl CrossContextBridge {
    pub fn new(trust: TrustPolicy) -> Self {
        Self { trust }
    }

    pub fn parse(&self, envelope: &BridgeEnvelope) -> BridgeOutcome {
        if !self.trust.is_trusted_sender(envelope) {
            return BridgeOutcome::Ignored(IgnoreReason::UntrustedSender);
        }
        let Some(text) = envelope.data.as_str() else {
            return BridgeOutcome::Ignored(IgnoreReason::NotText);
        };
        match parse_query_arguments(text) {
            Ok(args) => BridgeOutcome::Arguments(args),
            Err(reason) => BridgeOutcome::Ignored(reason),
        }
    }
}

/// Extracts every `arg` value from a `?`-prefixed query string, in order.
pub fn parse_query_arguments(payload: &str) -> Result<ArgumentBatch, IgnoreReason> {
    let query = payload
        .strip_prefix('?')
        .ok_or(IgnoreReason::MissingQueryPrefix)?;
    let args: ArgumentBatch = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == ARG_KEY)
        .map(|(_, value)| value.into_owned())
        .collect();
    if args.is_empty() {
        return Err(IgnoreReason::NoArguments);
    }
    Ok(args)
}

pub type BridgeListener = Arc<dyn Fn(BridgeEnvelope) + Send + Sync>;

/// Delivery point for parent-context messages. Listeners are identified by
/// the `Arc` they were registered with, so the same value must be passed to
/// [`BridgeHub::remove_listener`].
#[derive(Clone, Default)]
pub struct BridgeHub {
    listeners: Arc<RwLock<Vec<BridgeListener>>>,
}

impl BridgeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: BridgeListener) {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
            guard.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &BridgeListener) -> bool {
        let mut guard = self.listeners.write();
        let before = guard.len();
        guard.retain(|existing| !Arc::ptr_eq(existing, listener));
        before != guard.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Delivers to every registered listener, in registration order.
    pub fn post(&self, envelope: BridgeEnvelope) {
        let listeners: Vec<BridgeListener> = self.listeners.read().clone();
        debug!(
            target = "webtty::bridge",
            origin = ?envelope.origin,
            listeners = listeners.len(),
            "posting bridge message"
        );
        for listener in listeners {
            listener(envelope.clone());
        }
    }
}

impl fmt::Debug for BridgeHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn extracts_repeated_args_in_order() {
        assert_eq!(
            parse_query_arguments("?arg=a&arg=b"),
            Ok(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            parse_query_arguments("?arg=ls&other=x&arg=-la"),
            Ok(vec!["ls".to_string(), "-la".to_string()])
        );
    }

    #[test]
    fn decodes_form_encoding() {
        assert_eq!(
            parse_query_arguments("?arg=hello+world&arg=a%26b&arg="),
            Ok(vec!["hello world".to_string(), "a&b".to_string(), String::new()])
        );
    }

    #[test]
    fn rejects_non_conforming_payloads() {
        assert_eq!(
            parse_query_arguments("arg=a"),
            Err(IgnoreReason::MissingQueryPrefix)
        );
        assert_eq!(
            parse_query_arguments("?"),
            Err(IgnoreReason::NoArguments)
        );
        assert_eq!(
            parse_query_arguments("?args=a&argument=b"),
            Err(IgnoreReason::NoArguments)
        );
    }

    #[test]
    fn non_string_data_is_ignored() {
        let bridge = CrossContextBridge::default();
        let envelope = BridgeEnvelope::new(None, serde_json::json!({"arg": ["a"]}));
        assert_eq!(
            bridge.parse(&envelope),
            BridgeOutcome::Ignored(IgnoreReason::NotText)
        );
    }

    #[test]
    fn origin_allow_list_is_checked_before_parsing() {
        let bridge =
            CrossContextBridge::new(TrustPolicy::allow_origins(["https://app.example.com/"]));

        let trusted = BridgeEnvelope::text(Some("https://app.example.com"), "?arg=top");
        assert_eq!(
            bridge.parse(&trusted),
            BridgeOutcome::Arguments(vec!["top".into()])
        );

        let stranger = BridgeEnvelope::text(Some("https://evil.example"), "?arg=top");
        assert_eq!(
            bridge.parse(&stranger),
            BridgeOutcome::Ignored(IgnoreReason::UntrustedSender)
        );

        let anonymous = BridgeEnvelope::text(None, "?arg=top");
        assert_eq!(
            bridge.parse(&anonymous),
            BridgeOutcome::Ignored(IgnoreReason::UntrustedSender)
        );
    }

    #[test]
    fn custom_predicate() {
        let bridge = CrossContextBridge::new(TrustPolicy::Custom(Arc::new(|env| {
            env.origin.as_deref() == Some("parent")
        })));
        assert!(matches!(
            bridge.parse(&BridgeEnvelope::text(Some("parent"), "?arg=1")),
            BridgeOutcome::Arguments(_)
        ));
        assert!(matches!(
            bridge.parse(&BridgeEnvelope::text(Some("child"), "?arg=1")),
            BridgeOutcome::Ignored(IgnoreReason::UntrustedSender)
        ));
    }

    #[test]
    fn hub_removes_by_identity() {
        let hub = BridgeHub::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let first: BridgeListener = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = hits.clone();
        let lookalike: BridgeListener = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.add_listener(first.clone());
        hub.add_listener(first.clone());
        assert_eq!(hub.listener_count(), 1);

        assert!(!hub.remove_listener(&lookalike));
        hub.post(BridgeEnvelope::text(None, "?arg=x"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(hub.remove_listener(&first));
        assert!(!hub.remove_listener(&first));
        hub.post(BridgeEnvelope::text(None, "?arg=x"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
