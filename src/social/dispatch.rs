use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SocialCall, SocialConfig, SocialError, SocialRequest};
use crate::limits::SOCIAL_QUEUE_CAPACITY;
use crate::observability::SOCIAL_CALLS_TOTAL;

/// Delivers a provider call. Returns a link when the provider creates
/// something addressable (calendar events).
#[async_trait]
pub trait SocialTransport: Send + Sync {
    async fn send(&self, call: &SocialCall) -> Result<Option<String>, SocialError>;
}

/// Records calls in the log without contacting any provider.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl SocialTransport for LogTransport {
    async fn send(&self, call: &SocialCall) -> Result<Option<String>, SocialError> {
        let what = match &call.request {
            SocialRequest::Moment { .. } => "moment",
            SocialRequest::OpenGraphAction { .. } => "open graph action",
            SocialRequest::FeedPost { .. } => "feed post",
            SocialRequest::CalendarEvent { .. } => "calendar event",
            SocialRequest::RevokeToken => "token revoke",
        };
        info!(
            provider = %call.provider,
            user = %call.user_id,
            "social {what}: {:?}",
            call.request
        );
        Ok(None)
    }
}

/// Hands social calls to a background task so callers never wait on a provider.
pub struct SocialDispatcher {
    tx: mpsc::Sender<SocialCall>,
    transport: Arc<dyn SocialTransport>,
    config: SocialConfig,
}

impl SocialDispatcher {
    /// Spawn the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(transport: Arc<dyn SocialTransport>, config: SocialConfig) -> Self {
        let (tx, rx) = mpsc::channel(SOCIAL_QUEUE_CAPACITY);
        tokio::spawn(delivery_loop(transport.clone(), rx));
        Self {
            tx,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &SocialConfig {
        &self.config
    }

    /// Queue a call. Never blocks and never fails the caller: a full or closed
    /// queue drops the call with a warning.
    pub fn dispatch(&self, call: SocialCall) {
        if let Err(e) = self.tx.try_send(call) {
            let (reason, call) = match e {
                mpsc::error::TrySendError::Full(c) => ("queue full", c),
                mpsc::error::TrySendError::Closed(c) => ("dispatcher closed", c),
            };
            warn!(provider = %call.provider, user = %call.user_id, "social call dropped: {reason}");
            metrics::counter!(SOCIAL_CALLS_TOTAL, "provider" => call.provider.tag(), "status" => "dropped")
                .increment(1);
        }
    }

    /// Deliver a call now and report the outcome. For user-initiated actions.
    pub async fn call(&self, call: SocialCall) -> Result<Option<String>, SocialError> {
        let result = self.transport.send(&call).await;
        record(&call, &result);
        result
    }
}

fn record(call: &SocialCall, result: &Result<Option<String>, SocialError>) {
    let status = match result {
        Ok(_) => {
            debug!(provider = %call.provider, user = %call.user_id, "social call delivered");
            "ok"
        }
        Err(e) => {
            warn!(provider = %call.provider, user = %call.user_id, "social call failed: {e}");
            "error"
        }
    };
    metrics::counter!(SOCIAL_CALLS_TOTAL, "provider" => call.provider.tag(), "status" => status)
        .increment(1);
}

async fn delivery_loop(transport: Arc<dyn SocialTransport>, mut rx: mpsc::Receiver<SocialCall>) {
    while let Some(call) = rx.recv().await {
        // Failures are logged and dropped; the listing or rental is already committed.
        let result = transport.send(&call).await;
        record(&call, &result);
    }
}
