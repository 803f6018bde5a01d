//! NWC protocol engine: request ingestion, dispatch, response publishing.

use crate::analytics::AnalyticsSink;
use crate::db::{now_millis, App, Db, RecordOutcome, RequestState, ResponseState};
use crate::lnclient::{LnClient, LnError};
use crate::permissions::{check_permission, Denial};
use anyhow::{Context, Result};
use async_trait::async_trait;
use nostr::{
    finalize_event, verify_event, xonly_hex_to_compressed, ErrorCode, Event, EventTemplate,
    Method, Request, Response, INFO_EVENT_KIND, REQUEST_KIND, RESPONSE_KIND,
};
use nostr_client::{RelayClient, SubscriptionSpec};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Methods advertised in the info event and accepted by dispatch.
pub const SUPPORTED_METHODS: &[Method] = &[
    Method::PayInvoice,
    Method::MultiPayInvoice,
    Method::PayKeysend,
    Method::MultiPayKeysend,
    Method::MakeInvoice,
    Method::LookupInvoice,
    Method::ListTransactions,
    Method::GetBalance,
    Method::GetInfo,
];

const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(1);

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn supported_method_names() -> Vec<String> {
    SUPPORTED_METHODS
        .iter()
        .map(|method| method.as_str().to_string())
        .collect()
}

/// Seam for publishing signed events back to the relay.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &Event) -> nostr_client::Result<()>;
}

#[async_trait]
impl EventPublisher for RelayClient {
    async fn publish(&self, event: &Event) -> nostr_client::Result<()> {
        RelayClient::publish(self, event).await
    }
}

/// The protocol engine. Aggregates the database, Lightning client, relay
/// publisher and analytics sink; handlers receive these by capability, never
/// through globals.
pub struct Service {
    pub(crate) db: Db,
    pub(crate) ln: Arc<dyn LnClient>,
    pub(crate) analytics: Arc<dyn AnalyticsSink>,
    publisher: Arc<dyn EventPublisher>,
    secret_key: [u8; 32],
    identity_pubkey: String,
    /// Admission for top-level handlers.
    handler_pool: Arc<Semaphore>,
    /// Admission for multi-pay sub-tasks; a separate pool of the same size so
    /// a parent handler holding a handler permit cannot deadlock its children.
    pub(crate) pay_pool: Arc<Semaphore>,
    pub(crate) ln_timeout: Duration,
    /// Highest handled event `created_at`, fed back into re-subscriptions.
    last_handled_secs: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
}

impl Service {
    pub fn new(
        db: Db,
        ln: Arc<dyn LnClient>,
        analytics: Arc<dyn AnalyticsSink>,
        publisher: Arc<dyn EventPublisher>,
        secret_key: [u8; 32],
        handler_concurrency: usize,
        ln_timeout: Duration,
    ) -> Result<Self> {
        let identity_pubkey =
            nostr::get_public_key_hex(&secret_key).context("deriving identity pubkey")?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            db,
            ln,
            analytics,
            publisher,
            secret_key,
            identity_pubkey,
            handler_pool: Arc::new(Semaphore::new(handler_concurrency)),
            pay_pool: Arc::new(Semaphore::new(handler_concurrency)),
            ln_timeout,
            last_handled_secs: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
        })
    }

    pub fn identity_pubkey(&self) -> &str {
        &self.identity_pubkey
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Request shutdown: stop accepting events, cancel in-flight node calls.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Publish the replaceable kind-13194 info event listing supported methods.
    pub async fn publish_info_event(&self) -> Result<()> {
        let event = finalize_event(
            &EventTemplate {
                created_at: now_secs(),
                kind: INFO_EVENT_KIND,
                tags: vec![],
                content: supported_method_names().join(" "),
            },
            &self.secret_key,
        )
        .context("signing info event")?;

        self.publisher
            .publish(&event)
            .await
            .context("publishing info event")
    }

    /// Main loop: subscribe and dispatch until shutdown or stream end.
    pub async fn run(self: Arc<Self>, relay: Arc<RelayClient>, grace_secs: u64) -> Result<()> {
        if let Err(err) = self.publish_info_event().await {
            warn!(error = %err, "could not publish info event");
        }

        self.last_handled_secs
            .store(now_secs().saturating_sub(grace_secs), Ordering::Release);
        let spec = SubscriptionSpec {
            kinds: vec![REQUEST_KIND],
            pubkeys: vec![self.identity_pubkey.clone()],
            since: self.last_handled_secs.clone(),
        };
        let mut events = relay.start(spec).await;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(pubkey = %self.identity_pubkey, "listening for wallet connect requests");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("shutting down, no longer accepting events");
                    relay.shutdown();
                    break;
                }
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => {
                        let svc = self.clone();
                        let pool = self.handler_pool.clone();
                        // Never block the relay read loop; overflow waits in
                        // the semaphore's FIFO
                        tokio::spawn(async move {
                            let Ok(_permit) = pool.acquire_owned().await else {
                                return;
                            };
                            svc.handle_event(event).await;
                        });
                    }
                    None => {
                        info!("relay event stream ended");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Full pipeline for one inbound event.
    pub async fn handle_event(self: Arc<Self>, event: Event) {
        if event.kind != REQUEST_KIND {
            debug!(event_id = %event.id, kind = event.kind, "ignoring non-request event");
            return;
        }

        if let Err(err) = verify_event(&event) {
            warn!(event_id = %event.id, error = %err, "dropping event with invalid signature");
            return;
        }

        let app = match self.db.find_app_by_pubkey(&event.pubkey) {
            Ok(Some(app)) => app,
            Ok(None) => {
                debug!(event_id = %event.id, pubkey = %event.pubkey, "no app registered for pubkey");
                return;
            }
            Err(err) => {
                error!(event_id = %event.id, error = %err, "app lookup failed");
                return;
            }
        };

        // The UNIQUE nostr_id constraint renders at-least-once delivery
        // effectively-once; a failed write is left for redelivery to retry
        let request_row = match self
            .db
            .record_or_reject(&event.id, app.id, &event.content, "", now_millis())
        {
            Ok(RecordOutcome::Fresh(row)) => row,
            Ok(RecordOutcome::Duplicate) => {
                debug!(event_id = %event.id, "dropping duplicate delivery");
                return;
            }
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "failed to record request event");
                return;
            }
        };

        self.last_handled_secs
            .fetch_max(event.created_at, Ordering::AcqRel);
        if let Err(err) = self.db.touch_app_last_used(app.id) {
            debug!(app_id = app.id, error = %err, "failed to update last_used");
        }

        let peer_pubkey = match xonly_hex_to_compressed(&event.pubkey) {
            Ok(peer) => peer,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "invalid sender pubkey");
                return;
            }
        };
        let plaintext = match nostr::decrypt(&self.secret_key, &peer_pubkey, &event.content) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(event_id = %event.id, app_id = app.id, error = %err, "failed to decrypt request");
                return;
            }
        };

        let request: Request = match serde_json::from_str(&plaintext) {
            Ok(request) => request,
            Err(err) => {
                warn!(event_id = %event.id, app_id = app.id, error = %err, "failed to parse request");
                self.reply_without_handler(
                    &event,
                    request_row.id,
                    Response::error(
                        "",
                        ErrorCode::BadRequest,
                        &format!("Failed to parse request: {}", err),
                    ),
                )
                .await;
                return;
            }
        };

        if let Err(err) = self.db.set_request_method(request_row.id, &request.method) {
            debug!(event_id = %event.id, error = %err, "failed to record method");
        }

        let Some(method) = Method::parse(&request.method) else {
            info!(event_id = %event.id, method = %request.method, "unknown method");
            self.reply_without_handler(
                &event,
                request_row.id,
                Response::error(
                    &request.method,
                    ErrorCode::NotImplemented,
                    &format!("Unknown method: {}", request.method),
                ),
            )
            .await;
            return;
        };

        if let Err(err) = self
            .db
            .mark_request_state(request_row.id, RequestState::HandlerExecuting)
        {
            error!(event_id = %event.id, error = %err, "failed to mark request executing");
            return;
        }

        info!(event_id = %event.id, app_id = app.id, method = %method, "handling request");

        let outcome = self
            .clone()
            .dispatch(method, request.params, app, event.clone(), request_row.id)
            .await;

        let final_state = match outcome {
            Ok(()) => RequestState::HandlerExecuted,
            Err(ref err) => {
                error!(event_id = %event.id, method = %method, error = %err, "handler failed");
                RequestState::Error
            }
        };
        if let Err(err) = self.db.mark_request_state(request_row.id, final_state) {
            error!(event_id = %event.id, error = %err, "failed to mark request state");
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        method: Method,
        params: Value,
        app: App,
        event: Event,
        request_event_id: i64,
    ) -> Result<()> {
        match method {
            Method::PayInvoice => {
                self.handle_pay_invoice(params, &app, &event, request_event_id)
                    .await
            }
            Method::MultiPayInvoice => {
                self.handle_multi_pay_invoice(params, app, event, request_event_id)
                    .await
            }
            Method::PayKeysend => {
                self.handle_pay_keysend(params, &app, &event, request_event_id)
                    .await
            }
            Method::MultiPayKeysend => {
                self.handle_multi_pay_keysend(params, app, event, request_event_id)
                    .await
            }
            Method::MakeInvoice => {
                self.handle_make_invoice(params, &app, &event, request_event_id)
                    .await
            }
            Method::LookupInvoice => {
                self.handle_lookup_invoice(params, &app, &event, request_event_id)
                    .await
            }
            Method::ListTransactions => {
                self.handle_list_transactions(params, &app, &event, request_event_id)
                    .await
            }
            Method::GetBalance => {
                self.handle_get_balance(&app, &event, request_event_id).await
            }
            Method::GetInfo => self.handle_get_info(&app, &event, request_event_id).await,
        }
    }

    /// Publish a reply for requests that never reach a real handler
    /// (malformed JSON, unknown method), keeping the state graph intact.
    async fn reply_without_handler(&self, event: &Event, request_event_id: i64, response: Response) {
        if let Err(err) = self
            .db
            .mark_request_state(request_event_id, RequestState::HandlerExecuting)
        {
            error!(event_id = %event.id, error = %err, "failed to mark request executing");
            return;
        }
        self.publish_response(event, request_event_id, &response, None)
            .await;
        if let Err(err) = self
            .db
            .mark_request_state(request_event_id, RequestState::HandlerExecuted)
        {
            error!(event_id = %event.id, error = %err, "failed to mark request executed");
        }
    }

    /// Authorization against the app's permissions and rolling spend.
    pub(crate) fn check(
        &self,
        app: &App,
        method: Method,
        amount_msats: Option<u64>,
    ) -> Result<Option<Denial>> {
        Ok(check_permission(
            &self.db,
            app,
            method,
            amount_msats,
            now_millis(),
        )?)
    }

    /// Bound a Lightning backend call by the configured timeout and the
    /// shutdown signal.
    pub(crate) async fn ln_call<T, F>(&self, call: F) -> std::result::Result<T, LnError>
    where
        F: Future<Output = std::result::Result<T, LnError>>,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            result = tokio::time::timeout(self.ln_timeout, call) => match result {
                Ok(inner) => inner,
                Err(_) => Err(LnError::Timeout(format!(
                    "node did not respond within {:?}",
                    self.ln_timeout
                ))),
            },
            _ = shutdown_rx.changed() => Err(LnError::Backend("shutting down".to_string())),
        }
    }

    /// The `publish_response` capability handed to handlers: encrypt to the
    /// app, sign a kind-23195 reply referencing the request, publish with
    /// bounded retry, and record the outcome.
    pub(crate) async fn publish_response(
        &self,
        request_event: &Event,
        request_event_id: i64,
        response: &Response,
        d_tag: Option<String>,
    ) {
        if let Err(err) = self
            .try_publish_response(request_event, request_event_id, response, d_tag.as_deref())
            .await
        {
            warn!(event_id = %request_event.id, error = %err, "failed to publish response");
        }
    }

    async fn try_publish_response(
        &self,
        request_event: &Event,
        request_event_id: i64,
        response: &Response,
        d_tag: Option<&str>,
    ) -> Result<()> {
        let plaintext = serde_json::to_string(response).context("serializing response")?;
        let peer_pubkey =
            xonly_hex_to_compressed(&request_event.pubkey).context("expanding app pubkey")?;
        let encrypted = nostr::encrypt(&self.secret_key, &peer_pubkey, &plaintext)
            .context("encrypting response")?;

        let mut tags = vec![
            vec!["p".to_string(), request_event.pubkey.clone()],
            vec!["e".to_string(), request_event.id.clone()],
        ];
        if let Some(value) = d_tag {
            tags.push(vec!["d".to_string(), value.to_string()]);
        }

        let reply = finalize_event(
            &EventTemplate {
                created_at: now_secs(),
                kind: RESPONSE_KIND,
                tags,
                content: encrypted.clone(),
            },
            &self.secret_key,
        )
        .context("signing response event")?;

        let mut attempt = 0;
        let published = loop {
            match self.publisher.publish(&reply).await {
                Ok(()) => break Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= PUBLISH_ATTEMPTS {
                        break Err(err);
                    }
                    warn!(event_id = %request_event.id, attempt, error = %err, "publish failed, retrying");
                    tokio::time::sleep(PUBLISH_RETRY_DELAY * attempt).await;
                }
            }
        };

        let state = if published.is_ok() {
            ResponseState::Published
        } else {
            ResponseState::Failed
        };
        if let Err(err) = self.db.record_response(
            request_event_id,
            Some(&reply.id),
            d_tag,
            &encrypted,
            state,
            now_millis(),
        ) {
            warn!(event_id = %request_event.id, error = %err, "failed to record response event");
        }

        published.context("relay publish")
    }
}
