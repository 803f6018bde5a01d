//! Payment handlers: single and multi pay-invoice, single and multi keysend.

use super::ln_error_response;
use crate::db::now_millis;
use crate::db::App;
use crate::service::Service;
use anyhow::Result;
use lightning_invoice::Bolt11Invoice;
use nostr::{
    ErrorCode, Event, Method, MultiPayInvoiceParams, MultiPayKeysendParams, PayInvoiceParams,
    PayInvoiceResult, PayKeysendParams, Response, TlvRecord,
};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

impl Service {
    pub(crate) async fn handle_pay_invoice(
        &self,
        params: Value,
        app: &App,
        event: &Event,
        request_event_id: i64,
    ) -> Result<()> {
        let params: PayInvoiceParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                self.publish_response(
                    event,
                    request_event_id,
                    &Response::error(
                        Method::PayInvoice.as_str(),
                        ErrorCode::BadRequest,
                        &format!("Invalid pay_invoice params: {}", err),
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        self.pay_invoice_element(
            app,
            event,
            request_event_id,
            params.invoice,
            params.amount,
            None,
            false,
        )
        .await
    }

    pub(crate) async fn handle_multi_pay_invoice(
        self: Arc<Self>,
        params: Value,
        app: App,
        event: Event,
        request_event_id: i64,
    ) -> Result<()> {
        let params: MultiPayInvoiceParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                self.publish_response(
                    &event,
                    request_event_id,
                    &Response::error(
                        Method::MultiPayInvoice.as_str(),
                        ErrorCode::BadRequest,
                        &format!("Invalid multi_pay_invoice params: {}", err),
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        // One sub-task per element against the shared pay pool; a failed
        // element never cancels the others
        let mut tasks = JoinSet::new();
        for element in params.invoices {
            let svc = self.clone();
            let app = app.clone();
            let event = event.clone();
            tasks.spawn(async move {
                let Ok(_permit) = svc.pay_pool.clone().acquire_owned().await else {
                    return;
                };
                let result = svc
                    .pay_invoice_element(
                        &app,
                        &event,
                        request_event_id,
                        element.invoice,
                        element.amount,
                        element.id,
                        true,
                    )
                    .await;
                if let Err(err) = result {
                    error!(event_id = %event.id, error = %err, "multi-pay element failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// The single-pay pipeline: decode, authorize, record, pay, reply.
    ///
    /// Multi elements reply with a `d`-tag of the element id, falling back to
    /// the invoice payment hash.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn pay_invoice_element(
        &self,
        app: &App,
        event: &Event,
        request_event_id: i64,
        invoice: String,
        amount_override: Option<u64>,
        element_id: Option<String>,
        multi: bool,
    ) -> Result<()> {
        let method = if multi {
            Method::MultiPayInvoice
        } else {
            Method::PayInvoice
        };
        let bolt11 = invoice.to_lowercase();

        let decoded = match Bolt11Invoice::from_str(&bolt11) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(event_id = %event.id, app_id = app.id, error = %err, "failed to decode bolt11 invoice");
                let d_tag = multi.then(|| element_id.unwrap_or_default());
                self.publish_response(
                    event,
                    request_event_id,
                    &Response::error(
                        method.as_str(),
                        ErrorCode::Internal,
                        &format!("Failed to decode bolt11 invoice: {}", err),
                    ),
                    d_tag,
                )
                .await;
                return Ok(());
            }
        };

        let payment_hash = decoded.payment_hash().to_string();
        let d_tag = multi.then(|| element_id.unwrap_or_else(|| payment_hash.clone()));

        // The explicit amount only fills in for zero-amount invoices
        let Some(amount_msats) = decoded.amount_milli_satoshis().or(amount_override) else {
            self.publish_response(
                event,
                request_event_id,
                &Response::error(
                    method.as_str(),
                    ErrorCode::BadRequest,
                    "amount is required for zero-amount invoices",
                ),
                d_tag,
            )
            .await;
            return Ok(());
        };

        if let Some(denial) = self.check(app, method, Some(amount_msats))? {
            self.publish_response(
                event,
                request_event_id,
                &Response::error(method.as_str(), denial.code, &denial.message),
                d_tag,
            )
            .await;
            return Ok(());
        }

        // Created before the node call so partial failure is attributable;
        // a write failure is a silent drop and the client reconciles by
        // retrying
        let payment = match self.db.create_payment(
            app.id,
            request_event_id,
            &bolt11,
            amount_msats,
            now_millis(),
        ) {
            Ok(payment) => payment,
            Err(err) => {
                error!(event_id = %event.id, app_id = app.id, error = %err, "failed to record payment");
                return Err(err.into());
            }
        };

        info!(event_id = %event.id, app_id = app.id, "sending payment");
        match self.ln_call(self.ln.send_payment_sync(&bolt11)).await {
            Ok(preimage) => {
                if let Err(err) = self.db.set_payment_preimage(payment.id, &preimage) {
                    // The reply still carries the preimage; it is the client's
                    // only proof of payment
                    error!(payment_id = payment.id, error = %err, "failed to store preimage");
                }
                self.analytics.log(
                    "nwc_payment_succeeded",
                    json!({ "multi": multi, "amount": amount_msats / 1_000 }),
                );
                self.publish_response(
                    event,
                    request_event_id,
                    &Response::success(
                        method.as_str(),
                        &PayInvoiceResult {
                            preimage,
                            fees_paid: None,
                        },
                    ),
                    d_tag,
                )
                .await;
            }
            Err(err) => {
                info!(event_id = %event.id, app_id = app.id, error = %err, "failed to send payment");
                self.analytics.log(
                    "nwc_payment_failed",
                    json!({
                        "error": err.to_string(),
                        "multi": multi,
                        "invoice": bolt11,
                        "amount": amount_msats / 1_000,
                    }),
                );
                self.publish_response(
                    event,
                    request_event_id,
                    &ln_error_response(method.as_str(), &err),
                    d_tag,
                )
                .await;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_pay_keysend(
        &self,
        params: Value,
        app: &App,
        event: &Event,
        request_event_id: i64,
    ) -> Result<()> {
        let params: PayKeysendParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                self.publish_response(
                    event,
                    request_event_id,
                    &Response::error(
                        Method::PayKeysend.as_str(),
                        ErrorCode::BadRequest,
                        &format!("Invalid pay_keysend params: {}", err),
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        self.pay_keysend_element(
            app,
            event,
            request_event_id,
            params.pubkey,
            params.amount,
            params.preimage,
            params.tlv_records,
            None,
            false,
        )
        .await
    }

    pub(crate) async fn handle_multi_pay_keysend(
        self: Arc<Self>,
        params: Value,
        app: App,
        event: Event,
        request_event_id: i64,
    ) -> Result<()> {
        let params: MultiPayKeysendParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                self.publish_response(
                    &event,
                    request_event_id,
                    &Response::error(
                        Method::MultiPayKeysend.as_str(),
                        ErrorCode::BadRequest,
                        &format!("Invalid multi_pay_keysend params: {}", err),
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        let mut tasks = JoinSet::new();
        for element in params.keysends {
            let svc = self.clone();
            let app = app.clone();
            let event = event.clone();
            tasks.spawn(async move {
                let Ok(_permit) = svc.pay_pool.clone().acquire_owned().await else {
                    return;
                };
                let result = svc
                    .pay_keysend_element(
                        &app,
                        &event,
                        request_event_id,
                        element.pubkey,
                        element.amount,
                        element.preimage,
                        element.tlv_records,
                        element.id,
                        true,
                    )
                    .await;
                if let Err(err) = result {
                    error!(event_id = %event.id, error = %err, "multi-keysend element failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Keysend pipeline: no BOLT-11 to decode, the budget check uses the
    /// amount directly. The `d`-tag falls back to the destination pubkey.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn pay_keysend_element(
        &self,
        app: &App,
        event: &Event,
        request_event_id: i64,
        destination: String,
        amount_msats: u64,
        preimage: Option<String>,
        tlv_records: Vec<TlvRecord>,
        element_id: Option<String>,
        multi: bool,
    ) -> Result<()> {
        let method = if multi {
            Method::MultiPayKeysend
        } else {
            Method::PayKeysend
        };
        let d_tag = multi.then(|| element_id.unwrap_or_else(|| destination.clone()));

        if let Some(denial) = self.check(app, method, Some(amount_msats))? {
            self.publish_response(
                event,
                request_event_id,
                &Response::error(method.as_str(), denial.code, &denial.message),
                d_tag,
            )
            .await;
            return Ok(());
        }

        let payment =
            match self
                .db
                .create_payment(app.id, request_event_id, "", amount_msats, now_millis())
            {
                Ok(payment) => payment,
                Err(err) => {
                    error!(event_id = %event.id, app_id = app.id, error = %err, "failed to record payment");
                    return Err(err.into());
                }
            };

        info!(event_id = %event.id, app_id = app.id, destination = %destination, "sending keysend");
        let call = self.ln.send_keysend(
            amount_msats,
            &destination,
            preimage.as_deref(),
            &tlv_records,
        );
        match self.ln_call(call).await {
            Ok(preimage) => {
                if let Err(err) = self.db.set_payment_preimage(payment.id, &preimage) {
                    error!(payment_id = payment.id, error = %err, "failed to store preimage");
                }
                self.analytics.log(
                    "nwc_payment_succeeded",
                    json!({ "multi": multi, "amount": amount_msats / 1_000, "keysend": true }),
                );
                self.publish_response(
                    event,
                    request_event_id,
                    &Response::success(
                        method.as_str(),
                        &PayInvoiceResult {
                            preimage,
                            fees_paid: None,
                        },
                    ),
                    d_tag,
                )
                .await;
            }
            Err(err) => {
                info!(event_id = %event.id, app_id = app.id, error = %err, "failed to send keysend");
                self.analytics.log(
                    "nwc_payment_failed",
                    json!({
                        "error": err.to_string(),
                        "multi": multi,
                        "amount": amount_msats / 1_000,
                        "keysend": true,
                    }),
                );
                self.publish_response(
                    event,
                    request_event_id,
                    &ln_error_response(method.as_str(), &err),
                    d_tag,
                )
                .await;
            }
        }
        Ok(())
    }
}
