//! Thin adapter handlers: invoices, transaction listing, balance and info.

use super::ln_error_response;
use crate::db::App;
use crate::service::{supported_method_names, Service};
use anyhow::Result;
use lightning_invoice::Bolt11Invoice;
use nostr::{
    BalanceResult, ErrorCode, Event, InfoResult, ListTransactionsParams, ListTransactionsResult,
    LookupInvoiceParams, MakeInvoiceParams, Method, Response,
};
use serde_json::Value;
use std::cmp::Reverse;
use std::str::FromStr;

impl Service {
    pub(crate) async fn handle_make_invoice(
        &self,
        params: Value,
        app: &App,
        event: &Event,
        request_event_id: i64,
    ) -> Result<()> {
        let method = Method::MakeInvoice;
        let params: MakeInvoiceParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                self.publish_response(
                    event,
                    request_event_id,
                    &Response::error(
                        method.as_str(),
                        ErrorCode::BadRequest,
                        &format!("Invalid make_invoice params: {}", err),
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        if let Some(denial) = self.check(app, method, None)? {
            self.publish_response(
                event,
                request_event_id,
                &Response::error(method.as_str(), denial.code, &denial.message),
                None,
            )
            .await;
            return Ok(());
        }

        let call = self.ln.make_invoice(
            params.amount,
            params.description.as_deref(),
            params.description_hash.as_deref(),
            params.expiry,
        );
        let response = match self.ln_call(call).await {
            Ok(transaction) => Response::success(method.as_str(), &transaction),
            Err(err) => ln_error_response(method.as_str(), &err),
        };
        self.publish_response(event, request_event_id, &response, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_lookup_invoice(
        &self,
        params: Value,
        app: &App,
        event: &Event,
        request_event_id: i64,
    ) -> Result<()> {
        let method = Method::LookupInvoice;
        let params: LookupInvoiceParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                self.publish_response(
                    event,
                    request_event_id,
                    &Response::error(
                        method.as_str(),
                        ErrorCode::BadRequest,
                        &format!("Invalid lookup_invoice params: {}", err),
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        // At least one of payment_hash / invoice is required
        let payment_hash = match (&params.payment_hash, &params.invoice) {
            (Some(hash), _) => hash.clone(),
            (None, Some(invoice)) => match Bolt11Invoice::from_str(&invoice.to_lowercase()) {
                Ok(decoded) => decoded.payment_hash().to_string(),
                Err(err) => {
                    self.publish_response(
                        event,
                        request_event_id,
                        &Response::error(
                            method.as_str(),
                            ErrorCode::BadRequest,
                            &format!("Failed to decode bolt11 invoice: {}", err),
                        ),
                        None,
                    )
                    .await;
                    return Ok(());
                }
            },
            (None, None) => {
                self.publish_response(
                    event,
                    request_event_id,
                    &Response::error(
                        method.as_str(),
                        ErrorCode::BadRequest,
                        "payment_hash or invoice is required",
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        if let Some(denial) = self.check(app, method, None)? {
            self.publish_response(
                event,
                request_event_id,
                &Response::error(method.as_str(), denial.code, &denial.message),
                None,
            )
            .await;
            return Ok(());
        }

        let response = match self.ln_call(self.ln.lookup_invoice(&payment_hash)).await {
            Ok(transaction) => Response::success(method.as_str(), &transaction),
            Err(err) => ln_error_response(method.as_str(), &err),
        };
        self.publish_response(event, request_event_id, &response, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_list_transactions(
        &self,
        params: Value,
        app: &App,
        event: &Event,
        request_event_id: i64,
    ) -> Result<()> {
        let method = Method::ListTransactions;
        let params: ListTransactionsParams = if params.is_null() {
            ListTransactionsParams::default()
        } else {
            match serde_json::from_value(params) {
                Ok(params) => params,
                Err(err) => {
                    self.publish_response(
                        event,
                        request_event_id,
                        &Response::error(
                            method.as_str(),
                            ErrorCode::BadRequest,
                            &format!("Invalid list_transactions params: {}", err),
                        ),
                        None,
                    )
                    .await;
                    return Ok(());
                }
            }
        };

        if let Some(denial) = self.check(app, method, None)? {
            self.publish_response(
                event,
                request_event_id,
                &Response::error(method.as_str(), denial.code, &denial.message),
                None,
            )
            .await;
            return Ok(());
        }

        let response = match self.ln_call(self.ln.list_transactions(&params)).await {
            Ok(mut transactions) => {
                // Settled first by settle time, unsettled by creation time
                transactions
                    .sort_by_key(|tx| Reverse(tx.settled_at.unwrap_or(tx.created_at)));
                Response::success(method.as_str(), &ListTransactionsResult { transactions })
            }
            Err(err) => ln_error_response(method.as_str(), &err),
        };
        self.publish_response(event, request_event_id, &response, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_get_balance(
        &self,
        app: &App,
        event: &Event,
        request_event_id: i64,
    ) -> Result<()> {
        let method = Method::GetBalance;
        if let Some(denial) = self.check(app, method, None)? {
            self.publish_response(
                event,
                request_event_id,
                &Response::error(method.as_str(), denial.code, &denial.message),
                None,
            )
            .await;
            return Ok(());
        }

        let response = match self.ln_call(self.ln.get_balance()).await {
            Ok(balance) => Response::success(method.as_str(), &BalanceResult { balance }),
            Err(err) => ln_error_response(method.as_str(), &err),
        };
        self.publish_response(event, request_event_id, &response, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_get_info(
        &self,
        app: &App,
        event: &Event,
        request_event_id: i64,
    ) -> Result<()> {
        let method = Method::GetInfo;
        if let Some(denial) = self.check(app, method, None)? {
            self.publish_response(
                event,
                request_event_id,
                &Response::error(method.as_str(), denial.code, &denial.message),
                None,
            )
            .await;
            return Ok(());
        }

        let response = match self.ln_call(self.ln.get_info()).await {
            Ok(info) => Response::success(
                method.as_str(),
                &InfoResult {
                    alias: info.alias,
                    color: info.color,
                    pubkey: info.pubkey,
                    network: info.network,
                    block_height: info.block_height,
                    block_hash: info.block_hash,
                    methods: supported_method_names(),
                },
            ),
            Err(err) => ln_error_response(method.as_str(), &err),
        };
        self.publish_response(event, request_event_id, &response, None)
            .await;
        Ok(())
    }
}
