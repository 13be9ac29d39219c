//! A [`LightningGateway`] backed by the LND REST interface.
//!
//! * Invoices are minted with `POST /v1/invoices`, and looked up with `GET /v1/invoice/{r_hash_str}`.
//! * Outgoing payments are decoded with `GET /v1/payreq/{pay_req}` and go through `POST /v1/channels/transactions`.
//! * Settlements arrive on `GET /v1/invoices/subscribe`, a long-lived response carrying one JSON object per line. The
//!   `settle_index` query parameter makes the node replay the settlements that came after it.
//!
//! LND encodes byte fields (hashes, preimages) as base64 in its JSON. The rest of the system uses lowercase hex, so the
//! conversion happens here, at the edge.
use std::{collections::VecDeque, fmt::Display, str::FromStr, sync::Arc, time::Duration};

use bitmarket_common::Sats;
use bitmarket_engine::gateway::{
    CreatedInvoice,
    DecodedPaymentRequest,
    GatewayError,
    InvoiceState,
    InvoiceUpdate,
    LightningGateway,
    PaidInvoice,
    SettlementStream,
};
use futures::{stream, StreamExt};
use log::*;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client,
    Method,
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::LndConfig;

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

#[derive(Clone)]
pub struct LndGateway {
    client: Arc<Client>,
    base_url: String,
    provider_name: String,
    timeout: Duration,
    invoice_expiry_secs: i64,
}

impl LndGateway {
    pub fn new(config: &LndConfig, invoice_expiry: chrono::Duration) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::with_capacity(2);
        let macaroon = HeaderValue::from_str(config.macaroon.reveal().as_str())
            .map_err(|e| GatewayError::Rejected(format!("The macaroon is not a valid header value. {e}")))?;
        headers.insert(MACAROON_HEADER, macaroon);
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("Could not build the HTTP client. {e}")))?;
        Ok(Self {
            client: Arc::new(client),
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            provider_name: config.provider_name.clone(),
            timeout: config.timeout,
            invoice_expiry_secs: invoice_expiry.num_seconds(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn rest_query<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<B>,
    ) -> Result<T, GatewayError> {
        let url = self.url(path);
        trace!("⚡️ Sending LND REST query: {method} {url}");
        let mut req = self.client.request(method, url).timeout(self.timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let response = req.send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        if status.is_success() {
            trace!("⚡️ LND REST query successful. {status}");
            response.json::<T>().await.map_err(|e| GatewayError::Decode(e.to_string()))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(status_error(status, &message))
        }
    }

    fn request_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Unavailable(e.to_string())
        }
    }
}

impl LightningGateway for LndGateway {
    fn provider_name(&self) -> &str {
        self.provider_name.as_str()
    }

    async fn create_invoice(&self, amount: Sats, memo: &str) -> Result<CreatedInvoice, GatewayError> {
        let request = AddInvoiceRequest {
            value: amount.value().to_string(),
            memo: memo.to_string(),
            expiry: self.invoice_expiry_secs.to_string(),
        };
        let response = self.rest_query::<AddInvoiceResponse, _>(Method::POST, "/v1/invoices", Some(request)).await?;
        let payment_hash = base64_to_hex(&response.r_hash)?;
        debug!("⚡️ LND issued invoice {payment_hash} for {amount}");
        Ok(CreatedInvoice { payment_request: response.payment_request, payment_hash })
    }

    async fn decode_payment_request(&self, payment_request: &str) -> Result<DecodedPaymentRequest, GatewayError> {
        let url = self.url(&format!("/v1/payreq/{payment_request}"));
        trace!("⚡️ Decoding payment request via {url}");
        let response = self.client.get(url).timeout(self.timeout).send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("{status}: {}", lnd_error_message(&response.text().await.unwrap_or_default()));
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unavailable(message),
                // Any other answer from the node means the request could not be decoded
                _ => GatewayError::Rejected(message),
            });
        }
        let decoded = response.json::<PayReqResponse>().await.map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(DecodedPaymentRequest {
            payment_hash: decoded.payment_hash.to_ascii_lowercase(),
            amount: Sats::from(decoded.num_satoshis),
        })
    }

    async fn pay_invoice(&self, payment_request: &str) -> Result<PaidInvoice, GatewayError> {
        let request = SendPaymentRequest { payment_request: payment_request.to_string() };
        let response =
            self.rest_query::<SendPaymentResponse, _>(Method::POST, "/v1/channels/transactions", Some(request)).await?;
        if let Some(e) = response.payment_error.filter(|e| !e.is_empty()) {
            return Err(GatewayError::Rejected(e));
        }
        let payment_hash = response.payment_hash.as_deref().map(base64_to_hex).transpose()?.unwrap_or_default();
        let payment_preimage =
            response.payment_preimage.as_deref().map(base64_to_hex).transpose()?.unwrap_or_default();
        let route = response.payment_route.unwrap_or_default();
        let fee = Sats::from(route.total_fees);
        let amount = Sats::from(route.total_amt) - fee;
        Ok(PaidInvoice { payment_hash, payment_preimage, amount, fee })
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceUpdate, GatewayError> {
        let path = format!("/v1/invoice/{payment_hash}");
        let invoice = self.rest_query::<LndInvoice, ()>(Method::GET, &path, None).await?;
        InvoiceUpdate::try_from(invoice)
    }

    async fn subscribe_settlements(&self, settle_index: u64) -> Result<SettlementStream, GatewayError> {
        let url = self.url(&format!("/v1/invoices/subscribe?settle_index={settle_index}"));
        debug!("⚡️ Opening invoice subscription at {url}");
        let response = self.client.get(url).send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(status_error(status, &message));
        }
        info!("⚡️ Invoice subscription is open");
        let chunks = response.bytes_stream().boxed();
        let state = SubscriptionState { chunks, lines: LineDecoder::default(), pending: VecDeque::new(), done: false };
        let updates = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.chunks.next().await {
                    Some(Ok(chunk)) => {
                        for line in state.lines.push(&chunk) {
                            if let Some(item) = decode_subscription_line(&line) {
                                state.pending.push_back(item);
                            }
                        }
                    },
                    Some(Err(e)) => {
                        state.pending.push_back(Err(GatewayError::StreamDisconnected(e.to_string())));
                        state.done = true;
                    },
                    None => {
                        if let Some(item) = state.lines.finish().as_deref().and_then(decode_subscription_line) {
                            state.pending.push_back(item);
                        }
                        state.done = true;
                    },
                }
            }
        });
        Ok(updates.boxed())
    }
}

struct SubscriptionState {
    chunks: stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    lines: LineDecoder,
    pending: VecDeque<Result<InvoiceUpdate, GatewayError>>,
    done: bool,
}

fn status_error(status: StatusCode, message: &str) -> GatewayError {
    let message = format!("{status}: {}", lnd_error_message(message));
    if status.is_server_error() {
        GatewayError::Unavailable(message)
    } else {
        GatewayError::Rejected(message)
    }
}

/// LND reports errors as `{"code": 2, "message": "..."}`. Fall back to the raw body for anything else.
fn lnd_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| body.trim().to_string())
}

pub fn base64_to_hex(value: &str) -> Result<String, GatewayError> {
    base64::decode(value)
        .or_else(|_| base64::decode_config(value, base64::URL_SAFE))
        .map(hex::encode)
        .map_err(|e| GatewayError::Decode(format!("{value} is not valid base64. {e}")))
}

//--------------------------------------------   Subscription decoding  ------------------------------------------------

/// Splits a byte stream into lines. Partial lines are held back until the rest arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left over once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Decodes one line of the subscription. Returns `None` for frames that carry no invoice.
pub fn decode_subscription_line(line: &str) -> Option<Result<InvoiceUpdate, GatewayError>> {
    let frame = match serde_json::from_str::<SubscriptionFrame>(line) {
        Ok(f) => f,
        Err(e) => return Some(Err(GatewayError::Decode(format!("{e}. Line: {line}")))),
    };
    if let Some(error) = frame.error {
        let message = error["message"].as_str().map(|s| s.to_string()).unwrap_or_else(|| error.to_string());
        return Some(Err(GatewayError::StreamDisconnected(message)));
    }
    frame.result.map(InvoiceUpdate::try_from)
}

#[derive(Debug, Deserialize)]
struct SubscriptionFrame {
    result: Option<LndInvoice>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LndInvoice {
    r_hash: String,
    #[serde(default)]
    r_preimage: Option<String>,
    #[serde(default)]
    settled: bool,
    #[serde(default)]
    memo: Option<String>,
    #[serde(default, deserialize_with = "number_from_string")]
    amt_paid_sat: i64,
    #[serde(default = "open_state")]
    state: InvoiceState,
    #[serde(default, deserialize_with = "number_from_string")]
    settle_index: u64,
}

fn open_state() -> InvoiceState {
    InvoiceState::Open
}

/// 64-bit integer fields are sent as strings by the REST gateway, but tolerate plain numbers too.
fn number_from_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Default + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber<T> {
        String(String),
        Number(T),
    }
    match StringOrNumber::<T>::deserialize(deserializer)? {
        StringOrNumber::String(s) if s.is_empty() => Ok(T::default()),
        StringOrNumber::String(s) => s.parse::<T>().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

impl TryFrom<LndInvoice> for InvoiceUpdate {
    type Error = GatewayError;

    fn try_from(invoice: LndInvoice) -> Result<Self, Self::Error> {
        let payment_hash = base64_to_hex(&invoice.r_hash)?;
        let preimage = invoice.r_preimage.as_deref().filter(|s| !s.is_empty()).map(base64_to_hex).transpose()?;
        Ok(InvoiceUpdate {
            payment_hash,
            preimage,
            settled: invoice.settled,
            amount_paid: Sats::from(invoice.amt_paid_sat),
            memo: invoice.memo.filter(|m| !m.is_empty()),
            state: invoice.state,
            settle_index: invoice.settle_index,
        })
    }
}

#[derive(Debug, Serialize)]
struct AddInvoiceRequest {
    value: String,
    memo: String,
    expiry: String,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    r_hash: String,
    payment_request: String,
}

#[derive(Debug, Serialize)]
struct SendPaymentRequest {
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct SendPaymentResponse {
    #[serde(default)]
    payment_error: Option<String>,
    #[serde(default)]
    payment_preimage: Option<String>,
    #[serde(default)]
    payment_hash: Option<String>,
    #[serde(default)]
    payment_route: Option<LndRoute>,
}

#[derive(Debug, Default, Deserialize)]
struct LndRoute {
    #[serde(default, deserialize_with = "number_from_string")]
    total_amt: i64,
    #[serde(default, deserialize_with = "number_from_string")]
    total_fees: i64,
}

#[derive(Debug, Deserialize)]
struct PayReqResponse {
    payment_hash: String,
    #[serde(default, deserialize_with = "number_from_string")]
    num_satoshis: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    // base64 of 32 bytes 0x00..0x1f
    const R_HASH_B64: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";
    const R_HASH_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn hashes_are_converted_to_hex() {
        assert_eq!(base64_to_hex(R_HASH_B64).unwrap(), R_HASH_HEX);
        assert_eq!(base64_to_hex("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8").unwrap(), R_HASH_HEX);
        assert!(matches!(base64_to_hex("not base64!"), Err(GatewayError::Decode(_))));
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"{\"result\":").is_empty());
        let lines = decoder.push(b" {}}\n\n{\"a\"");
        assert_eq!(lines, vec!["{\"result\": {}}".to_string()]);
        assert_eq!(decoder.push(b":1}\n"), vec!["{\"a\":1}".to_string()]);
        assert!(decoder.finish().is_none());
        decoder.push(b"{\"tail\":true}");
        assert_eq!(decoder.finish().as_deref(), Some("{\"tail\":true}"));
    }

    #[test]
    fn settled_invoice_frame() {
        let line = format!(
            r#"{{"result":{{"memo":"Boots [order 42]","r_hash":"{R_HASH_B64}","r_preimage":"{R_HASH_B64}","value":"50000","settled":true,"amt_paid_sat":"50000","state":"SETTLED","settle_index":"17"}}}}"#
        );
        let update = decode_subscription_line(&line).unwrap().unwrap();
        assert_eq!(update.payment_hash, R_HASH_HEX);
        assert_eq!(update.preimage.as_deref(), Some(R_HASH_HEX));
        assert!(update.is_settled());
        assert_eq!(update.amount_paid, Sats::from(50_000));
        assert_eq!(update.memo.as_deref(), Some("Boots [order 42]"));
        assert_eq!(update.settle_index, 17);
    }

    #[test]
    fn open_invoice_frame_without_optional_fields() {
        let line = format!(r#"{{"result":{{"r_hash":"{R_HASH_B64}","amt_paid_sat":0}}}}"#);
        let update = decode_subscription_line(&line).unwrap().unwrap();
        assert_eq!(update.state, InvoiceState::Open);
        assert!(!update.is_settled());
        assert!(update.preimage.is_none());
        assert_eq!(update.settle_index, 0);
    }

    #[test]
    fn canceled_invoice_frame() {
        let line = format!(r#"{{"result":{{"r_hash":"{R_HASH_B64}","r_preimage":"","state":"CANCELED"}}}}"#);
        let update = decode_subscription_line(&line).unwrap().unwrap();
        assert!(update.is_canceled());
        assert!(update.preimage.is_none());
    }

    #[test]
    fn error_and_junk_frames() {
        let err = decode_subscription_line(r#"{"error":{"code":14,"message":"transport is closing"}}"#).unwrap();
        assert_eq!(err, Err(GatewayError::StreamDisconnected("transport is closing".into())));
        let err = decode_subscription_line("<html>").unwrap();
        assert!(matches!(err, Err(GatewayError::Decode(_))));
        assert!(decode_subscription_line("{}").is_none());
    }

    #[test]
    fn error_bodies() {
        let e = status_error(StatusCode::BAD_REQUEST, r#"{"code":2,"message":"invoice expired"}"#);
        assert_eq!(e, GatewayError::Rejected("400 Bad Request: invoice expired".into()));
        let e = status_error(StatusCode::SERVICE_UNAVAILABLE, "starting up\n");
        assert_eq!(e, GatewayError::Unavailable("503 Service Unavailable: starting up".into()));
    }
}
