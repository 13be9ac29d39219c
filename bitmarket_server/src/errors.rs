use actix_web::{
    error::ResponseError,
    http::{header::ContentType, StatusCode},
    HttpResponse,
};
use bitmarket_engine::{CheckoutError, InvoiceApiError, LedgerError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Could not initialize server. {0}")]
    InitializeError(String),
    #[error("An error occurred on the backend of the server. {0}")]
    BackendError(String),
    #[error("Could not read request body: {0}")]
    InvalidRequestBody(String),
    #[error("Could not read request path: {0}")]
    InvalidRequestPath(String),
    #[error("An I/O error happened in the server. {0}")]
    IOError(#[from] std::io::Error),
    #[error("Invalid server configuration. {0}")]
    ConfigurationError(String),
    #[error("UnspecifiedError. {0}")]
    Unspecified(String),
    #[error("The data was not found. {0}")]
    NoRecordFound(String),
    #[error("Invoice error. {0}")]
    InvoiceError(#[from] InvoiceApiError),
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequestBody(_) => StatusCode::BAD_REQUEST,
            Self::InvalidRequestPath(_) => StatusCode::BAD_REQUEST,
            Self::InitializeError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BackendError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IOError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unspecified(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoRecordFound(_) => StatusCode::NOT_FOUND,
            Self::InvoiceError(e) => match e {
                InvoiceApiError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
                InvoiceApiError::MissingReference => StatusCode::BAD_REQUEST,
                InvoiceApiError::InvalidPaymentRequest(_) => StatusCode::BAD_REQUEST,
                InvoiceApiError::OrderNotFound(_) => StatusCode::NOT_FOUND,
                InvoiceApiError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                InvoiceApiError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
                InvoiceApiError::GatewayRejected(_) => StatusCode::BAD_GATEWAY,
                InvoiceApiError::PersistenceFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                InvoiceApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .body(serde_json::json!({ "error": self.to_string() }).to_string())
    }
}

impl From<LedgerError> for ServerError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::PaymentNotFound(_) | LedgerError::OrderNotFound(_) => Self::NoRecordFound(e.to_string()),
            e => Self::BackendError(e.to_string()),
        }
    }
}

impl From<CheckoutError> for ServerError {
    fn from(e: CheckoutError) -> Self {
        match e {
            CheckoutError::OrderNotFound(_) => Self::NoRecordFound(e.to_string()),
            CheckoutError::InvalidOrder(s) => Self::InvalidRequestBody(s),
            CheckoutError::DatabaseError(s) => Self::BackendError(s),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invoice_errors_map_to_status_codes() {
        let cases = [
            (InvoiceApiError::InvalidAmount(0), StatusCode::BAD_REQUEST),
            (InvoiceApiError::MissingReference, StatusCode::BAD_REQUEST),
            (InvoiceApiError::InvalidPaymentRequest("lnbc".into()), StatusCode::BAD_REQUEST),
            (InvoiceApiError::OrderNotFound(7), StatusCode::NOT_FOUND),
            (InvoiceApiError::GatewayUnavailable("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (InvoiceApiError::GatewayTimeout, StatusCode::GATEWAY_TIMEOUT),
            (InvoiceApiError::GatewayRejected("no route".into()), StatusCode::BAD_GATEWAY),
        ];
        for (e, status) in cases {
            assert_eq!(ServerError::from(e).status_code(), status);
        }
    }

    #[test]
    fn ledger_errors() {
        let e = ServerError::from(LedgerError::PaymentNotFound("abc".into()));
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
        let e = ServerError::from(LedgerError::DatabaseError("locked".into()));
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn checkout_errors() {
        let e = ServerError::from(CheckoutError::InvalidOrder("The order total is too large".into()));
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
        let e = ServerError::from(CheckoutError::OrderNotFound(3));
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
    }
}
