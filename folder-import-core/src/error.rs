use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid response payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

impl ApiError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            ApiError::Api { status, .. } => classify_api_status(*status),
            ApiError::Request(err) if err.is_timeout() || err.is_connect() => {
                ApiErrorClass::Transient
            }
            ApiError::Request(err) => match err.status() {
                Some(status) => classify_api_status(status),
                // Body/stream interruptions surface without a status.
                None if err.is_body() || err.is_request() => ApiErrorClass::Transient,
                None => ApiErrorClass::Permanent,
            },
            ApiError::Url(_) | ApiError::Payload(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == ApiErrorClass::NotFound
    }
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

pub(crate) async fn error_for_response(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ApiError::Api { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            let err = ApiError::Api {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = ApiError::Api {
            status: StatusCode::BAD_REQUEST,
            body: "bad".into(),
        };
        assert_eq!(err.classification(), ApiErrorClass::Permanent);
        assert!(!err.is_retryable());

        let err = ApiError::Api {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }
}
