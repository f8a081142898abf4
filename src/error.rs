use crate::import::error::ImportError;
use okapi::openapi3::{RefOr, Response as OpenApiResponse, Responses};
use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::response::OpenApiResponderInner;
use serde::Serialize;
use serde_json::{Value, json};
use std::io::Cursor;

#[derive(Debug)]
pub enum ApiError {
    Import(ImportError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ApiError {
    fn parts(self) -> (Status, &'static str, String, Option<Value>) {
        let ApiError::Import(err) = self;
        let message = err.to_string();

        match err {
            ImportError::ValidationError(domains) => (
                Status::UnprocessableEntity,
                "ValidationError",
                message,
                serde_json::to_value(domains).ok(),
            ),
            ImportError::UnknownOptions(options) => (
                Status::UnprocessableEntity,
                "UnknownOptions",
                message,
                serde_json::to_value(options).ok(),
            ),
            ImportError::MissingParams(domains) => (
                Status::UnprocessableEntity,
                "MissingParams",
                message,
                serde_json::to_value(domains).ok(),
            ),
            ImportError::Timeout => (Status::GatewayTimeout, "Timeout", message, None),
            ImportError::TransactionFailure {
                stage_index,
                stage,
                partial,
                cause,
            } => (
                Status::InternalServerError,
                "TransactionFailure",
                message,
                Some(json!({
                    "stage_index": stage_index,
                    "stage": stage,
                    "partial": partial,
                    "cause": cause.to_string(),
                })),
            ),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let (status, error_type, message, details) = self.parts();

        if status.code >= 500 {
            log::error!("{}: {}", error_type, message);
        } else {
            log::debug!("{}: {}", error_type, message);
        }

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
            details,
        };

        let json = serde_json::to_string(&error_response)
            .unwrap_or_else(|_| r#"{"error":"SerializationError","message":"Failed to serialize error"}"#.to_string());

        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}

impl OpenApiResponderInner for ApiError {
    fn responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        let mut responses = Responses::default();
        for (code, description) in [
            ("422", "Request rejected by option checks or validation"),
            ("500", "A stage-group failed to commit"),
            ("504", "The store timed out or lost its connection"),
        ] {
            responses.responses.insert(
                code.to_string(),
                RefOr::Object(OpenApiResponse {
                    description: description.to_string(),
                    ..Default::default()
                }),
            );
        }
        Ok(responses)
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        ApiError::Import(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::domain::DomainKey;
    use crate::import::error::UnitFailure;
    use crate::import::result::ImportResult;

    #[test]
    fn maps_import_errors_to_statuses() {
        let (status, kind, _, details) =
            ApiError::from(ImportError::MissingParams(vec![DomainKey::Logs])).parts();
        assert_eq!(status, Status::UnprocessableEntity);
        assert_eq!(kind, "MissingParams");
        assert_eq!(details, Some(json!(["logs"])));

        let (status, kind, _, _) = ApiError::from(ImportError::Timeout).parts();
        assert_eq!(status, Status::GatewayTimeout);
        assert_eq!(kind, "Timeout");
    }

    #[test]
    fn transaction_failures_carry_partial_results() {
        let mut partial = ImportResult::default();
        partial.extend(DomainKey::Blocks, [json!(100)]);

        let (status, _, _, details) = ApiError::from(ImportError::TransactionFailure {
            stage_index: 1,
            stage: "main",
            partial,
            cause: UnitFailure::Panicked("boom".into()),
        })
        .parts();

        assert_eq!(status, Status::InternalServerError);
        let details = details.expect("details present");
        assert_eq!(details["stage_index"], json!(1));
        assert_eq!(details["partial"], json!({"blocks": [100]}));
    }
}
