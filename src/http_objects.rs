use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};
use utoipa::ToSchema;

use crate::{config::PoolSpec, dispatcher::DispatchError, pool::MinIdlePolicy};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal_error(message: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_gateway(message: &str) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn gateway_timeout(message: &str) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!(status = %self.status_code, message = %self.message, "API error");
        } else {
            warn!(status = %self.status_code, message = %self.message, "API error");
        }
        (
            self.status_code,
            Json(json!({"status": "error", "message": self.message})),
        )
            .into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match &e {
            DispatchError::UnknownFunction(_) => Self::not_found("unknown function"),
            DispatchError::ProvisionFailure { .. } => Self::internal_error(&e.to_string()),
            DispatchError::InitFailure { .. } |
            DispatchError::UpstreamConnection(_) |
            DispatchError::UpstreamHttp { .. } => Self::bad_gateway(&e.to_string()),
            DispatchError::UpstreamTimeout(_) => Self::gateway_timeout(&e.to_string()),
        }
    }
}

/// Accepts a JSON number or a string holding one, like `"15"`.
fn lenient_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString<T> {
        Number(T),
        String(String),
    }

    match Option::<NumberOrString<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid number {:?}: {}", s, e))),
    }
}

/// Body of `POST /create_manager`. Unset fields fall back to the configured
/// pool defaults.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateManagerRequest {
    pub function_name: Option<String>,
    pub image_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub container_port: Option<u16>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub host_port_start: Option<u16>,
    /// Seconds a container may stay idle before it is reaped.
    #[serde(default, deserialize_with = "lenient_number")]
    pub idle_timeout: Option<u64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub min_idle_containers: Option<usize>,
    pub min_idle_policy: Option<MinIdlePolicy>,
}

impl CreateManagerRequest {
    /// `None` when no function name was given.
    pub fn into_pool_spec(self) -> Option<PoolSpec> {
        let function_name = self.function_name.filter(|name| !name.is_empty())?;
        Some(PoolSpec {
            function_name,
            image_name: self.image_name,
            container_port: self.container_port,
            host_port_start: self.host_port_start,
            idle_timeout: self.idle_timeout,
            min_idle_containers: self.min_idle_containers,
            min_idle_policy: self.min_idle_policy,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateManagerResponse {
    /// `created` or `exists`.
    pub status: String,
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DispatchWorkflowRequest {
    pub workflow_name: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AcceptedResponse {
    pub status: String,
    pub workflow_id: String,
}
