use thiserror::Error;

/// Unified error type for the Portico data plane.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Invalid credentials: {0}")]
    AuthInvalid(String),

    #[error("Forbidden: {0}")]
    AuthForbidden(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Circuit open for target: {0}")]
    CircuitOpen(String),

    #[error("No healthy target in upstream: {0}")]
    NoHealthyTarget(String),

    #[error("Upstream not found: {0}")]
    UpstreamNotFound(String),

    #[error("Upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("Upstream read timed out: {0}")]
    UpstreamReadTimeout(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("Client disconnected")]
    ClientDisconnect,

    #[error("Filter error: {0}")]
    FilterError(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to the HTTP status code the client sees.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::RouteNotFound(_) => 404,
            GatewayError::AuthRequired(_) => 401,
            GatewayError::AuthInvalid(_) => 401,
            GatewayError::AuthForbidden(_) => 403,
            GatewayError::RateLimited => 429,
            GatewayError::CircuitOpen(_) => 503,
            GatewayError::NoHealthyTarget(_) => 503,
            GatewayError::UpstreamNotFound(_) => 502,
            GatewayError::UpstreamConnect(_) => 502,
            GatewayError::UpstreamReadTimeout(_) => 504,
            GatewayError::UpstreamProtocol(_) => 502,
            GatewayError::FilterError(_) => 500,
            _ => 500,
        }
    }

    /// JSON error body.
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        let msg = self.to_string().replace('"', "'");
        format!(r#"{{"error":"{}","status":{}}}"#, msg, status).into_bytes()
    }
}
