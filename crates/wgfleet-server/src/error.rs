use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use crate::db::StoreError;
use crate::db::user::UserStoreError;
use crate::service::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("username already taken")]
    DuplicateUsername,

    #[error("user still owns groups")]
    UserOwnsGroups,

    #[error("interface name already taken")]
    DuplicateInterfaceName,

    #[error("listen port already taken")]
    DuplicateListenPort,

    #[error("address already assigned")]
    DuplicateAddress,

    #[error("no free addresses left in the group's range")]
    RangeExhausted,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("interface is not running")]
    InterfaceNotRunning,

    #[error("wireguard tooling failed: {0}")]
    WgFailure(String),

    #[error("internal server error")]
    Internal,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DuplicateUsername
            | Self::UserOwnsGroups
            | Self::DuplicateInterfaceName
            | Self::DuplicateListenPort
            | Self::DuplicateAddress => StatusCode::CONFLICT,
            Self::RangeExhausted | Self::Validation(_) | Self::InterfaceNotRunning => {
                StatusCode::BAD_REQUEST
            }
            Self::WgFailure(_) => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<UserStoreError> for ApiError {
    fn from(err: UserStoreError) -> Self {
        match err {
            UserStoreError::InvalidCredentials => Self::InvalidCredentials,
            UserStoreError::UsernameTaken => Self::DuplicateUsername,
            UserStoreError::OwnsGroups => Self::UserOwnsGroups,
            UserStoreError::PasswordHash | UserStoreError::Database(_) => {
                tracing::error!(error = %err, "user store error");
                Self::Internal
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InterfaceNameTaken => Self::DuplicateInterfaceName,
            StoreError::ListenPortTaken => Self::DuplicateListenPort,
            StoreError::AddressTaken => Self::DuplicateAddress,
            StoreError::Database(_) => {
                tracing::error!(error = %err, "store error");
                Self::Internal
            }
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        use crate::wg::WgError;
        match err {
            ServiceError::Store(e) => e.into(),
            ServiceError::Wg(WgError::NotRunning) => Self::InterfaceNotRunning,
            ServiceError::Wg(e) => {
                tracing::error!(error = %e, "wireguard tooling error");
                Self::WgFailure(e.to_string())
            }
            ServiceError::AllocationExhausted => Self::RangeExhausted,
            ServiceError::InvalidRange(msg) => Self::Validation(msg),
            ServiceError::GroupNotFound | ServiceError::ClientNotFound => Self::NotFound,
        }
    }
}
