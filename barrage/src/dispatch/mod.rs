//! Dispatch strategies.
//!
//! Every dispatcher consumes request files and produces response files of the
//! same shape: one terminal [`GenericResponse`] line per row.

use chrono::{DateTime, Utc};

use crate::backend::BackendResponse;
use crate::request::{GenericRequest, GenericResponse};

pub mod batch;
pub mod offline;
pub mod online;

pub use batch::BatchDispatcher;
pub use offline::OfflineDispatcher;
pub use online::OnlineDispatcher;

/// Terminal success line for a request.
pub(crate) fn success_response(
    generic_request: GenericRequest,
    response: BackendResponse,
    created_at: DateTime<Utc>,
) -> GenericResponse {
    GenericResponse {
        generic_request,
        response_message: response.message,
        response_errors: None,
        raw_response: response.raw,
        finish_reason: response.finish_reason,
        token_usage: response.usage,
        created_at,
        finished_at: Utc::now(),
    }
}
