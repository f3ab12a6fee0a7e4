//! `GET /admin/security/events` - recent entries from the security event buffer.

use axum::Json;
use axum::extract::{Query, State};
use tracing::instrument;

use crate::models::{SecurityEventsQuery, SecurityEventsResponse};
use crate::state::AppState;

/// Upper bound on `limit`, independent of the buffer capacity.
const MAX_EVENTS_LIMIT: usize = 1000;

/// Most recent security events, newest first, plus per-type counts over the
/// whole buffer.
///
/// # Query Parameters
///
/// - `limit`: number of events (default 100, max 1000)
#[instrument(skip(state))]
pub async fn list_security_events(
    State(state): State<AppState>,
    Query(query): Query<SecurityEventsQuery>,
) -> Json<SecurityEventsResponse> {
    let sink = &state.security_events;
    Json(SecurityEventsResponse {
        events: sink.recent(query.limit.min(MAX_EVENTS_LIMIT)),
        counts: sink.counts_by_type(),
        buffered: sink.len(),
    })
}
