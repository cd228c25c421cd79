//! Status API route handlers.
//!
//! All endpoints return JSON. The engine handle is cloned into each request.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::engine::{Engine, EngineStatus};
use crate::types::{AssetId, PartnerId, ProposalId};

pub type AppState = Engine;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct QueueResponse {
    pub processing: bool,
    pub queued: Vec<ProposalId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResponse {
    pub asset_id: AssetId,
    pub in_trade: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartnerResponse {
    pub partner: PartnerId,
    pub offer_id: Option<ProposalId>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/status
pub async fn get_status(State(engine): State<AppState>) -> Json<EngineStatus> {
    Json(engine.status())
}

/// GET /api/queue
pub async fn get_queue(State(engine): State<AppState>) -> Json<QueueResponse> {
    Json(QueueResponse {
        processing: engine.status().processing,
        queued: engine.queue_snapshot(),
    })
}

/// GET /api/items/:asset_id
pub async fn get_item(
    State(engine): State<AppState>,
    Path(asset_id): Path<String>,
) -> Json<ItemResponse> {
    let asset_id = AssetId::new(asset_id);
    Json(ItemResponse {
        in_trade: engine.is_item_in_trade(&asset_id),
        asset_id,
    })
}

/// GET /api/partners/:partner_id/active
pub async fn get_partner_active(
    State(engine): State<AppState>,
    Path(partner_id): Path<String>,
) -> Json<PartnerResponse> {
    let partner = PartnerId::new(partner_id);
    Json(PartnerResponse {
        offer_id: engine.active_proposal_with(&partner),
        partner,
    })
}
