//! Defines routes for skin downloads.
//!
//! - `GET /healthz`: liveness
//! - `GET /readyz`: readiness (database + compiled directory)
//! - `GET /skins/bundle`: every skin in one cached archive
//! - `GET /skins/{id}/download`: one skin's archive
//!
//! Authorization happens in front of this service; every route here assumes
//! a pre-authorized caller.

use crate::{
    handlers::{
        download_handlers::{download_bundle, download_skin},
        health_handlers::{healthz, readyz},
    },
    services::depot_service::DepotService,
};
use axum::{Router, routing::get};

/// Build the router; handlers share the `DepotService` state.
pub fn routes() -> Router<DepotService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/skins/bundle", get(download_bundle))
        .route("/skins/{id}/download", get(download_skin))
}
