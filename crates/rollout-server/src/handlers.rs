use std::collections::HashMap;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::debug;

use rollout_core::Record;
use rollout_store::{LogError, QueryOptions};

use crate::error::ApiError;
use crate::server::AppState;

/// Shortest accepted image tag.
pub const MIN_TAG_LEN: usize = 20;

/// `POST /deploy` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub service_handle: String,
    pub docker_image_tag: String,
}

impl DeployRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        let len = self.docker_image_tag.chars().count();
        if len < MIN_TAG_LEN {
            return Err(ApiError::BadRequest(format!(
                "dockerImageTag must be at least {MIN_TAG_LEN} characters, got {len}"
            )));
        }
        Ok(())
    }
}

/// GET /events
pub async fn list_events(
    State(state): State<AppState>,
    params: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Result<Json<Vec<Record>>, ApiError> {
    let Query(params) = params?;
    let opts = QueryOptions::from_params(&params).map_err(LogError::from)?;

    let log = state.log.clone();
    let records = tokio::task::spawn_blocking(move || {
        log.query(&opts)?.collect::<Result<Vec<_>, LogError>>()
    })
    .await
    .map_err(|e| ApiError::Storage(format!("query task failed: {e}")))??;

    Ok(Json(records))
}

/// POST /deploy
pub async fn deploy(
    State(state): State<AppState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;
    request.validate()?;

    let controller = state.controller.clone();
    let id = tokio::task::spawn_blocking(move || {
        controller.trigger(&request.service_handle, &request.docker_image_tag)
    })
    .await
    .map_err(|e| ApiError::Internal {
        message: format!("trigger task failed: {e}"),
        stack: String::new(),
    })??;

    debug!(%id, "deployment accepted");
    Ok(StatusCode::ACCEPTED)
}
