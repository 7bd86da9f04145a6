//! REST API handlers

use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tcc_core::enrich::EnrichedRun;
use tcc_core::store::{Failure, TraceStore};

#[derive(Serialize)]
pub struct RunsResponse {
    pub runs: Vec<EnrichedRun>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct FailuresResponse {
    pub failures: Vec<Failure>,
    pub total: usize,
}

pub async fn get_store(State(state): State<Arc<AppState>>) -> Json<TraceStore> {
    Json(state.exporter.snapshot())
}

pub async fn get_runs(State(state): State<Arc<AppState>>) -> Json<RunsResponse> {
    let runs = state.exporter.snapshot().enriched_runs();
    Json(RunsResponse {
        total: runs.len(),
        runs,
    })
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<EnrichedRun>, StatusCode> {
    state
        .exporter
        .snapshot()
        .enriched_run(&trace_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn get_failures(State(state): State<Arc<AppState>>) -> Json<FailuresResponse> {
    let failures = state.exporter.snapshot().failures();
    Json(FailuresResponse {
        total: failures.len(),
        failures,
    })
}
