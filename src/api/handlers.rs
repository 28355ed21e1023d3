use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, Uri},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::envelope::Envelope;
use crate::api::ApiState;
use crate::error::{FlowError, Result};
use crate::scheduler::{JobFilter, JobSubmission, PartyRef, StatusInfo};
use crate::storage::path_segment;

type ApiResult = Result<Json<Envelope>>;

/// Deserialize a JSON body, treating an empty body as the default value.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| FlowError::InvalidSpec(format!("invalid JSON body: {}", e)))
}

fn valid_job_id(value: &str) -> Result<&str> {
    path_segment("job_id", value)
}

fn party(role: String, party_id: &str) -> Result<PartyRef> {
    path_segment("role", &role)?;
    match party_id.parse::<u64>() {
        Ok(id) if id > 0 => Ok(PartyRef::new(role, id)),
        _ => Err(FlowError::InvalidSpec(format!(
            "party_id must be a positive integer, got '{}'",
            party_id
        ))),
    }
}

fn decode_model_id(model_id: &str) -> Result<String> {
    let bytes = URL_SAFE
        .decode(model_id)
        .or_else(|_| STANDARD.decode(model_id))
        .map_err(|e| FlowError::InvalidSpec(format!("model_id is not base64: {}", e)))?;
    let model_key = String::from_utf8(bytes)
        .map_err(|_| FlowError::InvalidSpec("model_id does not decode to UTF-8".into()))?;
    path_segment("model_key", &model_key)?;
    Ok(model_key)
}

#[derive(Debug, Default, Deserialize)]
pub struct JobIdRequest {
    #[serde(default)]
    job_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct KillRequest {
    #[serde(default)]
    job_initiator: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    job_id: Option<String>,
}

pub async fn submit_job(State(state): State<ApiState>, body: Bytes) -> ApiResult {
    let submission: JobSubmission = parse_body(&body)?;
    let submitted = state.controller.submit_job(submission).await?;
    Ok(Json(
        Envelope::with_data(json!({
            "job_id": submitted.job_id,
            "job_dsl_path": submitted.job_dsl_path,
            "job_runtime_conf_path": submitted.job_runtime_conf_path,
            "model_info": submitted.model_info,
        }))
        .job_id(submitted.job_id),
    ))
}

pub async fn stop_job(State(state): State<ApiState>, body: Bytes) -> ApiResult {
    let req: JobIdRequest = parse_body(&body)?;
    state.controller.stop_job(valid_job_id(&req.job_id)?).await?;
    Ok(Json(Envelope::success()))
}

pub async fn query_job(State(state): State<ApiState>, body: Bytes) -> ApiResult {
    let filter: JobFilter = parse_body(&body)?;
    let jobs = state.controller.query_jobs(&filter).await;
    if jobs.is_empty() {
        return Err(FlowError::NotFound("find job failed".into()));
    }
    Ok(Json(Envelope::with_data(serde_json::to_value(jobs)?)))
}

pub async fn job_config(State(state): State<ApiState>, body: Bytes) -> ApiResult {
    let filter: JobFilter = parse_body(&body)?;
    let config = state.controller.job_config(&filter).await?;
    Ok(Json(Envelope::with_data(serde_json::to_value(config)?)))
}

/// Accepts `job_id` from the query string or from a JSON body.
pub async fn job_log(
    State(state): State<ApiState>,
    Query(query): Query<LogQuery>,
    body: Bytes,
) -> Result<Response> {
    let job_id = match query.job_id {
        Some(id) => id,
        None => parse_body::<JobIdRequest>(&body)?.job_id,
    };
    valid_job_id(&job_id)?;
    let archive = state.controller.job_log(&job_id).await?;
    let headers = [
        (header::CONTENT_TYPE, "application/gzip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"job_{}_log.tar.gz\"", job_id),
        ),
    ];
    Ok((headers, archive).into_response())
}

pub async fn create_job(
    State(state): State<ApiState>,
    Path((job_id, role, party_id)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult {
    let info: StatusInfo = parse_body(&body)?;
    state
        .controller
        .update_job_status(valid_job_id(&job_id)?, party(role, &party_id)?, info, true)
        .await?;
    Ok(Json(Envelope::success()))
}

pub async fn job_status(
    State(state): State<ApiState>,
    Path((job_id, role, party_id)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult {
    let info: StatusInfo = parse_body(&body)?;
    state
        .controller
        .update_job_status(valid_job_id(&job_id)?, party(role, &party_id)?, info, false)
        .await?;
    Ok(Json(Envelope::success()))
}

pub async fn save_pipeline(
    State(state): State<ApiState>,
    Path((job_id, role, party_id, model_id)): Path<(String, String, String, String)>,
) -> ApiResult {
    let model_key = decode_model_id(&model_id)?;
    state
        .controller
        .save_pipeline(valid_job_id(&job_id)?, party(role, &party_id)?, &model_key)
        .await?;
    Ok(Json(Envelope::success()))
}

pub async fn kill_job(
    State(state): State<ApiState>,
    Path((job_id, role, party_id)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult {
    let req: KillRequest = parse_body(&body)?;
    let initiator = match req.job_initiator {
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(Value::Null) | None => None,
        Some(value) => Some(
            serde_json::from_value::<PartyRef>(value)
                .map_err(|e| FlowError::InvalidSpec(format!("job_initiator: {}", e)))?,
        ),
    };
    state
        .controller
        .kill_job(valid_job_id(&job_id)?, party(role, &party_id)?, initiator)
        .await?;
    Ok(Json(Envelope::success()))
}

pub async fn clean_job(
    State(state): State<ApiState>,
    Path((job_id, role, party_id)): Path<(String, String, String)>,
) -> ApiResult {
    state
        .controller
        .clean_job(valid_job_id(&job_id)?, party(role, &party_id)?)
        .await?;
    Ok(Json(Envelope::success()))
}

pub async fn run_task(
    State(state): State<ApiState>,
    Path((job_id, component_name, task_id, role, party_id)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    uri: Uri,
    body: Bytes,
) -> ApiResult {
    let mut info: StatusInfo = parse_body(&body)?;
    info.extra.insert(
        "request_url_without_host".into(),
        Value::String(uri.path().trim_start_matches('/').to_string()),
    );
    state
        .controller
        .start_task(
            valid_job_id(&job_id)?,
            path_segment("component_name", &component_name)?,
            path_segment("task_id", &task_id)?,
            party(role, &party_id)?,
            info,
        )
        .await?;
    Ok(Json(Envelope::success()))
}

pub async fn task_status(
    State(state): State<ApiState>,
    Path((job_id, component_name, task_id, role, party_id)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    body: Bytes,
) -> ApiResult {
    let info: StatusInfo = parse_body(&body)?;
    state
        .controller
        .update_task_status(
            valid_job_id(&job_id)?,
            path_segment("component_name", &component_name)?,
            path_segment("task_id", &task_id)?,
            party(role, &party_id)?,
            info,
        )
        .await?;
    Ok(Json(Envelope::success()))
}
