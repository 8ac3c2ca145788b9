//! JSON HTTP API over the zone controller and the program scheduler.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{ExecuteError, ProgramError, StoreError, ZoneError};
use crate::program::{Program, ProgramDraft};
use crate::scheduler::{RunStatus, Scheduler};
use crate::zones::{Origin, ZoneStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub enum ApiError {
    Zone(ZoneError),
    Program(ProgramError),
    Execute(ExecuteError),
    Store(StoreError),
}

impl From<ZoneError> for ApiError {
    fn from(err: ZoneError) -> Self {
        Self::Zone(err)
    }
}

impl From<ProgramError> for ApiError {
    fn from(err: ProgramError) -> Self {
        Self::Program(err)
    }
}

impl From<ExecuteError> for ApiError {
    fn from(err: ExecuteError) -> Self {
        Self::Execute(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Zone(ZoneError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Zone(ZoneError::InvalidDuration { .. }) => StatusCode::BAD_REQUEST,
            Self::Zone(ZoneError::ProgramOwnsSystem | ZoneError::CapacityExceeded { .. }) => {
                StatusCode::CONFLICT
            }
            Self::Zone(ZoneError::HardwareFault(_)) => StatusCode::INTERNAL_SERVER_ERROR,

            Self::Program(ProgramError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Program(ProgramError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Program(ProgramError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Program(ProgramError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,

            Self::Execute(ExecuteError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Execute(ExecuteError::InvalidSteps) => StatusCode::BAD_REQUEST,
            Self::Execute(ExecuteError::AlreadyRunning(_)) => StatusCode::CONFLICT,
            Self::Execute(ExecuteError::ZoneFault { .. } | ExecuteError::Storage(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Zone(e) => e.to_string(),
            Self::Program(e) => e.to_string(),
            Self::Execute(e) => e.to_string(),
            Self::Store(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            error!(status = status.as_u16(), "request failed: {message}");
        }
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(scheduler: Scheduler) -> Router {
    Router::new()
        .route("/api/zones", get(list_zones))
        .route("/api/zones/{id}/start", post(start_zone))
        .route("/api/zones/{id}/stop", post(stop_zone))
        .route("/api/programs", get(list_programs).post(create_program))
        .route("/api/programs/{id}", put(update_program).delete(delete_program))
        .route("/api/programs/{id}/automation", post(set_automation))
        .route("/api/programs/{id}/start", post(start_program))
        .route("/api/program/stop", post(stop_program))
        .route("/api/program/state", get(program_state))
        .with_state(scheduler)
}

#[derive(Deserialize)]
struct StartZoneRequest {
    minutes: u32,
}

#[derive(Deserialize)]
struct AutomationRequest {
    enabled: bool,
}

#[derive(Serialize)]
struct StopResponse {
    stopped: bool,
}

async fn list_zones(State(scheduler): State<Scheduler>) -> Json<Vec<ZoneStatus>> {
    Json(scheduler.zones().status())
}

async fn start_zone(
    State(scheduler): State<Scheduler>,
    Path(id): Path<u8>,
    Json(req): Json<StartZoneRequest>,
) -> Result<StatusCode, ApiError> {
    scheduler.zones().start(id, req.minutes, Origin::Manual)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_zone(
    State(scheduler): State<Scheduler>,
    Path(id): Path<u8>,
) -> Result<StatusCode, ApiError> {
    scheduler.zones().stop(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_programs(State(scheduler): State<Scheduler>) -> Result<Json<Vec<Program>>, ApiError> {
    Ok(Json(scheduler.list_programs()?))
}

async fn create_program(
    State(scheduler): State<Scheduler>,
    Json(draft): Json<ProgramDraft>,
) -> Result<(StatusCode, Json<Program>), ApiError> {
    let program = scheduler.create_program(draft)?;
    Ok((StatusCode::CREATED, Json(program)))
}

async fn update_program(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
    Json(draft): Json<ProgramDraft>,
) -> Result<Json<Program>, ApiError> {
    Ok(Json(scheduler.update_program(&id, draft).await?))
}

async fn delete_program(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    scheduler.delete_program(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_automation(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
    Json(req): Json<AutomationRequest>,
) -> Result<Json<Program>, ApiError> {
    Ok(Json(scheduler.toggle_program_automation(&id, req.enabled)?))
}

async fn start_program(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    scheduler.start_program(&id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_program(State(scheduler): State<Scheduler>) -> Json<StopResponse> {
    let stopped = scheduler.stop_current().await;
    Json(StopResponse { stopped })
}

async fn program_state(State(scheduler): State<Scheduler>) -> Json<RunStatus> {
    Json(scheduler.get_run_state())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(scheduler: Scheduler, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http api listening");
    axum::serve(listener, router(scheduler)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MockBoard;
    use crate::programs::{ProgramStore, StepRules};
    use crate::run_state::{RunState, RunStateStore};
    use crate::scheduler::SchedulerSettings;
    use crate::zones::{ZoneConfig, ZoneController, ZoneLimits};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Rig {
        _dir: TempDir,
        board: MockBoard,
        run_state: Arc<RunStateStore>,
        scheduler: Scheduler,
    }

    fn rig() -> Rig {
        let dir = TempDir::new().unwrap();
        let board = MockBoard::new();
        let run_state = Arc::new(RunStateStore::open(dir.path()));
        let zones = ZoneController::new(
            board.clone(),
            ZoneLimits {
                max_active_zones: 1,
                max_zone_duration_min: 60,
            },
            Arc::clone(&run_state),
        );
        zones.initialize(
            &[
                ZoneConfig {
                    id: 0,
                    pin: 14,
                    name: "Garden".into(),
                    visible: true,
                },
                ZoneConfig {
                    id: 1,
                    pin: 15,
                    name: "Terrace".into(),
                    visible: true,
                },
            ],
            Some(13),
        );
        let programs = ProgramStore::open(
            dir.path(),
            StepRules {
                zone_ids: BTreeSet::from([0, 1]),
                max_duration_min: 60,
            },
        );
        let scheduler = Scheduler::new(
            zones,
            Arc::clone(&run_state),
            programs,
            SchedulerSettings::default(),
        );
        Rig {
            _dir: dir,
            board,
            run_state,
            scheduler,
        }
    }

    async fn call(
        rig: &Rig,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(rig.scheduler.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn lawn() -> serde_json::Value {
        serde_json::json!({
            "name": "Lawn",
            "steps": [{"zone_id": 0, "duration_min": 10}],
            "months": [6, 7],
            "activation_time": "06:00",
            "recurrence": "daily"
        })
    }

    // -- zones --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn zone_start_stop_and_status() {
        let rig = rig();
        let five = Some(serde_json::json!({"minutes": 5}));
        let (status, _) = call(&rig, "POST", "/api/zones/0/start", five).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(rig.board.is_on(14));

        let (status, zones) = call(&rig, "GET", "/api/zones", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(zones[0]["active"], true);
        assert_eq!(zones[0]["remaining_seconds"], 300);
        assert_eq!(zones[1]["active"], false);

        let (status, _) = call(&rig, "POST", "/api/zones/0/stop", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(rig.board.energized_pins().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zone_errors_map_to_status_codes() {
        let rig = rig();
        let five = Some(serde_json::json!({"minutes": 5}));

        let (status, body) = call(&rig, "POST", "/api/zones/9/start", five.clone()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "zone 9 not found");

        let zero = Some(serde_json::json!({"minutes": 0}));
        let (status, _) = call(&rig, "POST", "/api/zones/0/start", zero).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        call(&rig, "POST", "/api/zones/0/start", five.clone()).await;
        let (status, _) = call(&rig, "POST", "/api/zones/1/start", five.clone()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        rig.run_state.save(&RunState::running("1")).unwrap();
        let (status, body) = call(&rig, "POST", "/api/zones/0/start", five).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("program is running"));
    }

    // -- programs -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn program_crud_round() {
        let rig = rig();

        let (status, created) = call(&rig, "POST", "/api/programs", Some(lawn())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], "1");
        assert_eq!(created["automation_enabled"], true);

        let mut edited = lawn();
        edited["activation_time"] = "07:30".into();
        let (status, updated) = call(&rig, "PUT", "/api/programs/1", Some(edited)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["activation_time"], "07:30");

        let (status, toggled) = call(
            &rig,
            "POST",
            "/api/programs/1/automation",
            Some(serde_json::json!({"enabled": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(toggled["automation_enabled"], false);

        let (_, list) = call(&rig, "GET", "/api/programs", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = call(&rig, "DELETE", "/api/programs/1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&rig, "DELETE", "/api/programs/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn program_validation_and_conflicts() {
        let rig = rig();
        call(&rig, "POST", "/api/programs", Some(lawn())).await;

        let mut clash = lawn();
        clash["name"] = "Beds".into();
        clash["recurrence"] = "every-other-day".into();
        let (status, body) = call(&rig, "POST", "/api/programs", Some(clash)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("Lawn"));

        let mut long = lawn();
        long["name"] = "a name far too long".into();
        let (status, _) = call(&rig, "POST", "/api/programs", Some(long)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // -- execution ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn program_start_state_and_stop() {
        let rig = rig();
        call(&rig, "POST", "/api/programs", Some(lawn())).await;

        let (status, _) = call(&rig, "POST", "/api/programs/1/start", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let (_, state) = call(&rig, "GET", "/api/program/state", None).await;
        assert_eq!(state["program_running"], true);
        assert_eq!(state["current_program_id"], "1");
        assert_eq!(state["active_zone"]["id"], 0);

        let (status, _) = call(&rig, "POST", "/api/programs/1/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, stopped) = call(&rig, "POST", "/api/program/stop", None).await;
        assert_eq!(stopped["stopped"], true);
        assert!(rig.board.energized_pins().is_empty());

        let (_, state) = call(&rig, "GET", "/api/program/state", None).await;
        assert_eq!(state["program_running"], false);
        assert!(state["active_zone"].is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn starting_unknown_program_is_not_found() {
        let rig = rig();
        let (status, _) = call(&rig, "POST", "/api/programs/5/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
