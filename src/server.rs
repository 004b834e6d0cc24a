use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::Filter;

use crate::cpu::{CpuState, HaltReason, REGISTER_COUNT};
use crate::error::LoadError;
use crate::loader::parse_program;
use crate::machine::{Machine, SharedOutput};
use crate::memory::MEMORY_SIZE;
use crate::metrics::{gather_text, init_metrics, record_api_request, set_active_machines, Timer};
use crate::snapshots::MachineSnapshot;

/// Upper bound on instructions executed by a single run request.
pub const MAX_STEPS_PER_REQUEST: u32 = 1_000_000;
const DEFAULT_RUN_STEPS: u32 = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct CpuView {
    pub registers: [u8; REGISTER_COUNT],
    pub pc: usize,
    pub fl: u8,
    pub state: CpuState,
    pub cycles: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineView {
    pub id: Uuid,
    pub cpu: CpuView,
}

#[derive(Debug, Deserialize)]
pub struct ProgramLoad {
    /// Program text, one binary literal per line.
    pub source: Option<String>,
    /// Raw program bytes.
    pub bytes: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub max_steps: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryRead {
    pub address: usize,
    pub length: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MemoryData {
    pub address: usize,
    pub data: Vec<u8>,
}

/// Body of `POST /machines/:id/restore`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RestoreRequest {
    /// A full snapshot document, such as one returned by `POST /machines/:id/snapshots`.
    Snapshot(Box<MachineSnapshot>),
    /// A snapshot previously captured on the same machine.
    Stored { snapshot_id: Uuid },
}

#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub steps_executed: u32,
    pub halted: bool,
    pub halt_reason: Option<HaltReason>,
    pub error: Option<String>,
    pub output: String,
    pub final_state: CpuView,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// A hosted machine and everything it printed.
pub struct Instance {
    pub machine: Machine,
    pub output: SharedOutput,
    pub snapshots: HashMap<Uuid, MachineSnapshot>,
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl Instance {
    pub fn new() -> Self {
        let output = SharedOutput::default();
        Self {
            machine: Machine::with_output(Box::new(output.clone())),
            output,
            snapshots: HashMap::new(),
        }
    }

    pub fn cpu_view(&self) -> CpuView {
        let cpu = &self.machine.cpu;
        CpuView {
            registers: cpu.reg,
            pc: cpu.pc,
            fl: cpu.fl,
            state: cpu.state,
            cycles: cpu.cycles,
        }
    }

    /// Replace the running program. A rejected program leaves the machine
    /// and its output alone.
    pub fn load(&mut self, request: &ProgramLoad) -> Result<usize, String> {
        let program = match (&request.source, &request.bytes) {
            (Some(source), None) => parse_program(source).map_err(|err| err.to_string())?,
            (None, Some(bytes)) => bytes.clone(),
            _ => return Err("exactly one of `source` or `bytes` is required".to_string()),
        };
        if program.len() > MEMORY_SIZE {
            return Err(LoadError::ProgramTooLarge(program.len()).to_string());
        }

        self.machine.reset();
        self.output.clear();
        self.machine.load(&program).map_err(|err| err.to_string())?;
        Ok(program.len())
    }

    /// Execute up to `steps` instructions, stopping early on halt or fault.
    pub fn execute_steps(&mut self, steps: u32) -> ExecutionResult {
        let mut executed = 0;
        let mut error = None;

        while executed < steps {
            match self.machine.step() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(err) => {
                    error = Some(err.to_string());
                    break;
                }
            }
            if self.machine.cpu.is_halted() {
                break;
            }
        }

        ExecutionResult {
            steps_executed: executed,
            halted: self.machine.cpu.is_halted(),
            halt_reason: self.machine.cpu.halt_reason(),
            error,
            output: self.output.contents(),
            final_state: self.cpu_view(),
        }
    }

    pub fn read_memory(&self, address: usize, length: usize) -> Result<Vec<u8>, String> {
        let end = address
            .checked_add(length)
            .filter(|&end| end <= MEMORY_SIZE)
            .ok_or_else(|| {
                format!(
                    "range of {} bytes at {} is outside memory [0, {})",
                    length, address, MEMORY_SIZE
                )
            })?;
        Ok(self.machine.memory.as_bytes()[address..end].to_vec())
    }

    /// Restore a stored snapshot or a snapshot document. Validation failures
    /// leave the machine untouched.
    pub fn restore(&mut self, request: &RestoreRequest) -> Result<(), (StatusCode, String)> {
        let snapshot = match request {
            RestoreRequest::Snapshot(snapshot) => snapshot.as_ref(),
            RestoreRequest::Stored { snapshot_id } => self
                .snapshots
                .get(snapshot_id)
                .ok_or_else(|| (StatusCode::NOT_FOUND, "snapshot not found".to_string()))?,
        };
        snapshot
            .restore_to(&mut self.machine)
            .map_err(|err| (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()))
    }
}

pub type SharedInstance = Arc<tokio::sync::Mutex<Instance>>;

/// Hosted machines by id. The map lock is only held to look machines up;
/// each machine has its own lock for the duration of a request.
pub type MachineMap = Arc<Mutex<HashMap<Uuid, SharedInstance>>>;

type Replied = (warp::reply::WithStatus<warp::reply::Json>, StatusCode);

// A handler that panicked mid-request leaves the map in whatever state it
// reached; later requests still get to use it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn find(machines: &MachineMap, id: Uuid) -> Option<SharedInstance> {
    lock(machines).get(&id).cloned()
}

fn reply<T: Serialize>(response: &ApiResponse<T>, status: StatusCode) -> Replied {
    (
        warp::reply::with_status(warp::reply::json(response), status),
        status,
    )
}

fn not_found<T: Serialize>() -> Replied {
    let response: ApiResponse<T> = ApiResponse::error("machine not found".to_string());
    reply(&response, StatusCode::NOT_FOUND)
}

pub fn routes(
    machines: MachineMap,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let create_machine = warp::path("machines")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_machines(machines.clone()))
        .and_then(create_machine_handler);

    let list_machines = warp::path("machines")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_machines(machines.clone()))
        .and_then(list_machines_handler);

    let get_state = warp::path!("machines" / Uuid)
        .and(warp::get())
        .and(with_machines(machines.clone()))
        .and_then(get_state_handler);

    let delete_machine = warp::path!("machines" / Uuid)
        .and(warp::delete())
        .and(with_machines(machines.clone()))
        .and_then(delete_machine_handler);

    let load_program = warp::path!("machines" / Uuid / "program")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_machines(machines.clone()))
        .and_then(load_program_handler);

    let reset_machine = warp::path!("machines" / Uuid / "reset")
        .and(warp::post())
        .and(with_machines(machines.clone()))
        .and_then(reset_handler);

    let step_machine = warp::path!("machines" / Uuid / "step")
        .and(warp::post())
        .and(with_machines(machines.clone()))
        .and_then(step_handler);

    let run_machine = warp::path!("machines" / Uuid / "run")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_machines(machines.clone()))
        .and_then(run_handler);

    let get_output = warp::path!("machines" / Uuid / "output")
        .and(warp::get())
        .and(with_machines(machines.clone()))
        .and_then(output_handler);

    let read_memory = warp::path!("machines" / Uuid / "memory")
        .and(warp::get())
        .and(warp::query::<MemoryRead>())
        .and(with_machines(machines.clone()))
        .and_then(read_memory_handler);

    let create_snapshot = warp::path!("machines" / Uuid / "snapshots")
        .and(warp::post())
        .and(with_machines(machines.clone()))
        .and_then(create_snapshot_handler);

    let list_snapshots = warp::path!("machines" / Uuid / "snapshots")
        .and(warp::get())
        .and(with_machines(machines.clone()))
        .and_then(list_snapshots_handler);

    let restore_snapshot = warp::path!("machines" / Uuid / "restore")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_machines(machines))
        .and_then(restore_snapshot_handler);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(metrics_handler);

    create_machine
        .or(list_machines)
        .or(get_state)
        .or(delete_machine)
        .or(load_program)
        .or(reset_machine)
        .or(step_machine)
        .or(run_machine)
        .or(get_output)
        .or(read_memory)
        .or(create_snapshot)
        .or(list_snapshots)
        .or(restore_snapshot)
        .or(metrics)
}

pub async fn run_server(addr: SocketAddr) -> prometheus::Result<()> {
    init_metrics()?;

    let machines: MachineMap = Arc::new(Mutex::new(HashMap::new()));

    tracing::info!(%addr, "LS-8 server listening");
    tracing::info!("POST   /machines                  - create a machine");
    tracing::info!("GET    /machines                  - list machines");
    tracing::info!("GET    /machines/:id              - machine state");
    tracing::info!("DELETE /machines/:id              - delete a machine");
    tracing::info!("POST   /machines/:id/program      - load a program");
    tracing::info!("POST   /machines/:id/reset        - reset CPU and memory");
    tracing::info!("POST   /machines/:id/step         - execute one instruction");
    tracing::info!("POST   /machines/:id/run          - execute until halt");
    tracing::info!("GET    /machines/:id/output       - printed output");
    tracing::info!("GET    /machines/:id/memory       - read memory");
    tracing::info!("POST   /machines/:id/snapshots    - capture a snapshot");
    tracing::info!("GET    /machines/:id/snapshots    - list snapshots");
    tracing::info!("POST   /machines/:id/restore      - restore a snapshot");
    tracing::info!("GET    /metrics                   - Prometheus metrics");

    warp::serve(routes(machines)).run(addr).await;
    Ok(())
}

fn with_machines(
    machines: MachineMap,
) -> impl Filter<Extract = (MachineMap,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || machines.clone())
}

async fn create_machine_handler(machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let id = Uuid::new_v4();
    let instance = Instance::new();
    let cpu = instance.cpu_view();

    {
        let mut machines_lock = lock(&machines);
        machines_lock.insert(id, Arc::new(tokio::sync::Mutex::new(instance)));
        set_active_machines(machines_lock.len());
    }
    tracing::info!(%id, "machine created");

    let (result, status) = reply(&ApiResponse::success(MachineView { id, cpu }), StatusCode::CREATED);
    record_api_request("POST", "/machines", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn list_machines_handler(machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut instances: Vec<(Uuid, SharedInstance)> = lock(&machines)
        .iter()
        .map(|(id, instance)| (*id, instance.clone()))
        .collect();
    instances.sort_by_key(|(id, _)| *id);

    let mut views = Vec::with_capacity(instances.len());
    for (id, instance) in instances {
        let cpu = instance.lock().await.cpu_view();
        views.push(MachineView { id, cpu });
    }

    let (result, status) = reply(&ApiResponse::success(views), StatusCode::OK);
    record_api_request("GET", "/machines", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn get_state_handler(id: Uuid, machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (result, status) = match find(&machines, id) {
        Some(instance) => {
            let cpu = instance.lock().await.cpu_view();
            reply(&ApiResponse::success(MachineView { id, cpu }), StatusCode::OK)
        }
        None => not_found::<MachineView>(),
    };

    record_api_request("GET", "/machines/:id", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn delete_machine_handler(id: Uuid, machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let removed = {
        let mut machines_lock = lock(&machines);
        let removed = machines_lock.remove(&id);
        set_active_machines(machines_lock.len());
        removed
    };

    let (result, status) = match removed {
        Some(_) => {
            tracing::info!(%id, "machine deleted");
            let response = ApiResponse::success(format!("machine {} deleted", id));
            reply(&response, StatusCode::OK)
        }
        None => not_found::<String>(),
    };

    record_api_request("DELETE", "/machines/:id", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn load_program_handler(
    id: Uuid,
    request: ProgramLoad,
    machines: MachineMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (result, status) = match find(&machines, id) {
        Some(instance) => match instance.lock().await.load(&request) {
            Ok(len) => {
                let response = ApiResponse::success(format!("loaded {} bytes", len));
                reply(&response, StatusCode::OK)
            }
            Err(err) => {
                tracing::warn!(%id, "program rejected: {}", err);
                let response: ApiResponse<String> = ApiResponse::error(err);
                reply(&response, StatusCode::BAD_REQUEST)
            }
        },
        None => not_found::<String>(),
    };

    record_api_request("POST", "/machines/:id/program", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn reset_handler(id: Uuid, machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (result, status) = match find(&machines, id) {
        Some(instance) => {
            let mut instance = instance.lock().await;
            instance.machine.reset();
            instance.output.clear();
            let cpu = instance.cpu_view();
            reply(&ApiResponse::success(MachineView { id, cpu }), StatusCode::OK)
        }
        None => not_found::<MachineView>(),
    };

    record_api_request("POST", "/machines/:id/reset", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn step_handler(id: Uuid, machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (result, status) = match find(&machines, id) {
        Some(instance) => {
            let result = instance.lock().await.execute_steps(1);
            reply(&ApiResponse::success(result), StatusCode::OK)
        }
        None => not_found::<ExecutionResult>(),
    };

    record_api_request("POST", "/machines/:id/step", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn run_handler(
    id: Uuid,
    request: RunRequest,
    machines: MachineMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let steps = request
        .max_steps
        .unwrap_or(DEFAULT_RUN_STEPS)
        .min(MAX_STEPS_PER_REQUEST);

    let (result, status) = match find(&machines, id) {
        Some(instance) => {
            let mut instance = instance.lock_owned().await;
            match tokio::task::spawn_blocking(move || instance.execute_steps(steps)).await {
                Ok(result) => reply(&ApiResponse::success(result), StatusCode::OK),
                Err(err) => {
                    tracing::error!(%id, "run task failed: {}", err);
                    let response: ApiResponse<ExecutionResult> =
                        ApiResponse::error("run task failed".to_string());
                    reply(&response, StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        None => not_found::<ExecutionResult>(),
    };

    record_api_request("POST", "/machines/:id/run", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn output_handler(id: Uuid, machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (result, status) = match find(&machines, id) {
        Some(instance) => {
            let output = instance.lock().await.output.contents();
            reply(&ApiResponse::success(output), StatusCode::OK)
        }
        None => not_found::<String>(),
    };

    record_api_request("GET", "/machines/:id/output", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn read_memory_handler(
    id: Uuid,
    query: MemoryRead,
    machines: MachineMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let length = query.length.unwrap_or(1);

    let (result, status) = match find(&machines, id) {
        Some(instance) => match instance.lock().await.read_memory(query.address, length) {
            Ok(data) => {
                let response = ApiResponse::success(MemoryData {
                    address: query.address,
                    data,
                });
                reply(&response, StatusCode::OK)
            }
            Err(err) => {
                let response: ApiResponse<MemoryData> = ApiResponse::error(err);
                reply(&response, StatusCode::BAD_REQUEST)
            }
        },
        None => not_found::<MemoryData>(),
    };

    record_api_request("GET", "/machines/:id/memory", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn create_snapshot_handler(id: Uuid, machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (result, status) = match find(&machines, id) {
        Some(instance) => {
            let mut instance = instance.lock().await;
            let snapshot = MachineSnapshot::capture(&instance.machine);
            instance.snapshots.insert(snapshot.id, snapshot.clone());
            tracing::debug!(machine = %id, snapshot = %snapshot.id, "snapshot captured");
            reply(&ApiResponse::success(snapshot), StatusCode::CREATED)
        }
        None => not_found::<MachineSnapshot>(),
    };

    record_api_request("POST", "/machines/:id/snapshots", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn list_snapshots_handler(id: Uuid, machines: MachineMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (result, status) = match find(&machines, id) {
        Some(instance) => {
            let instance = instance.lock().await;
            let mut snapshots: Vec<&MachineSnapshot> = instance.snapshots.values().collect();
            snapshots.sort_by_key(|snapshot| snapshot.created_at);
            reply(&ApiResponse::success(snapshots), StatusCode::OK)
        }
        None => not_found::<Vec<MachineSnapshot>>(),
    };

    record_api_request("GET", "/machines/:id/snapshots", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn restore_snapshot_handler(
    id: Uuid,
    request: RestoreRequest,
    machines: MachineMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (result, status) = match find(&machines, id) {
        Some(instance) => {
            let mut instance = instance.lock().await;
            match instance.restore(&request) {
                Ok(()) => {
                    let cpu = instance.cpu_view();
                    reply(&ApiResponse::success(MachineView { id, cpu }), StatusCode::OK)
                }
                Err((status, err)) => {
                    tracing::warn!(%id, "restore rejected: {}", err);
                    let response: ApiResponse<MachineView> = ApiResponse::error(err);
                    reply(&response, status)
                }
            }
        }
        None => not_found::<MachineView>(),
    };

    record_api_request("POST", "/machines/:id/restore", status.as_u16(), timer.elapsed());
    Ok(result)
}

async fn metrics_handler() -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let (body, content_type, status) = match gather_text() {
        Ok(metrics_text) => (metrics_text, "text/plain; version=0.0.4", StatusCode::OK),
        Err(err) => {
            tracing::error!("failed to encode metrics: {}", err);
            (
                "error encoding metrics".to_string(),
                "text/plain",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    };

    record_api_request("GET", "/metrics", status.as_u16(), timer.elapsed());
    Ok(warp::reply::with_status(
        warp::reply::with_header(body, "content-type", content_type),
        status,
    ))
}
