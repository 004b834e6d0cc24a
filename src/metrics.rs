use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::time::{Duration, Instant};

use crate::cpu::HaltReason;
use crate::dispatch::DISPATCH_TABLE;
use crate::error::MachineError;
use crate::opcodes::instruction_name;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Counter for instructions executed by opcode
    pub static ref INSTRUCTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ls8_instructions_total", "Total number of instructions executed by opcode"),
        &["opcode", "instruction"]
    ).expect("valid instructions counter");

    /// Counter for CPU cycles executed
    pub static ref CYCLES_TOTAL: Counter = Counter::new(
        "ls8_cycles_total", "Total number of CPU cycles executed"
    ).expect("valid cycles counter");

    /// Histogram for instruction execution time
    pub static ref INSTRUCTION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("ls8_instruction_duration_seconds", "Time spent executing instructions")
            .buckets(vec![0.000001, 0.000005, 0.00001, 0.00005, 0.0001, 0.0005, 0.001]),
        &["instruction"]
    ).expect("valid instruction duration histogram");

    /// Counter for machine halts by reason
    pub static ref HALTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ls8_machine_halts_total", "Total number of machine halts"),
        &["reason"]
    ).expect("valid halts counter");

    /// Counter for fatal machine errors by kind
    pub static ref FAULTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ls8_machine_faults_total", "Total number of fatal machine errors"),
        &["kind"]
    ).expect("valid faults counter");

    /// Counter for program loads
    pub static ref PROGRAM_LOADS_TOTAL: Counter = Counter::new(
        "ls8_program_loads_total", "Total number of programs loaded"
    ).expect("valid program loads counter");

    /// Gauge for machines hosted by the server
    pub static ref ACTIVE_MACHINES: Gauge = Gauge::new(
        "ls8_active_machines", "Number of machines hosted by the server"
    ).expect("valid active machines gauge");

    /// Counter for API requests by endpoint and method
    pub static ref API_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ls8_api_requests_total", "Total number of API requests"),
        &["method", "endpoint", "status"]
    ).expect("valid API requests counter");

    /// Histogram for API request duration
    pub static ref API_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("ls8_api_request_duration_seconds", "API request duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "endpoint"]
    ).expect("valid API request duration histogram");
}

lazy_static! {
    // Labelled series for every dispatchable opcode, resolved once.
    static ref INSTRUCTION_SERIES: Vec<Option<(Counter, Histogram)>> = (0..=u8::MAX)
        .map(|opcode| DISPATCH_TABLE.contains(opcode).then(|| instruction_series(opcode)))
        .collect();
}

fn instruction_series(opcode: u8) -> (Counter, Histogram) {
    let name = instruction_name(opcode);
    (
        INSTRUCTIONS_TOTAL.with_label_values(&[&format!("0x{:02X}", opcode), name]),
        INSTRUCTION_DURATION.with_label_values(&[name]),
    )
}

/// Register every collector with the global registry. Safe to call more than once.
pub fn init_metrics() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(INSTRUCTIONS_TOTAL.clone()),
        Box::new(CYCLES_TOTAL.clone()),
        Box::new(INSTRUCTION_DURATION.clone()),
        Box::new(HALTS_TOTAL.clone()),
        Box::new(FAULTS_TOTAL.clone()),
        Box::new(PROGRAM_LOADS_TOTAL.clone()),
        Box::new(ACTIVE_MACHINES.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(API_REQUEST_DURATION.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Prometheus text exposition of the global registry.
pub fn gather_text() -> prometheus::Result<String> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Record an instruction execution
pub fn record_instruction(opcode: u8, duration: Duration) {
    match &INSTRUCTION_SERIES[opcode as usize] {
        Some((count, time)) => {
            count.inc();
            time.observe(duration.as_secs_f64());
        }
        None => {
            let (count, time) = instruction_series(opcode);
            count.inc();
            time.observe(duration.as_secs_f64());
        }
    }

    CYCLES_TOTAL.inc();
}

pub fn record_halt(reason: HaltReason) {
    HALTS_TOTAL.with_label_values(&[reason.as_str()]).inc();
}

pub fn record_fault(err: &MachineError) {
    FAULTS_TOTAL.with_label_values(&[err.kind()]).inc();
}

pub fn record_program_load() {
    PROGRAM_LOADS_TOTAL.inc();
}

/// Record an API request
pub fn record_api_request(method: &str, endpoint: &str, status: u16, duration: Duration) {
    API_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();

    API_REQUEST_DURATION
        .with_label_values(&[method, endpoint])
        .observe(duration.as_secs_f64());
}

/// Update machine count
pub fn set_active_machines(count: usize) {
    ACTIVE_MACHINES.set(count as f64);
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
