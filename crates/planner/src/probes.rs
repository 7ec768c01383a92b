//! Readiness/liveness probes, tuned per environment purpose.

use ferry_core::{FerryError, Probe, Purpose, Result};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    pub period: i32,
    pub liveness_initial_delay: i32,
    pub readiness_initial_delay: i32,
    pub timeout: i32,
    pub failure_threshold: i32,
}

pub fn timing(purpose: Purpose) -> ProbeTiming {
    match purpose {
        Purpose::Development | Purpose::Testing => ProbeTiming { period: 1, liveness_initial_delay: 1, readiness_initial_delay: 1, timeout: 1, failure_threshold: 3 },
        Purpose::Production => ProbeTiming { period: 3, liveness_initial_delay: 1, readiness_initial_delay: 3, timeout: 1, failure_threshold: 5 },
    }
}

/// Container fields (`readinessProbe`, `livenessProbe`) for the given probes.
/// At most one probe per kind; repeats must agree.
pub fn container_probes(purpose: Purpose, probes: &[Probe]) -> Result<Map<String, Value>> {
    let t = timing(purpose);
    let mut out = Map::new();
    let mut seen: Vec<&Probe> = Vec::new();
    for p in probes {
        let (field, delay) = match p.kind.as_str() {
            "readiness" => ("readinessProbe", t.readiness_initial_delay),
            "liveness" => ("livenessProbe", t.liveness_initial_delay),
            other => return Err(FerryError::bad_input(format!("{}: unknown probe kind", other))),
        };
        if let Some(prev) = seen.iter().find(|s| s.kind == p.kind) {
            if *prev != p {
                return Err(FerryError::bad_input(format!("inconsistent {} probes: {}:{} vs {}:{}", p.kind, prev.path, prev.container_port, p.path, p.container_port)));
            }
            continue;
        }
        seen.push(p);
        out.insert(field.to_string(), json!({
            "httpGet": {"path": p.path, "port": p.container_port},
            "initialDelaySeconds": delay,
            "periodSeconds": t.period,
            "timeoutSeconds": t.timeout,
            "failureThreshold": t.failure_threshold,
        }));
    }
    Ok(out)
}
