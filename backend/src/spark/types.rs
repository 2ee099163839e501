use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies one loaded module and the topology of its replica pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleHandle {
    /// Opaque version id; primary key of the cache.
    pub version_id: String,
    /// Absolute path (or URL) of the module bytecode.
    pub url: String,
    /// Execution units per worker.
    pub replicas: usize,
    /// Worker count.
    pub threads: usize,
}

impl ModuleHandle {
    pub fn new(version_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            url: url.into(),
            replicas: 1,
            threads: 1,
        }
    }

    pub fn with_topology(mut self, threads: usize, replicas: usize) -> Self {
        self.threads = threads.max(1);
        self.replicas = replicas.max(1);
        self
    }
}

/// Caller-facing execution payload: one record (object) or many (array).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecuteRequest {
    pub fn new(inputs: Value) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn with_shared(mut self, shared: Value) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Records as a list; a non-array `inputs` is a single record.
    pub fn records(&self) -> Vec<Value> {
        match &self.inputs {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub inputs: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub version_id: String,
    #[serde(default)]
    pub call_purpose: String,
    #[serde(default)]
    pub source_system: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub requested_output: Option<String>,
    #[serde(default)]
    pub service_category: String,
    #[serde(default)]
    pub compiler_type: Option<String>,
}

/// Request as handed to an `ExecutionUnit`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_data: RequestData,
    pub request_meta: RequestMeta,
}

impl ExecutionRequest {
    pub fn inputs(&self) -> &Value {
        &self.request_data.inputs
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(default)]
    pub warnings: Vec<Value>,
    #[serde(default)]
    pub service_chain: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(default)]
    pub version_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_version: Option<String>,
    /// Milliseconds spent inside the unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_time: Option<f64>,
}

/// Response of one execution. Never mutated once produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub response_data: ResponseData,
    #[serde(default)]
    pub response_meta: ResponseMeta,
}

impl ExecutionResult {
    /// Result carrying a failure instead of outputs.
    pub fn failed(version_id: &str, message: impl Into<String>) -> Self {
        Self {
            response_data: ResponseData {
                outputs: Value::Null,
                errors: vec![serde_json::json!({ "message": message.into() })],
                ..Default::default()
            },
            response_meta: ResponseMeta {
                version_id: version_id.to_string(),
                process_time: Some(0.0),
                ..Default::default()
            },
        }
    }

    pub fn outputs(&self) -> &Value {
        &self.response_data.outputs
    }

    pub fn is_failure(&self) -> bool {
        self.response_data.outputs.is_null() && !self.response_data.errors.is_empty()
    }
}

/// One item of a fan-out: the request, what came back, and how long it took.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutedRecord {
    pub request: ExecutionRequest,
    pub result: ExecutionResult,
    pub elapsed_ms: f64,
}
