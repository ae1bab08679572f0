//! Boundary between the engine and request-handling frameworks.
//!
//! A framework integration implements [`FrameworkAdapter`] for its own
//! request type: it says who is asking and for what, and turns the
//! engine's [`Decision`] into a status code and headers. Adapters are kept
//! in an [`AdapterRegistry`] owned by the application.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::engine::Engine;
use crate::error::Result;
use crate::ratelimit::{Decision, Entity};

/// Status returned for admitted requests.
pub const STATUS_OK: u16 = 200;
/// Status returned for rejected requests.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// The rate limiting question extracted from a framework request.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRequest {
    pub entity: Entity,
    pub scope: String,
    /// Units this request consumes
    pub cost: u64,
}

impl AdmissionRequest {
    /// A request costing one unit.
    pub fn new(entity: Entity, scope: impl Into<String>) -> Self {
        Self {
            entity,
            scope: scope.into(),
            cost: 1,
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

/// What the framework should send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
}

impl AdmissionResponse {
    /// `200` or `429` with the standard rate limit headers.
    pub fn from_decision(decision: &Decision) -> Self {
        let status = if decision.allowed {
            STATUS_OK
        } else {
            STATUS_TOO_MANY_REQUESTS
        };
        Self {
            status,
            headers: decision.headers(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.status == STATUS_TOO_MANY_REQUESTS
    }
}

/// Integration of one framework's request type.
pub trait FrameworkAdapter<Req>: Send + Sync {
    /// Registry name of this adapter.
    fn name(&self) -> &str;

    /// Identify the entity and scope for a request, or `None` to let the
    /// request through unchecked.
    fn extract_request(&self, request: &Req) -> Option<AdmissionRequest>;

    /// Translate a decision into the framework's response.
    fn send_response(&self, decision: &Decision) -> AdmissionResponse {
        AdmissionResponse::from_decision(decision)
    }
}

/// Named collection of adapters for one request type.
pub struct AdapterRegistry<Req> {
    adapters: HashMap<String, Arc<dyn FrameworkAdapter<Req>>>,
}

impl<Req> Default for AdapterRegistry<Req> {
    fn default() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }
}

impl<Req> AdapterRegistry<Req> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, returning any adapter it
    /// replaced.
    pub fn register(
        &mut self,
        adapter: Arc<dyn FrameworkAdapter<Req>>,
    ) -> Option<Arc<dyn FrameworkAdapter<Req>>> {
        let name = adapter.name().to_string();
        debug!(adapter = %name, "Registering framework adapter");
        self.adapters.insert(name, adapter)
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn FrameworkAdapter<Req>>> {
        self.adapters.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FrameworkAdapter<Req>>> {
        self.adapters.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Outcome of [`admit`] for a request that was checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub decision: Decision,
    pub response: AdmissionResponse,
}

/// Run one framework request through the engine.
///
/// Returns `Ok(None)` when the adapter does not rate limit the request.
/// Engine errors are returned as-is; choosing to fail open or closed is up
/// to the caller.
#[instrument(skip_all, fields(adapter = adapter.name()))]
pub async fn admit<Req>(
    engine: &Engine,
    adapter: &dyn FrameworkAdapter<Req>,
    request: &Req,
) -> Result<Option<Admission>> {
    let Some(admission) = adapter.extract_request(request) else {
        debug!("Request not subject to rate limiting");
        return Ok(None);
    };

    let decision = engine
        .check(&admission.entity, &admission.scope, admission.cost)
        .await?;
    let response = adapter.send_response(&decision);

    Ok(Some(Admission { decision, response }))
}
