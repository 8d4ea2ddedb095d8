// Mock collaborators for integration tests
//
// Each mock records its calls and can be held at a gate so tests can
// observe what happens while a collaborator call is still pending.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use site_sync::{
    BaseImporter, BaseSiteDiscovery, Classification, ConnectorDeps, DiscoveredEndpoint,
    DiscoveredEndpointSet, ImportOutcome, ImportRequest, InMemoryConnectionStore, Role,
};

/// `/community` (community, 0.9) and `/listing` (home, 0.8).
pub fn community_and_listing() -> DiscoveredEndpointSet {
    DiscoveredEndpointSet::from_endpoints(vec![
        DiscoveredEndpoint::new("/community")
            .with_display_name("Communities")
            .classified(Classification::Community, 0.9),
        DiscoveredEndpoint::new("/listing")
            .with_display_name("Listings")
            .classified(Classification::Home, 0.8),
    ])
}

/// Holds calls until the test releases them.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
    pub entered: Arc<Notify>,
}

impl Gate {
    pub fn closed() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            entered: Arc::new(Notify::new()),
        }
    }

    pub fn release(&self, calls: usize) {
        self.permits.add_permits(calls);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        // never closed, so acquire only fails if the gate is dropped
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

// =============================================================================
// Mock Site Discovery
// =============================================================================

pub struct MockSiteDiscovery {
    responses: Mutex<VecDeque<Result<DiscoveredEndpointSet, String>>>,
    probe_error: Mutex<Option<String>>,
    gate: Mutex<Option<Gate>>,
    calls: Mutex<Vec<String>>,
}

impl MockSiteDiscovery {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            probe_error: Mutex::new(None),
            gate: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_endpoints(self, set: DiscoveredEndpointSet) -> Self {
        self.responses.lock().unwrap().push_back(Ok(set));
        self
    }

    pub fn with_failure(self, error: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(error.to_string()));
        self
    }

    pub fn with_unreachable_site(self, error: &str) -> Self {
        *self.probe_error.lock().unwrap() = Some(error.to_string());
        self
    }

    /// Hold every discover call at `gate`.
    pub fn with_gate(self, gate: Gate) -> Self {
        *self.gate.lock().unwrap() = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BaseSiteDiscovery for MockSiteDiscovery {
    async fn probe(&self, _site_url: &str) -> Result<()> {
        let probe_error = self.probe_error.lock().unwrap().clone();
        match probe_error {
            Some(error) => Err(anyhow!(error)),
            None => Ok(()),
        }
    }

    async fn discover(&self, site_url: &str) -> Result<DiscoveredEndpointSet> {
        self.calls.lock().unwrap().push(site_url.to_string());

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(set)) => Ok(set),
            Some(Err(error)) => Err(anyhow!(error)),
            None => Ok(community_and_listing()),
        }
    }
}

// =============================================================================
// Mock Importer
// =============================================================================

pub struct MockImporter {
    responses: Mutex<HashMap<Role, VecDeque<Result<u64, String>>>>,
    gates: Mutex<HashMap<Role, Gate>>,
    calls: Mutex<Vec<ImportRequest>>,
    active: HashMap<Role, AtomicUsize>,
    max_active: HashMap<Role, AtomicUsize>,
}

impl MockImporter {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: Role::ALL.iter().map(|r| (*r, AtomicUsize::new(0))).collect(),
            max_active: Role::ALL.iter().map(|r| (*r, AtomicUsize::new(0))).collect(),
        }
    }

    pub fn with_count(self, role: Role, count: u64) -> Self {
        self.push(role, Ok(count));
        self
    }

    pub fn with_failure(self, role: Role, error: &str) -> Self {
        self.push(role, Err(error.to_string()));
        self
    }

    /// Hold every import of `role` at `gate`.
    pub fn with_gate(self, role: Role, gate: Gate) -> Self {
        self.gates.lock().unwrap().insert(role, gate);
        self
    }

    fn push(&self, role: Role, response: Result<u64, String>) {
        self.responses
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<ImportRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, role: Role) -> usize {
        self.calls().iter().filter(|c| c.role == role).count()
    }

    /// Highest number of simultaneous imports seen for `role`.
    pub fn max_concurrent(&self, role: Role) -> usize {
        self.max_active[&role].load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BaseImporter for MockImporter {
    async fn import_role(&self, request: ImportRequest) -> Result<ImportOutcome> {
        let role = request.role;
        self.calls.lock().unwrap().push(request);

        let now_active = self.active[&role].fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active[&role].fetch_max(now_active, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().get(&role).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let next = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(|queue| queue.pop_front());
        self.active[&role].fetch_sub(1, Ordering::SeqCst);

        match next {
            Some(Ok(item_count)) => Ok(ImportOutcome {
                item_count,
                last_sync: Utc::now(),
            }),
            Some(Err(error)) => Err(anyhow!(error)),
            None => Ok(ImportOutcome {
                item_count: 10,
                last_sync: Utc::now(),
            }),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct TestHarness {
    pub discovery: Arc<MockSiteDiscovery>,
    pub importer: Arc<MockImporter>,
    pub store: InMemoryConnectionStore,
    pub deps: ConnectorDeps,
}

impl TestHarness {
    pub fn new(discovery: MockSiteDiscovery, importer: MockImporter) -> Self {
        let discovery = Arc::new(discovery);
        let importer = Arc::new(importer);
        let store = InMemoryConnectionStore::new();
        let deps = ConnectorDeps::new(
            discovery.clone(),
            importer.clone(),
            Arc::new(store.clone()),
        );
        Self {
            discovery,
            importer,
            store,
            deps,
        }
    }

    pub fn default_mocks() -> Self {
        Self::new(MockSiteDiscovery::new(), MockImporter::new())
    }
}
