//! Shared fixture for service tests: one in-memory store, one captured
//! audit stream, and every manager wired to both.

use std::sync::Arc;

use crate::audit::{AuditDrain, AuditEmitter, TestAuditSink};
use crate::services::build_service::BuildService;
use crate::services::image_service::ImageService;
use crate::services::integrity::IntegrityService;
use crate::services::project_service::ProjectService;
use crate::services::test_service::TestService;
use crate::store::{MemoryStore, RecordStore};

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub projects: ProjectService,
    pub tests: TestService,
    pub images: ImageService,
    pub builds: BuildService,
    pub integrity: IntegrityService,
    pub audit: AuditEmitter,
    sink: Arc<TestAuditSink>,
    drain: AuditDrain,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn RecordStore> = store.clone();
        let sink = Arc::new(TestAuditSink::default());
        let (audit, drain) = AuditEmitter::spawn(sink.clone(), 64);

        Self {
            projects: ProjectService::new(shared.clone(), audit.clone()),
            tests: TestService::new(shared.clone(), audit.clone()),
            images: ImageService::new(shared.clone(), audit.clone()),
            builds: BuildService::new(shared.clone(), audit.clone()),
            integrity: IntegrityService::new(shared),
            audit,
            store,
            sink,
            drain,
        }
    }

    /// Flush the audit queue and return the delivered event types in order.
    pub async fn finish(self) -> Vec<String> {
        self.drain.shutdown().await;
        self.sink.event_types()
    }
}
