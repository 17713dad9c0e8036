use std::sync::Arc;

use crate::services::{
    archive::ResultArchive, job_store::JobStore, orchestrator::JobOrchestrator,
    realtime::RealtimeCaptureService,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JobStore>,
    pub archive: Arc<ResultArchive>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub realtime: Arc<RealtimeCaptureService>,
}

impl AppState {
    pub fn new(
        archive: Arc<ResultArchive>,
        orchestrator: JobOrchestrator,
        realtime: RealtimeCaptureService,
    ) -> Self {
        Self {
            store: Arc::clone(orchestrator.store()),
            archive,
            orchestrator: Arc::new(orchestrator),
            realtime: Arc::new(realtime),
        }
    }
}
