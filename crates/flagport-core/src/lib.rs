//! flagport core - feature-flag project migration engine
//!
//! Moves a project's environments, segments, flags and views into another
//! account through the rate-governed client of `flagport-api`:
//! - Lookup, create-or-reuse and patch per resource ([`MigrationOrchestrator`])
//! - Key collisions renamed once under a prefix ([`ConflictResolver`])
//! - Approval requests for gated environments ([`translate`])
//! - No-op detection so repeated runs write nothing ([`patch`])
//! - A report of everything that happened ([`MigrationReport`])
//!
//! # Example
//!
//! ```rust,ignore
//! use flagport_api::{ApiClient, ApiGateway, RateGovernor, ReqwestTransport, SystemClock};
//! use flagport_core::{FsSourceStore, MigrationConfig, MigrationOrchestrator};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MigrationConfig::new("legacy", "platform").with_conflict_prefix("imported-");
//! let client = ApiClient::new(
//!     ApiGateway::new(&config.destination_domain, "api-key")?,
//!     Arc::new(RateGovernor::new(Arc::new(SystemClock::new()))),
//!     Arc::new(ReqwestTransport::new(Duration::from_secs(30))?),
//! );
//! let source = FsSourceStore::new("./source", &config.source_project);
//!
//! let report = MigrationOrchestrator::new(config, client, source)?.run().await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod config;
pub mod conflict;
pub mod error;
pub mod fields;
pub mod orchestrator;
pub mod patch;
pub mod report;
pub mod source;
pub mod state;
pub mod translate;
pub mod types;

// Re-exports for convenience
pub use config::{MigrationConfig, DEFAULT_DOMAIN};
pub use conflict::{ConflictDecision, ConflictResolution, ConflictResolver};
pub use error::{ConflictError, MigrationError, SourceError, StateError};
pub use fields::{FieldFilter, VOLATILE_FIELDS};
pub use orchestrator::{MigrationOrchestrator, PATCH_COMMENT};
pub use report::{
    ApprovalOutcome, ApprovalRecord, MigrationReport, MigrationRunStats, ResourceCounts,
    ResourceFailure, RunLog, SkippedFields,
};
pub use source::{FsSourceStore, SourceStore};
pub use state::{allowed_transitions, validate_transition, MigrationState, StateTracker};
pub use translate::{translate, SemanticInstruction, Translation};
pub use types::{
    ApprovalRequest, ApprovalStatus, PatchOp, PatchOperation, ResourceType, Variation,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running migrations
    pub use crate::{
        FsSourceStore, MigrationConfig, MigrationError, MigrationOrchestrator, MigrationReport,
        ResourceType, SourceStore,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
