//! Infrastructure layer: job storage, orchestration, workers, external services.

pub mod artifacts;
pub mod coverage;
pub mod http;
pub mod jobs;
pub mod notifications;

mod integration_tests;

pub use artifacts::{ArtifactError, ArtifactWriter, DiscardArtifacts, FsArtifactWriter};
pub use coverage::PgCoverageSource;
pub use http::{HttpAnalysisEngine, HttpNarrator};
pub use notifications::{
    InMemoryNotificationSink, JobNotification, NotificationKind, NotificationSink,
    TracingNotificationSink,
};
