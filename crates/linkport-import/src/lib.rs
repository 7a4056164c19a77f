//! CSV import orchestration and A/B test completion scheduling.

mod config;
mod materialize;
mod notify;
mod pipeline;
mod queue;
mod registrar;
mod runtime;
mod schedule;
pub mod signature;
mod validate;

pub use config::{load_default_domains, ImportConfig, DEFAULT_PLATFORM_DOMAINS};
pub use materialize::{LinkMaterializer, MaterializeOutcome};
pub use notify::{render_summary_text, LogNotifier, MemoryNotifier, Notifier, NotifyError, WebhookNotifier};
pub use pipeline::{BatchOutcome, Collaborators, ImportPipeline, PipelineSettings};
pub use queue::{
    HttpQueue, LocalQueue, MemoryQueue, MessageQueue, OutboundMessage, PublishedMessage, QueueError,
};
pub use registrar::{DomainRegistrar, HttpDomainRegistrar, NoopDomainRegistrar, RegistrarError};
pub use runtime::{ImportRequest, ImportRuntime};
pub use schedule::{TestCompletionMessage, TestCompletionScheduler};
pub use validate::{LinkValidator, StandardLinkValidator, ValidationContext, MAX_KEY_LENGTH};

pub const CRATE_NAME: &str = "linkport-import";

/// Queue endpoint that runs one CSV import batch.
pub const IMPORT_CSV_PATH: &str = "/api/cron/import/csv";

/// Queue endpoint that receives fired A/B test completions.
pub const COMPLETE_TESTS_PATH: &str = "/api/cron/links/complete-tests";
