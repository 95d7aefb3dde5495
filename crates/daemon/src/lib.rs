//! Clip Relay
//!
//! Background service that watches a recordings folder, trims each new clip,
//! compresses it into a target size window and uploads it to a webhook.

pub mod abort;
pub mod daemon;
pub mod delivery;
pub mod encode;
pub mod queue;
pub mod replace;
pub mod search;
pub mod stability;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod watch;
pub mod worker;

pub use abort::AbortSignal;
pub use clip_relay_config as config;
pub use clip_relay_config::Config;
pub use daemon::{Daemon, DaemonError, StartupChecks};
pub use delivery::{ClipDelivery, DeliverySink, UploadError, WebhookSink};
pub use encode::{EncodeError, EncodeParams, EncoderGateway, FfmpegGateway, ProbeError, SourceClip};
pub use queue::{IngestQueue, ProcessingTask, TaskState};
pub use search::{SearchError, SearchOutcome, SearchRequest, SizeSearch};
pub use startup::{run_startup_checks, StartupError};
pub use status::{new_shared_status, SharedStatus, StatusSnapshot};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use worker::{TaskError, TaskReport, Worker};
