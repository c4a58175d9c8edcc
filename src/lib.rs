//! # meta-strip
//!
//! Client-side orchestration for an image metadata service: pick an image, see
//! what it gives away (camera, GPS, timestamps), and download a copy with all
//! of it removed. The heavy lifting happens on the remote service; this crate
//! handles intake, rate limiting, session persistence and the state machine
//! that ties them together.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meta_strip::config::Config;
//! use meta_strip::orchestrator::{OrchestratorContext, UploadOrchestrator};
//! use meta_strip::picker::LocalFilePicker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!
//!     // Restores the previous session, if one was saved
//!     let orchestrator = UploadOrchestrator::start(OrchestratorContext::from_config(&config)?).await;
//!
//!     orchestrator.select_from(&LocalFilePicker::new("photo.jpg")).await?;
//!
//!     let metadata = orchestrator.inspect().await?;
//!     for group in metadata.groups() {
//!         println!("{} ({} fields)", group.group_name, group.data.len());
//!     }
//!
//!     let cleaned = orchestrator.strip().await?;
//!     println!("Saved: {}", cleaned.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Limits
//!
//! | Operation | Requests | Window |
//! |-----------|----------|--------|
//! | Inspect | 10 | 60 s |
//! | Strip | 5 | 60 s |
//!
//! Files must be JPEG, PNG, GIF or BMP and at most 10 MiB.
//!
//! ## Modules
//!
//! - [`codec`]: File handles and their data-URL form
//! - [`config`]: Configuration types and loading/saving
//! - [`download`]: Where stripped copies are written
//! - [`limiter`]: Sliding-window admission control
//! - [`orchestrator`]: The upload state machine
//! - [`picker`]: Local, Google Drive and Dropbox file sources
//! - [`service`]: Remote metadata service client
//! - [`store`]: Durable single-slot session storage

pub mod codec;
pub mod config;
pub mod download;
pub mod limiter;
pub mod orchestrator;
pub mod picker;
pub mod service;
pub mod store;
