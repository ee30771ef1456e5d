//! Skyward - cross-account infrastructure assistant.
//!
//! Turns natural-language requests into staged infrastructure changes and,
//! once the user confirms, executes them in a customer's AWS account through
//! a role they delegated with an external id.
//!
//! # Architecture
//!
//! - [`credential_broker`] - role assumption and trust verification
//! - [`action_ledger`] - staged actions with single-use, time-bounded consumption
//! - [`plan_generator`] - rule-based request classification and plan rendering
//! - [`executor`] - workspace materialization, Terraform and resource drivers
//! - [`resource_driver`] - ordered S3 bucket driver
//! - [`janitor`] - background reclamation of expired actions and workspaces
//! - [`assistant`] - the `verify_role` / `chat` / `apply` handlers
//! - [`confirmation_ui`] - terminal confirmation dialog
//! - [`identity`] - role ARN and external id validation
//! - [`config`], [`error`], [`providers`], [`workspace`] - supporting pieces
//!
//! # Example
//!
//! ```ignore
//! use skyward::{action_ledger::ActionLedger, assistant::Assistant, config::Config};
//! use skyward::credential_broker::StsTrustProvider;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let provider = Arc::new(StsTrustProvider::new(&config.region).await);
//!     let ledger = Arc::new(ActionLedger::new(config.action_ttl()));
//!     let assistant = Assistant::from_config(&config, provider, ledger);
//!
//!     let staged = assistant.chat("create an s3 bucket", Some(role_arn), Some(external_id)).await?;
//!     if let Some(action_id) = staged.action_id() {
//!         let result = assistant.apply(action_id, role_arn, external_id).await?;
//!         println!("{}", result.message);
//!     }
//!     Ok(())
//! }
//! ```

pub mod action_ledger;
pub mod assistant;
pub mod config;
pub mod confirmation_ui;
pub mod credential_broker;
pub mod error;
pub mod executor;
pub mod identity;
pub mod janitor;
pub mod plan_generator;
pub mod providers;
pub mod resource_driver;
pub mod workspace;
