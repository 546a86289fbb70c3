//! ECR host integration for serial payment terminals.
//!
//! This facade re-exports the workspace crates:
//! - [`core`]: shared types, constants and errors
//! - [`protocol`]: frame codec and wire message encode/decode
//! - [`link`]: byte port, reader loop and retrying sender
//! - [`session`]: session coordinator and event surface
//! - [`archive`]: completed-transaction records
//!
//! A minimal embedding connects, subscribes and runs a payment:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ecrlink::session::{DefaultPromptHandler, ManagerConfig, TerminalManager, TerminalEvent};
//!
//! # async fn example() -> ecrlink::core::Result<()> {
//! let config = ManagerConfig::new("/dev/ttyS0");
//! let manager = TerminalManager::connect(config, Arc::new(DefaultPromptHandler)).await?;
//! let mut events = manager.subscribe();
//!
//! let amount = ecrlink::core::Amount::new(1234)?;
//! manager.run_payment(amount, false, None).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let TerminalEvent::PurchaseCompleted(outcome) = event {
//!         println!("paid {}", outcome.result.amount);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub use ecrlink_archive as archive;
pub use ecrlink_core as core;
pub use ecrlink_link as link;
pub use ecrlink_protocol as protocol;
pub use ecrlink_session as session;
