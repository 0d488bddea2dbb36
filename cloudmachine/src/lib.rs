//! # CloudMachine Client Library
//!
//! One aggregate client over the services of a provisioned CloudMachine
//! resource: blob storage, table data and Service Bus messaging, plus a
//! blob lifecycle event surface.
//!
//! ## Modules
//!
//! - [`client`] - The aggregate client and its builder
//! - [`storage`] - Blob containers with a per-container client cache
//! - [`data`] - Table entities, typed or raw, submitted as transactions
//! - [`messaging`] - Queue send/receive
//! - [`events`] - Blob lifecycle events on a background dispatch thread
//! - [`config`] - Client configuration and endpoint resolution
//! - [`factory`] - Construction of the backing services
//! - [`credential`] - Bearer token sources
//! - [`transport`] - The shared HTTP transport
//! - [`pipeline`] - Request signing for the storage REST APIs
//! - [`taskpool`] - Bounded worker pool shared by the domain clients
//! - [`cache`] - Named sub-client registry
//! - [`paging`] - Lazy streams over paged APIs
//! - [`common`] - Error types

pub mod cache;
pub mod client;
pub mod common;
pub mod config;
pub mod credential;
pub mod data;
pub mod events;
pub mod factory;
pub mod messaging;
pub mod paging;
pub mod pipeline;
pub mod storage;
pub mod taskpool;
pub mod transport;

pub use client::{CloudMachineClient, CloudMachineClientBuilder};
pub use common::{CloudMachineError, CloudMachineResult};
pub use config::CloudMachineConfig;
