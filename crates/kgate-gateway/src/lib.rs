//! # kgate-gateway
//!
//! Kernel lifecycle against a remote Jupyter gateway.
//!
//! [`KernelManager`] is the facade: it creates kernels over REST
//! ([`GatewayClient`]), connects a WebSocket transport and channel engine
//! per kernel, and republishes each kernel's output to registered listeners
//! as [`OutputEnvelope`](kgate_core::OutputEnvelope)s.

#![deny(unsafe_code)]

pub mod errors;
pub mod kernel;
pub mod listeners;
pub mod manager;
pub mod models;
pub mod rest;

pub use errors::{GatewayError, Result};
pub use kernel::{GatewayKernel, KernelSnapshot, KernelStatus};
pub use listeners::{OutputListeners, OutputReceiver, OutputSender};
pub use manager::{ExecutionOutcome, KernelManager};
pub use models::{CreateKernelRequest, KernelModel, KernelSpec, KernelSpecFile, KernelSpecs};
pub use rest::GatewayClient;
