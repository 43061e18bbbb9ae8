//! Service graph resolution and orchestration for the Stevedore runtime.
//!
//! A loaded [`Project`](stevedore_compose::Project) flows through four
//! stages:
//!
//! 1. [`builder`] turns one service descriptor into an inert
//!    [`ExecutionUnit`](unit::ExecutionUnit).
//! 2. [`resolver`] resolves `depends_on` recursively and binds each
//!    dependency into its dependent.
//! 3. [`publish`] derives the host endpoints each service publishes.
//! 4. [`orchestrator`] runs every unit and endpoint concurrently under one
//!    cancellation scope.
//!
//! [`engine::Engine`] ties the stages together for the CLI.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod backend;
pub mod builder;
pub mod engine;
pub mod orchestrator;
pub mod publish;
pub mod resolver;
pub mod unit;
