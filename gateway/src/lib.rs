// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! # PAM Gateway
//!
//! Just-in-time access to PostgreSQL. When a request for access is approved,
//! the gateway creates a short-lived database principal scoped to the
//! requested tables and opens a dedicated TCP tunnel through which that
//! principal reaches the database. Simple queries flowing through the tunnel
//! are written to the audit log.
//!
//! ## Architecture
//!
//! ```text
//! Operator -> HTTP API -> Gateway -> Provisioner -> PostgreSQL (admin SQL)
//!                            |
//!                            +-> TunnelRegistry -> listener per grant
//!                                                     |
//! Client ---------------------------------------------+-> WireAuditor -> PostgreSQL
//! ```
//!
//! ## Modules
//!
//! - [`application`]: HTTP server setup with Axum
//! - [`auditor`]: Wire-protocol tap logging simple queries
//! - [`configuration`]: CLI argument parsing with clap
//! - [`constants`]: Limits and defaults
//! - [`errors`]: Error types with HTTP response mapping
//! - [`gateway`]: Approval and revocation flow
//! - [`generator`]: Principal names, passwords and tunnel endpoints
//! - [`models`]: Credentials and request/response types
//! - [`permissions`]: Requested scope and its grant plan
//! - [`provisioner`]: Administrative SQL against the database server
//! - [`routes`]: HTTP route handlers
//! - [`tunnels`]: Per-grant listeners and client sessions
//!
//! ## Usage
//!
//! ```bash
//! pam-gateway --db-host 10.0.0.5 --app-hostname pam.example.com
//! ```
//!
//! ## Security Considerations
//!
//! - Principals expire in the database at the same time their tunnel closes
//! - Passwords are zeroized on drop and redacted from debug output
//! - Identifiers are quoted in every administrative statement
//! - Only the fixed table privileges in [`constants::ALLOWED_VERBS`] are granted

pub mod application;
pub mod auditor;
pub mod configuration;
pub mod constants;
pub mod errors;
pub mod gateway;
pub mod generator;
pub mod models;
pub mod permissions;
pub mod provisioner;
pub mod routes;
pub mod tunnels;

#[cfg(test)]
mod testutil;
