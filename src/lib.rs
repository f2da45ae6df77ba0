//! # hardpin -- digest-pinned hardened image pipeline
//!
//! Reproducible, policy-gated container image builds on top of a moving
//! upstream base image.
//!
//! Two cooperating halves:
//!
//! - The **baseline reconciler** tracks the upstream image's per-architecture
//!   content digests in a durable JSON record, detects drift against the
//!   registry, and resynchronizes on demand. Drift is a reported business
//!   condition, never an error.
//! - The **hardened pipeline** runs a linear stage machine
//!   (Prepare, Build, Verify, Promote, Clean) that builds strictly from the
//!   recorded digests, never from a floating tag, and refuses to publish an
//!   image that fails any verification policy.
//!
//! ## Properties
//!
//! - **`#![forbid(unsafe_code)]`**: no `unsafe` blocks anywhere.
//! - **No shell**: every external tool is invoked with explicit argument
//!   vectors via `std::process::Command`.
//! - **Sanitized tool output**: stderr from external tools is size-bounded
//!   and secret-redacted before it can reach a report or terminal.
//! - **Crash-safe persistence**: the baseline is written atomically
//!   (temp file + rename) under an advisory lock.
//! - **Delegated heavy lifting**: building, scanning, and admission checks
//!   are performed by external tools (`docker`, `trivy`, `kubectl`), not
//!   reimplemented here.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Failure taxonomy and stage attribution |
//! | [`exec`] | External tool invocation, deadlines, stderr sanitization |
//! | [`digest`] | Digest syntax, architecture allow-list, registry adapter |
//! | [`baseline`] | Durable per-architecture digest record and its store |
//! | [`reconcile`] | Drift verdicts, sync, and the composite reconcile |
//! | [`pin`] | Build-file pinning and the Prepare stage |
//! | [`pipeline`] | Stage machine and Docker-backed stage implementations |
//! | [`verify`] | Post-build policy sub-checks |
//! | [`config`] | Defaults, settings, and environment toggles |
//! | [`toolcheck`] | External tool availability probing |

#![forbid(unsafe_code)]

pub mod baseline;
pub mod config;
pub mod digest;
pub mod error;
pub mod exec;
pub mod pin;
pub mod pipeline;
pub mod reconcile;
pub mod toolcheck;
pub mod verify;
