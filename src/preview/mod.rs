//! Preview & deployment orchestrator.
//!
//! ## Overview
//!
//! Turns generated application source into a running instance reachable over
//! HTTPS, tracks the instance's lifecycle on the generation record, proxies
//! local interactive previews, and reclaims remote instances and on-disk
//! workspaces once they expire or go stale.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Caller  │ ───────> │  server.rs  (router, GC worker, shutdown)        │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘  202     │         │                                        │
//!                       │         │ PipelineExecutor::start_deploy()       │
//!                       │         v                                        │
//!                       │  pipeline.rs  (stages, in-flight guard)          │
//!                       │     │ workspace.rs  materialize / copy_template  │
//!                       │     │ manifest.rs   binary target patch          │
//!                       │     │ steps.rs      CommandRunner (timeouts)     │
//!                       │     │ compute.rs    ComputePlatform (HTTP API)   │
//!                       │     │ screenshot.rs verification capture         │
//!                       │     v                                            │
//!                       │  db.rs  (GenerationRecord, listings, prod rows)  │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                           |
//! |-------------|----------------------------------------------------------|
//! | `models`    | `GenerationRecord`, `GenerationStatus`, `DeploymentKind` |
//! | `gc`        | Expired preview and stale workspace sweeps               |
//! | `promotion` | Preview to production via secrets only                   |
//! | `local`     | Single local preview process, readiness probing          |
//! | `proxy`     | Fallback handler forwarding to the local preview         |

pub mod api;
pub mod compute;
pub mod db;
pub mod gc;
pub mod local;
pub mod manifest;
pub mod models;
pub mod pipeline;
pub mod promotion;
pub mod proxy;
pub mod screenshot;
pub mod server;
pub mod steps;
#[cfg(test)]
pub(crate) mod testing;
pub mod workspace;
