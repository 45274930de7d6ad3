//! # mmd-parent
//!
//! Maintains *virtual parent* metadata records: one aggregate MMD record per
//! group of child products (same platform, mode, product type and relative
//! orbit). Each child is linked exactly once; the parent's temporal and
//! spatial envelope is widened incrementally, never recomputed from the full
//! child set.
//!
//! ## Architecture
//!
//! ```text
//! child name ──▶ identity ──▶ lock(parent key) ──▶ validate ─▶ repair ─▶ validate
//!                   │                                  │
//!                   ▼                                  ▼
//!               orphans ◀───────────── unmet ──────────┤
//!                                                      ▼
//!                                 materialize (new) / reconcile (existing)
//!                                                      │
//!                                                      ▼
//!                                              atomic record write
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extent`] | Temporal ranges, rectangles, sentinel, area of interest |
//! | [`record`] | MMD document tree and atomic persistence |
//! | [`identity`] | Parent keys, parent ids, record paths |
//! | [`validate`] | Platform-dependent validation and repair |
//! | [`orphans`] | Registry of children that could not be linked |
//! | [`lock`] | Per-key lock files |
//! | [`clock`] | Injectable time source |
//! | [`materialize`] | Parent creation from the first child |
//! | [`reconcile`] | Envelope widening for later children |
//! | [`link`] | Per-child pipeline and batch fan-out |
//! | [`envelope`] | Group-wide envelope reset and rebuild |
//! | [`audit`] | Read-only check of every child in a group |
//! | [`progress`] | Rebuild progress on stderr |

pub mod audit;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod extent;
pub mod identity;
pub mod link;
pub mod lock;
pub mod materialize;
pub mod models;
pub mod orphans;
pub mod progress;
pub mod reconcile;
pub mod record;
pub mod validate;
