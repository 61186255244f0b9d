// src/backend/tiered.rs

//! Tier-routing composite over two backends
//!
//! Hot and warm pages live in the hot backend; cold pages in the cold one.
//! The composite only routes; migration ordering is the tier manager's job.

use super::Backend;
use crate::page::Tier;
use std::sync::Arc;

/// Routes object operations to the backend owning a tier
#[derive(Clone)]
pub struct TieredBackend {
    hot: Arc<dyn Backend>,
    cold: Arc<dyn Backend>,
}

impl TieredBackend {
    pub fn new(hot: Arc<dyn Backend>, cold: Arc<dyn Backend>) -> Self {
        Self { hot, cold }
    }

    pub fn hot(&self) -> &Arc<dyn Backend> {
        &self.hot
    }

    pub fn cold(&self) -> &Arc<dyn Backend> {
        &self.cold
    }

    /// The backend holding bytes for pages in `tier`
    pub fn backend_for(&self, tier: Tier) -> &Arc<dyn Backend> {
        if tier.is_resident() { &self.hot } else { &self.cold }
    }

    /// The backend on the other side of a migration
    pub fn other_side(&self, tier: Tier) -> &Arc<dyn Backend> {
        if tier.is_resident() { &self.cold } else { &self.hot }
    }
}
