//! Delivery-side hooks.
//!
//! Embedders register hooks to observe emissions. `on_success` fires only
//! after the emit row has been deleted, so a hook that records delivery can
//! treat every callback as final.

use async_trait::async_trait;

use docpipe_core::models::EmitKey;

#[async_trait]
pub trait EmitHook: Send + Sync {
    /// The emit row for `emit_key` was delivered and deleted.
    async fn on_success(&self, emit_key: &EmitKey);

    /// Delivery of `emit_key` failed; the failure was logged.
    async fn on_fail(&self, emit_key: &EmitKey);
}
