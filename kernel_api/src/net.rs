//! Network stack contract

use std::sync::Arc;

/// The network stack of a network namespace
pub trait NetworkStack: Send + Sync {
    /// Stops packet processing for a checkpoint
    fn pause(&self);

    fn resume(&self);

    /// Resumes a stack whose state was restored from a checkpoint
    fn restore(&self);

    /// Adopts the host configuration (interfaces, routes) of `new`
    fn replace_config(&self, new: Arc<dyn NetworkStack>);

    fn destroy(&self);
}
