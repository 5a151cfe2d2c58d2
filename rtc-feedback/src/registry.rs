//! Interceptor Registry - collects builders and builds one chain per session.

use std::sync::Arc;

use crate::chain::Chain;
use crate::error::Result;
use crate::noop::NoOp;
use crate::{Interceptor, InterceptorBuilder, SharedInterceptorBuilder};

/// Registry is a collector for interceptor builders.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{Registry, SenderReportBuilder, ReceiverReportBuilder};
///
/// let registry = Registry::new()
///     .with(Box::new(SenderReportBuilder::new()))
///     .with(Box::new(ReceiverReportBuilder::new()));
///
/// // One chain per peer connection
/// let chain = registry.build("pc-1")?;
/// ```
///
/// # Helper Function Pattern
///
/// ```ignore
/// fn register_default_interceptors(registry: Registry) -> Registry {
///     registry
///         .with(Box::new(SenderReportBuilder::new()))
///         .with(Box::new(ReceiverReportBuilder::new()))
/// }
/// ```
#[derive(Default)]
pub struct Registry {
    builders: Vec<Box<dyn InterceptorBuilder + Send + Sync>>,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Registry { builders: vec![] }
    }

    /// add a new InterceptorBuilder to the registry.
    pub fn add(&mut self, builder: Box<dyn InterceptorBuilder + Send + Sync>) -> &mut Self {
        self.builders.push(builder);
        self
    }

    /// Consuming form of [`Registry::add`].
    pub fn with(mut self, builder: Box<dyn InterceptorBuilder + Send + Sync>) -> Self {
        self.builders.push(builder);
        self
    }

    /// Register one interceptor instance shared by every session built from
    /// this registry.
    pub fn add_interceptor(
        &mut self,
        interceptor: Arc<dyn Interceptor + Send + Sync>,
    ) -> &mut Self {
        self.add(Box::new(SharedInterceptorBuilder::new(interceptor)))
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// build constructs a single Interceptor for the session `id`: a
    /// [`Chain`] of all registered interceptors, or [`NoOp`] when empty.
    pub fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        if self.builders.is_empty() {
            return Ok(Arc::new(NoOp));
        }

        let interceptors = self
            .builders
            .iter()
            .map(|b| b.build(id))
            .collect::<Result<Vec<_>>>()?;

        log::debug!("session {id}: built chain of {} interceptors", interceptors.len());
        Ok(Arc::new(Chain::new(interceptors)))
    }
}
