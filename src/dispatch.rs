//! Startup dispatch of indexed classes to registered handlers.
//!
//! Handlers are bound to a [`Category`] up front; `dispatch` walks the
//! registry once and calls each handler for every class materialized in its
//! category. The index is the only discovery mechanism involved.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::criterion::Category;
use crate::registry::{LoadedClass, Registry};

pub type Handler = Box<dyn Fn(&LoadedClass) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<(Category, Handler)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, category: Category, handler: F) -> &mut Self
    where
        F: Fn(&LoadedClass) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((category, Box::new(handler)));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers run in registration order. A failing handler is logged and
    /// counted; it does not stop the others.
    pub fn dispatch(&self, registry: &Registry) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (category, handler) in &self.handlers {
            let classes: Vec<Arc<LoadedClass>> = registry.materialize(category);
            debug!(category = %category, classes = classes.len(), "dispatching");
            for class in classes {
                report.invoked += 1;
                if let Err(e) = handler(&class) {
                    report.failed += 1;
                    warn!(category = %category, class = %class.name(), error = %e, "handler failed");
                }
            }
        }
        report
    }
}
