use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use kinformer_core::Notification;
use metrics::{counter, histogram};
use tracing::{error, warn};

/// Callback invoked for every notification, synchronously, on the processing loop.
///
/// A slow handler delays every later record. Errors are logged and dropped.
pub trait Handler: Send + Sync {
    fn on_change(&self, event: &Notification) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync,
{
    fn on_change(&self, event: &Notification) -> anyhow::Result<()> {
        self(event)
    }
}

/// Ordered set of handlers; every handler sees every notification.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<(String, Box<dyn Handler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.push((name.into(), Box::new(handler)));
    }

    pub fn len(&self) -> usize { self.handlers.len() }

    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }

    /// Call every handler in registration order. Returns how many failed.
    pub fn dispatch(&self, event: &Notification) -> usize {
        let mut failed = 0;
        for (name, handler) in &self.handlers {
            let started = Instant::now();
            match catch_unwind(AssertUnwindSafe(|| handler.on_change(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(handler = %name, key = %event.key(), event = event.kind_str(), error = ?e, "handler failed");
                    counter!("kinformer_handler_errors_total", 1u64, "handler" => name.clone());
                }
                Err(_) => {
                    failed += 1;
                    error!(handler = %name, key = %event.key(), event = event.kind_str(), "handler panicked");
                    counter!("kinformer_handler_errors_total", 1u64, "handler" => name.clone());
                }
            }
            histogram!("kinformer_handler_ms", started.elapsed().as_secs_f64() * 1000.0, "handler" => name.clone());
        }
        failed
    }
}
