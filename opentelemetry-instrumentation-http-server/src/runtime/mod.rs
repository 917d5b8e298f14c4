//! The host-runtime interface the instrumentation installs into.
//!
//! A server runtime exposes an ordered stack of request-handling
//! layers, lifecycle hooks around the response, and a process-wide
//! one-shot initialization notification ([`init`]). The instrumentation
//! consumes exactly this surface: it locates the route-resolving layer
//! through the [`Handler::resolves_routes`] marker, substitutes a
//! wrapped handler in place, and registers hooks for span finalization.
//!
//! [`ServerRuntime::handle_request`] is the reference dispatcher: for
//! one request the stack runs first, then the before-response hooks,
//! then exactly one of the after-response hooks (success) or the error
//! hooks (a stack or before-response failure), in that order.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

mod error;
mod event;
pub mod init;

pub use error::{HandlerError, HttpError};
pub use event::{EventContext, RequestEvent};
pub use init::{announce_runtime, current_runtime, on_runtime_init, InitSubscription};

/// One entry in the runtime's handler stack.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &Arc<RequestEvent>) -> Result<(), HandlerError>;

    /// Marks the layer that performs application route resolution, as
    /// opposed to static-file or middleware layers. The instrumentation
    /// wraps exactly this layer.
    fn resolves_routes(&self) -> bool {
        false
    }
}

/// A handler bound to an optional path prefix. A layer without a route
/// runs for every request.
pub struct Layer {
    route: Option<String>,
    handler: Arc<dyn Handler>,
}

impl Layer {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Layer {
            route: None,
            handler,
        }
    }

    pub fn with_route(route: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Layer {
            route: Some(route.into()),
            handler,
        }
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    fn matches(&self, path: &str) -> bool {
        match &self.route {
            None => true,
            Some(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

type BeforeResponseHook = Box<dyn Fn(&Arc<RequestEvent>) -> Result<(), HandlerError> + Send + Sync>;
type AfterResponseHook = Box<dyn Fn(&Arc<RequestEvent>) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&HandlerError, Option<&Arc<RequestEvent>>) + Send + Sync>;

/// A layered server runtime: the handler stack plus lifecycle hooks.
#[derive(Default)]
pub struct ServerRuntime {
    stack: RwLock<Vec<Layer>>,
    before_response: RwLock<Vec<BeforeResponseHook>>,
    after_response: RwLock<Vec<AfterResponseHook>>,
    error: RwLock<Vec<ErrorHook>>,
}

impl ServerRuntime {
    pub fn new() -> Self {
        ServerRuntime::default()
    }

    pub fn push_layer(&self, layer: Layer) {
        self.stack.write().expect("stack lock poisoned").push(layer);
    }

    /// Read access to the ordered layer stack.
    pub fn with_layers<T>(&self, f: impl FnOnce(&[Layer]) -> T) -> T {
        f(&self.stack.read().expect("stack lock poisoned"))
    }

    pub fn layer_handler(&self, index: usize) -> Option<Arc<dyn Handler>> {
        self.stack
            .read()
            .expect("stack lock poisoned")
            .get(index)
            .map(|layer| layer.handler.clone())
    }

    /// Replaces the handler of one layer in place, keeping its route.
    pub fn replace_layer_handler(&self, index: usize, handler: Arc<dyn Handler>) {
        if let Some(layer) = self
            .stack
            .write()
            .expect("stack lock poisoned")
            .get_mut(index)
        {
            layer.handler = handler;
        }
    }

    /// Registers a hook that runs after the stack but before the
    /// response is flushed. A hook failure diverts the request to the
    /// error hooks; the after-response hooks then do not run.
    pub fn on_before_response<F>(&self, hook: F)
    where
        F: Fn(&Arc<RequestEvent>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.before_response
            .write()
            .expect("hook registry lock poisoned")
            .push(Box::new(hook));
    }

    pub fn on_after_response<F>(&self, hook: F)
    where
        F: Fn(&Arc<RequestEvent>) + Send + Sync + 'static,
    {
        self.after_response
            .write()
            .expect("hook registry lock poisoned")
            .push(Box::new(hook));
    }

    /// Registers a hook invoked for any request-handling error. The
    /// event is absent when the error occurred outside any tracked
    /// request.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&HandlerError, Option<&Arc<RequestEvent>>) + Send + Sync + 'static,
    {
        self.error
            .write()
            .expect("hook registry lock poisoned")
            .push(Box::new(hook));
    }

    /// Reports an error that occurred outside any tracked request.
    pub fn notify_error(&self, error: &HandlerError) {
        self.run_error_hooks(error, None);
    }

    /// Drives one request through the stack and lifecycle hooks.
    ///
    /// The request outcome is whatever the stack (or a before-response
    /// hook) produced; hooks observe but never change it.
    pub async fn handle_request(&self, event: &Arc<RequestEvent>) -> Result<(), HandlerError> {
        let result = match self.run_stack(event).await {
            Ok(()) => self.run_before_response_hooks(event),
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => {
                self.run_after_response_hooks(event);
                Ok(())
            }
            Err(error) => {
                self.run_error_hooks(&error, Some(event));
                Err(error)
            }
        }
    }

    async fn run_stack(&self, event: &Arc<RequestEvent>) -> Result<(), HandlerError> {
        // Snapshot outside the lock; handlers may suspend.
        let handlers = {
            let stack = self.stack.read().expect("stack lock poisoned");
            stack
                .iter()
                .filter(|layer| layer.matches(event.path()))
                .map(|layer| layer.handler.clone())
                .collect::<Vec<_>>()
        };
        for handler in handlers {
            handler.handle(event).await?;
        }
        Ok(())
    }

    fn run_before_response_hooks(&self, event: &Arc<RequestEvent>) -> Result<(), HandlerError> {
        let hooks = self
            .before_response
            .read()
            .expect("hook registry lock poisoned");
        for hook in hooks.iter() {
            hook(event)?;
        }
        Ok(())
    }

    fn run_after_response_hooks(&self, event: &Arc<RequestEvent>) {
        let hooks = self
            .after_response
            .read()
            .expect("hook registry lock poisoned");
        for hook in hooks.iter() {
            hook(event);
        }
    }

    fn run_error_hooks(&self, error: &HandlerError, event: Option<&Arc<RequestEvent>>) {
        let hooks = self.error.read().expect("hook registry lock poisoned");
        for hook in hooks.iter() {
            hook(error, event);
        }
    }
}
