//! Process-wide "runtime initialized" notification channel.
//!
//! Instrumentation may be constructed before the server runtime
//! exists; initialization order between the two is not guaranteed. The
//! channel late-binds the dependency: subscribers are invoked when the
//! runtime announces itself, and can also ask for the current instance
//! directly. The registry is only the transport; the contract is
//! "install once, either now or on the first ready signal".

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use super::ServerRuntime;

type InitCallback = Arc<dyn Fn(&Arc<ServerRuntime>) + Send + Sync>;

struct Registry {
    runtime: Option<Arc<ServerRuntime>>,
    subscribers: Vec<(u64, InitCallback)>,
    next_id: u64,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    Mutex::new(Registry {
        runtime: None,
        subscribers: Vec::new(),
        next_id: 0,
    })
});

fn registry() -> std::sync::MutexGuard<'static, Registry> {
    REGISTRY.lock().expect("init registry lock poisoned")
}

/// Subscription handle returned by [`on_runtime_init`]; dropping it
/// removes the callback.
#[derive(Debug)]
pub struct InitSubscription(u64);

impl Drop for InitSubscription {
    fn drop(&mut self) {
        registry().subscribers.retain(|(id, _)| *id != self.0);
    }
}

/// Publishes the runtime instance and notifies current subscribers.
pub fn announce_runtime(runtime: Arc<ServerRuntime>) {
    let callbacks = {
        let mut registry = registry();
        registry.runtime = Some(runtime.clone());
        registry
            .subscribers
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect::<Vec<_>>()
    };
    // Invoked outside the lock so a callback may subscribe or drop its
    // own subscription.
    for callback in callbacks {
        callback(&runtime);
    }
}

/// The runtime instance, if one has announced itself.
pub fn current_runtime() -> Option<Arc<ServerRuntime>> {
    registry().runtime.clone()
}

/// Registers a callback for future announcements. A runtime announced
/// before the subscription does not fire it retroactively; callers
/// check [`current_runtime`] themselves.
pub fn on_runtime_init<F>(callback: F) -> InitSubscription
where
    F: Fn(&Arc<ServerRuntime>) + Send + Sync + 'static,
{
    let mut registry = registry();
    let id = registry.next_id;
    registry.next_id += 1;
    registry.subscribers.push((id, Arc::new(callback)));
    InitSubscription(id)
}
