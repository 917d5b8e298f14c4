//! Route display-name resolution.

use crate::instrumentation::RouteNameHook;
use crate::paths::PathRewriter;
use crate::runtime::RequestEvent;

/// Resolves the human-readable route template for a request.
///
/// Precedence: the user-supplied hook; then the application-level
/// matched route recorded by the view layer (the innermost source, so
/// it wins over the low-level router); then the router's matched
/// route; then the raw request path. The result is always passed
/// through the configured rewriter.
pub(crate) fn resolve_route_name(
    event: &RequestEvent,
    rewriter: &PathRewriter,
    hook: Option<&RouteNameHook>,
) -> String {
    if let Some(hook) = hook {
        if let Some(name) = hook(event) {
            return rewriter.rewrite(&name);
        }
    }

    let route = event
        .context()
        .matched_app_route(event.path())
        .or_else(|| event.context().matched_route())
        .unwrap_or_else(|| event.path().to_owned());
    rewriter.rewrite(&route)
}
