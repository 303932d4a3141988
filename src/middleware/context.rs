use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::Request;

/// Per-request slots through which inner components pass values to the
/// logging middleware without coupling their signatures. The logging
/// middleware allocates one per request and reads the final values after the
/// handler returns; the Service and Target fill them in along the way.
#[derive(Debug, Default)]
pub struct RequestContext {
    service: Mutex<Option<String>>,
    target: Mutex<Option<String>>,
    log_headers: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RequestContext {
    /// Fetch the context attached to a request, if the logging middleware is
    /// in the chain.
    pub fn of(req: &Request) -> Option<Arc<RequestContext>> {
        req.extensions().get::<Arc<RequestContext>>().cloned()
    }

    pub fn set_service(&self, name: &str) {
        *lock(&self.service) = Some(name.to_string());
    }

    pub fn set_target(&self, address: &str) {
        *lock(&self.target) = Some(address.to_string());
    }

    pub fn set_log_headers(&self, names: &[String]) {
        *lock(&self.log_headers) = names.to_vec();
    }

    pub fn service(&self) -> Option<String> {
        lock(&self.service).clone()
    }

    pub fn target(&self) -> Option<String> {
        lock(&self.target).clone()
    }

    pub fn log_headers(&self) -> Vec<String> {
        lock(&self.log_headers).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_slots_round_trip() {
        let ctx = RequestContext::default();
        assert_eq!(ctx.service(), None);
        assert_eq!(ctx.target(), None);
        assert!(ctx.log_headers().is_empty());

        ctx.set_service("myapp");
        ctx.set_target("upstream:3000");
        ctx.set_log_headers(&["X-Version".to_string()]);

        assert_eq!(ctx.service().as_deref(), Some("myapp"));
        assert_eq!(ctx.target().as_deref(), Some("upstream:3000"));
        assert_eq!(ctx.log_headers(), vec!["X-Version".to_string()]);
    }

    #[test]
    fn test_context_of_request() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        assert!(RequestContext::of(&req).is_none());

        let ctx = Arc::new(RequestContext::default());
        req.extensions_mut().insert(ctx.clone());
        let found = RequestContext::of(&req).unwrap();
        found.set_service("myapp");
        assert_eq!(ctx.service().as_deref(), Some("myapp"));
    }
}
