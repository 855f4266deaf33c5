//! In-process HTTP transport with scripted responses, used by the test suites.

use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, Method};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

enum Scripted {
    Response(HttpResponse),
    Failure(TransportError),
}

impl Scripted {
    fn produce(&self) -> Result<HttpResponse, TransportError> {
        match self {
            Scripted::Response(r) => Ok(r.clone()),
            Scripted::Failure(e) => Err(e.clone()),
        }
    }
}

struct Route {
    method: Method,
    fragment: String,
    queued: VecDeque<Scripted>,
    sticky: Option<Scripted>,
}

/// Routes requests by method and URL fragment. Queued responses are consumed in
/// order, then the route's sticky response (if any) repeats. Unmatched requests
/// get a 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<HttpRequest>>,
}

fn json_response(status: u16, body: &serde_json::Value) -> HttpResponse {
    HttpResponse {
        status,
        body: serde_json::to_vec(body).unwrap_or_default(),
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn route_mut<F: FnOnce(&mut Route)>(&self, method: Method, fragment: &str, f: F) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.fragment == fragment)
        {
            f(route);
            return;
        }
        let mut route = Route {
            method,
            fragment: fragment.to_string(),
            queued: VecDeque::new(),
            sticky: None,
        };
        f(&mut route);
        routes.push(route);
    }

    /// Queues a single JSON response.
    pub fn respond(&self, method: Method, fragment: &str, status: u16, body: serde_json::Value) {
        self.route_mut(method, fragment, |r| {
            r.queued
                .push_back(Scripted::Response(json_response(status, &body)))
        });
    }

    /// Sets the response returned once the queue for this route is empty.
    pub fn respond_always(&self, method: Method, fragment: &str, status: u16, body: serde_json::Value) {
        self.route_mut(method, fragment, |r| {
            r.sticky = Some(Scripted::Response(json_response(status, &body)))
        });
    }

    /// Queues a transport-level failure.
    pub fn fail(&self, method: Method, fragment: &str, error: TransportError) {
        self.route_mut(method, fragment, |r| r.queued.push_back(Scripted::Failure(error)));
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, method: Method, fragment: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.method == method && c.url.contains(fragment))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<&mut Route> = routes
            .iter_mut()
            .filter(|r| r.method == request.method && request.url.contains(&r.fragment))
            .filter(|r| !r.queued.is_empty() || r.sticky.is_some())
            .collect();
        // Most specific fragment wins.
        candidates.sort_by(|a, b| b.fragment.len().cmp(&a.fragment.len()));

        match candidates.into_iter().next() {
            Some(route) => match route.queued.pop_front() {
                Some(scripted) => scripted.produce(),
                None => route
                    .sticky
                    .as_ref()
                    .map(Scripted::produce)
                    .unwrap_or_else(|| Err(TransportError::Invalid("empty route".into()))),
            },
            None => Ok(json_response(
                404,
                &serde_json::json!({ "error": format!("no scripted response for {} {}", request.method, request.url) }),
            )),
        }
    }
}
