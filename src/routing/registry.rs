//! Service registry.
//!
//! # Responsibilities
//! - Walk the schema once at startup and materialize [`HandlerOptions`]
//! - Resolve each method's handler by name; unresolved methods answer 501
//! - Register per-endpoint throttles with the limiter registry
//! - Bind every pattern to its middleware chain and the dispatcher
//!
//! # Design Decisions
//! - Each endpoint owns its layer stack, so options are captured once in the
//!   layer state instead of being looked up per request
//! - Endpoints sharing a path are merged into one `MethodRouter`

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::middleware::from_fn_with_state;
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;

use crate::config::LimiterConfig;
use crate::http::cache::response_cache;
use crate::http::middleware::{hydrate_group, require_role, validate_session};
use crate::http::AppState;
use crate::routing::descriptor::{SchemaError, ServiceSchema};
use crate::routing::dispatch::{dispatch, throttle_limiter, MULTIPART_BODY_LIMIT};
use crate::routing::handler::{Handler, HandlerRegistry};
use crate::routing::options::HandlerOptions;
use crate::security::RateLimiters;

/// A bound method.
pub struct Endpoint {
    pub service: String,
    pub options: HandlerOptions,
    /// `None` when the method is declared but not implemented.
    pub handler: Option<Arc<dyn Handler>>,
}

/// Layer and handler state for one endpoint.
#[derive(Clone)]
pub struct EndpointState {
    pub app: AppState,
    pub endpoint: Arc<Endpoint>,
}

pub struct ServiceRegistry {
    endpoints: Vec<Arc<Endpoint>>,
}

impl ServiceRegistry {
    pub fn build(
        schema: &ServiceSchema,
        handlers: &HandlerRegistry,
        api_path: &str,
    ) -> Result<Self, SchemaError> {
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut endpoints = Vec::new();

        for (service, method) in schema.methods() {
            let options = HandlerOptions::from_descriptor(method, api_path)?;
            if let Some(first) = seen.insert(options.pattern.clone(), method.name.clone()) {
                return Err(SchemaError::DuplicatePattern {
                    pattern: options.pattern,
                    first,
                    second: method.name.clone(),
                });
            }

            let handler = handlers.get(&options.service_method_name);
            if handler.is_none() {
                tracing::warn!(
                    service = %service,
                    method = %options.service_method_name,
                    pattern = %options.pattern,
                    "Service method not implemented"
                );
            }

            endpoints.push(Arc::new(Endpoint {
                service: service.to_string(),
                options,
                handler,
            }));
        }

        tracing::info!(endpoints = endpoints.len(), "Service registry built");
        Ok(Self { endpoints })
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn find(&self, pattern: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.options.pattern == pattern)
    }

    /// Throttled endpoints get a limiter of `throttle` per second, bursting to the same.
    pub fn register_throttles(&self, limiters: &RateLimiters) {
        for endpoint in &self.endpoints {
            let throttle = endpoint.options.throttle;
            if throttle > 0 {
                limiters.register(
                    &throttle_limiter(&endpoint.options),
                    &LimiterConfig {
                        rate: f64::from(throttle),
                        burst: throttle,
                    },
                );
            }
        }
    }

    /// Bind every endpoint. Layers run outermost first: session validation,
    /// response cache, role check, group hydration, then dispatch.
    pub fn router(&self, state: AppState) -> Router {
        let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();

        for endpoint in &self.endpoints {
            let ctx = EndpointState {
                app: state.clone(),
                endpoint: endpoint.clone(),
            };

            let mut method_router: MethodRouter<EndpointState> =
                on(method_filter(&endpoint.options.method), dispatch);
            if endpoint.options.multipart_request {
                method_router = method_router.layer(DefaultBodyLimit::max(MULTIPART_BODY_LIMIT));
            }
            let method_router = method_router
                .layer(from_fn_with_state(state.clone(), hydrate_group))
                .layer(from_fn_with_state(ctx.clone(), require_role))
                .layer(from_fn_with_state(ctx.clone(), response_cache))
                .layer(from_fn_with_state(state.clone(), validate_session))
                .with_state(ctx);

            let path = endpoint.options.service_method_url.clone();
            let merged = match by_path.remove(&path) {
                Some(existing) => existing.merge(method_router),
                None => method_router,
            };
            by_path.insert(path, merged);
        }

        by_path
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| {
                router.route(&path, method_router)
            })
    }
}

fn method_filter(method: &Method) -> MethodFilter {
    match *method {
        Method::POST => MethodFilter::POST,
        Method::PUT => MethodFilter::PUT,
        Method::PATCH => MethodFilter::PATCH,
        Method::DELETE => MethodFilter::DELETE,
        _ => MethodFilter::GET,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::handler::{handler_fn, HandlerOutput};
    use futures_util::FutureExt;
    use serde_json::json;

    const SCHEMA: &str = r#"{"services":[{"name":"ThingService","methods":[
        {"name":"GetThings","input":{"name":"In"},"output":{"name":"Out"},
         "http":{"method":"GET","path":"/v1/things"},"options":{"throttle":3}},
        {"name":"PostThing","input":{"name":"In"},"output":{"name":"Out"},
         "http":{"method":"POST","path":"/v1/things"}}
    ]}]}"#;

    fn handlers() -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "GetThings",
            handler_fn(|_, _| async { Ok(HandlerOutput::Json(json!({"ok": 1}))) }.boxed()),
        );
        handlers
    }

    #[test]
    fn test_build_resolves_handlers() {
        let schema = ServiceSchema::from_json(SCHEMA).unwrap();
        let registry = ServiceRegistry::build(&schema, &handlers(), "/api").unwrap();

        assert_eq!(registry.endpoints().len(), 2);
        assert!(registry.find("GET /api/v1/things").unwrap().handler.is_some());
        assert!(registry.find("POST /api/v1/things").unwrap().handler.is_none());
    }

    #[test]
    fn test_duplicate_pattern_fails() {
        let schema = ServiceSchema::from_json(
            r#"{"services":[{"name":"A","methods":[
                {"name":"One","input":{"name":"In"},"output":{"name":"Out"},"http":{"method":"GET","path":"/v1/x"}},
                {"name":"Two","input":{"name":"In"},"output":{"name":"Out"},"http":{"method":"GET","path":"/v1/x"}}
            ]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            ServiceRegistry::build(&schema, &HandlerRegistry::new(), "/api"),
            Err(SchemaError::DuplicatePattern { .. })
        ));
    }

    #[test]
    fn test_throttles_are_registered() {
        let schema = ServiceSchema::from_json(SCHEMA).unwrap();
        let registry = ServiceRegistry::build(&schema, &handlers(), "/api").unwrap();
        let limiters = RateLimiters::from_config(&Default::default());
        registry.register_throttles(&limiters);

        let name = throttle_limiter(&registry.find("GET /api/v1/things").unwrap().options);
        assert!(!limiters.limit(&name, "u1"));
        assert!(!limiters.limit(&name, "u1"));
        assert!(!limiters.limit(&name, "u1"));
        assert!(limiters.limit(&name, "u1"));
        assert!(limiters.get(&throttle_limiter(&registry.find("POST /api/v1/things").unwrap().options)).is_none());
    }
}
