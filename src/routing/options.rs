//! Per-endpoint handler options, materialized once from the schema.

use axum::http::Method;

use crate::routing::descriptor::{MethodDescriptor, SchemaError};
use crate::security::SiteRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    /// GETs are cached for `cache_duration`; writes invalidate.
    #[default]
    Default,
    /// Cached without expiry, whatever the method.
    Store,
    /// Never cached.
    Skip,
}

impl CacheType {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "DEFAULT" => Some(CacheType::Default),
            "STORE" => Some(CacheType::Store),
            "SKIP" => Some(CacheType::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Handler lookup key.
    pub service_method_name: String,
    /// `"<METHOD> <path>"`, e.g. `POST /api/v1/users`.
    pub pattern: String,
    pub method: Method,
    /// Route path with `{param}` placeholders.
    pub service_method_url: String,
    pub site_role: SiteRole,
    pub cache_type: CacheType,
    /// Seconds; 0 means the configured default.
    pub cache_duration: u64,
    /// Requests per second per user; 0 means unthrottled.
    pub throttle: u32,
    pub multipart_request: bool,
    pub multipart_response: bool,
    pub resets_group: bool,
    pub no_log_fields: Vec<String>,
    /// Input fields fillable from the query string.
    pub query_fields: Vec<String>,
    pub has_query_params: bool,
    pub has_path_params: bool,
    pub use_tx: bool,
    pub invalidations: Vec<String>,
}

impl HandlerOptions {
    pub fn from_descriptor(descriptor: &MethodDescriptor, api_path: &str) -> Result<Self, SchemaError> {
        let name = descriptor.name.clone();
        let opts = &descriptor.options;

        let method = match descriptor.http.method.to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            "DELETE" => Method::DELETE,
            _ => {
                return Err(SchemaError::UnknownMethod {
                    method: name,
                    verb: descriptor.http.method.clone(),
                })
            }
        };

        if !descriptor.http.path.starts_with('/') {
            return Err(SchemaError::BadPath {
                method: name,
                path: descriptor.http.path.clone(),
            });
        }
        let service_method_url = format!("{}{}", api_path.trim_end_matches('/'), descriptor.http.path);

        let site_role = match opts.site_role.as_deref() {
            None | Some("") => SiteRole::Unrestricted,
            Some(role) => SiteRole::from_name(role).ok_or_else(|| SchemaError::UnknownRole {
                method: name.clone(),
                role: role.to_string(),
            })?,
        };

        let cache_type = match opts.cache.as_deref() {
            None | Some("") => CacheType::Default,
            Some(cache) => CacheType::parse(cache).ok_or_else(|| SchemaError::UnknownCache {
                method: name.clone(),
                cache: cache.to_string(),
            })?,
        };

        let path_params: Vec<&str> = service_method_url
            .split('/')
            .filter_map(|segment| segment.strip_prefix('{')?.strip_suffix('}'))
            .collect();

        let query_fields: Vec<String> = if method == Method::GET {
            descriptor
                .input
                .fields
                .iter()
                .map(|f| f.name.clone())
                .filter(|f| !path_params.contains(&f.as_str()))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            pattern: format!("{method} {service_method_url}"),
            has_path_params: !path_params.is_empty(),
            has_query_params: !query_fields.is_empty(),
            no_log_fields: descriptor
                .input
                .fields
                .iter()
                .filter(|f| f.no_log)
                .map(|f| f.name.clone())
                .collect(),
            service_method_name: name,
            method,
            service_method_url,
            site_role,
            cache_type,
            cache_duration: opts.cache_duration,
            throttle: opts.throttle,
            multipart_request: opts.multipart_request,
            multipart_response: opts.multipart_response,
            resets_group: opts.resets_group,
            query_fields,
            use_tx: opts.use_tx,
            invalidations: opts.invalidations.clone(),
        })
    }

    pub fn should_skip_cache(&self) -> bool {
        self.cache_type == CacheType::Skip
    }

    pub fn should_store(&self) -> bool {
        self.cache_type == CacheType::Store
    }
}
