use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{ConfigError, Fault, HttpError};
use crate::http::request::{COMBINED_METHODS, Request};
use crate::routing::resource::{PathParams, Resource};

/// A resolved route: everything dispatch needs for one request.
///
/// `resource` is `None` when no route matched; the default not-found
/// responder runs in that case and resource-stage middleware is skipped.
#[derive(Clone)]
pub struct Route {
    pub resource: Option<Arc<dyn Resource>>,
    pub params: PathParams,
    pub uri_template: Option<String>,
}

impl Route {
    pub fn not_found() -> Self {
        Self {
            resource: None,
            params: PathParams::new(),
            uri_template: None,
        }
    }
}

/// The route resolution boundary.
///
/// Resolution happens exactly once per request, on the first body event.
/// A resolver may fault (e.g. method not allowed); the fault is routed
/// through error handler resolution like any other.
pub trait Router: Send + Sync {
    fn resolve(&self, req: &Request) -> Result<Route, Fault>;
}

/// Exact-path route table.
///
/// Registration validates the streaming responder pairing for every
/// supported method before the route is inserted, so request-time code
/// never re-checks it.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<dyn Resource>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(
        &mut self,
        uri_template: impl Into<String>,
        resource: Arc<dyn Resource>,
    ) -> Result<(), ConfigError> {
        let uri_template = uri_template.into();

        validate_streaming_pair(&uri_template, resource.as_ref())?;

        self.routes.insert(uri_template, resource);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Checks that for every method the resource supports, the streaming data
/// and finalize responders are both present or both absent.
///
/// This is startup work, not request-path work; the request-time choice of
/// buffered vs. streaming delivery relies on it having already passed.
pub fn validate_streaming_pair(
    uri_template: &str,
    resource: &dyn Resource,
) -> Result<(), ConfigError> {
    for method in COMBINED_METHODS {
        if !resource.supports(&method) {
            continue;
        }

        let has_data = resource.has_data_responder(&method);
        let has_finalize = resource.has_finalize_responder(&method);

        if has_data && !has_finalize {
            return Err(ConfigError::FinalizeResponderMissing {
                uri_template: uri_template.to_string(),
                method,
            });
        }

        if has_finalize && !has_data {
            return Err(ConfigError::DataResponderMissing {
                uri_template: uri_template.to_string(),
                method,
            });
        }
    }

    Ok(())
}

impl Router for RouteTable {
    fn resolve(&self, req: &Request) -> Result<Route, Fault> {
        match self.routes.get_key_value(&req.path) {
            Some((template, resource)) => {
                if !resource.supports(&req.method) {
                    return Err(HttpError::method_not_allowed()
                        .describe(format!(
                            "{} is not allowed for '{}'",
                            req.method.as_str(),
                            template,
                        ))
                        .into());
                }

                Ok(Route {
                    resource: Some(resource.clone()),
                    params: PathParams::new(),
                    uri_template: Some(template.clone()),
                })
            }
            None => Ok(Route::not_found()),
        }
    }
}
