//! CORS header computation.
//!
//! Headers that don't depend on the request (methods, credentials, max-age,
//! exposed headers) are rendered once at construction. Per request only the
//! origin and, for pre-flights, the allowed headers are computed.

use serde::{Deserialize, Serialize};

use crate::flow::Flow;
use crate::method::Method;

/// Which origins may read responses.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AllowedOrigin {
    /// `Access-Control-Allow-Origin: *`.
    #[default]
    Any,
    /// Always answer with this origin.
    Fixed(String),
    /// Reflect the request origin when it is in the list.
    List(Vec<String>),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub origin: AllowedOrigin,
    pub methods: Vec<Method>,
    /// `None` reflects `Access-Control-Request-Headers`.
    pub allowed_headers: Option<Vec<String>>,
    pub exposed_headers: Vec<String>,
    pub credentials: bool,
    /// Seconds.
    pub max_age: Option<u64>,
    /// Let pre-flight requests continue into middleware and routing.
    pub preflight_continue: bool,
    pub options_success_status: u16,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origin: AllowedOrigin::Any,
            methods: vec![
                Method::Get,
                Method::Head,
                Method::Put,
                Method::Patch,
                Method::Post,
                Method::Delete,
            ],
            allowed_headers: None,
            exposed_headers: Vec::new(),
            credentials: false,
            max_age: None,
            preflight_continue: false,
            options_success_status: 204,
        }
    }
}

/// A compiled CORS policy.
#[derive(Debug)]
pub struct Cors {
    config: CorsConfig,
    methods: String,
    exposed: Option<String>,
    max_age: Option<String>,
}

impl Cors {
    pub fn new(config: CorsConfig) -> Self {
        let methods = config
            .methods
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let exposed = (!config.exposed_headers.is_empty()).then(|| config.exposed_headers.join(","));
        let max_age = config.max_age.map(|s| s.to_string());
        Self { config, methods, exposed, max_age }
    }

    /// Headers for the given request, and whether the request is a pre-flight
    /// that must be answered right away.
    pub fn headers_for(
        &self,
        method: &http::Method,
        origin: Option<&str>,
        request_headers: Option<&str>,
    ) -> (Vec<(&'static str, String)>, bool) {
        let mut headers = self.origin_headers(origin);
        if self.config.credentials {
            headers.push(("Access-Control-Allow-Credentials", "true".to_owned()));
        }
        if let Some(exposed) = &self.exposed {
            headers.push(("Access-Control-Expose-Headers", exposed.clone()));
        }

        if *method != http::Method::OPTIONS {
            return (headers, false);
        }

        match &self.config.allowed_headers {
            Some(list) if !list.is_empty() => {
                headers.push(("Access-Control-Allow-Headers", list.join(",")));
            }
            Some(_) => {}
            None => {
                headers.push(("Vary", "Access-Control-Request-Headers".to_owned()));
                if let Some(requested) = request_headers.filter(|h| !h.is_empty()) {
                    headers.push(("Access-Control-Allow-Headers", requested.to_owned()));
                }
            }
        }
        if let Some(max_age) = &self.max_age {
            headers.push(("Access-Control-Max-Age", max_age.clone()));
        }
        headers.push(("Access-Control-Allow-Methods", self.methods.clone()));
        (headers, !self.config.preflight_continue)
    }

    fn origin_headers(&self, origin: Option<&str>) -> Vec<(&'static str, String)> {
        match &self.config.origin {
            AllowedOrigin::Any => vec![("Access-Control-Allow-Origin", "*".to_owned())],
            AllowedOrigin::Fixed(fixed) if fixed == "*" => {
                vec![("Access-Control-Allow-Origin", "*".to_owned())]
            }
            AllowedOrigin::Fixed(fixed) => vec![
                ("Access-Control-Allow-Origin", fixed.clone()),
                ("Vary", "Origin".to_owned()),
            ],
            AllowedOrigin::List(list) => {
                let allowed = origin.filter(|o| list.iter().any(|a| a == o));
                let mut headers = Vec::with_capacity(2);
                if let Some(origin) = allowed {
                    headers.push(("Access-Control-Allow-Origin", origin.to_owned()));
                }
                headers.push(("Vary", "Origin".to_owned()));
                headers
            }
        }
    }

    /// The preprocessing step: merges headers into the flow and answers
    /// pre-flights.
    pub(crate) fn apply(&self, flow: &Flow) {
        let origin = flow.request_header("origin");
        let requested = flow.request_header("access-control-request-headers");
        let (headers, answer_now) =
            self.headers_for(&flow.raw_method(), origin.as_deref(), requested.as_deref());

        for (name, value) in headers {
            if name == "Vary" {
                flow.add_header(name, value);
            } else {
                flow.set_header(name, value);
            }
        }
        if answer_now {
            flow.set_header("Content-Length", "0");
            flow.status(self.config.options_success_status).send(());
        }
    }
}
