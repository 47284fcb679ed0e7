//! Invocation executor.
//!
//! [`build_request`] turns a descriptor plus caller arguments into a fully-formed request without
//! touching the network. [`ODataExecutor::execute`] sends it, maps the response and, where the
//! protocol acknowledges without a body, issues the follow-up read.

use crate::catalog::{OperationDescriptor, OperationKind, QueryOption};
use crate::config::{AuthConfig, ServiceConfig};
use crate::error::ExecutionError;
use crate::keys::{encode_path_segment, format_key_segment};
use crate::safety::{OutboundHttpSafety, redact_url, sanitize_reqwest_error};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Protocol version declared on every request.
pub const ODATA_VERSION: &str = "4.0";

const ACCEPT_JSON: &str = "application/json;odata.metadata=minimal";

/// A request ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Value>,
    /// Ask the service to return the created entity.
    pub prefer_representation: bool,
}

/// Sends prepared requests for one service.
#[derive(Clone)]
pub struct ODataExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    client: Client,
    auth: Option<AuthConfig>,
    headers: BTreeMap<String, String>,
    max_response_bytes: Option<usize>,
    safety: OutboundHttpSafety,
}

struct RawResponse {
    status: StatusCode,
    entity_id: Option<String>,
    bytes: Vec<u8>,
}

impl ODataExecutor {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built for the safety policy.
    pub fn new(config: &ServiceConfig, safety: OutboundHttpSafety) -> Result<Self, ExecutionError> {
        let client = safety.build_client()?;
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                client,
                auth: config.auth.clone(),
                headers: config.headers.clone(),
                max_response_bytes: config.max_response_bytes.or(safety.max_response_bytes),
                safety,
            }),
        })
    }

    /// Execute one operation.
    ///
    /// Exactly one request is sent, plus one follow-up read when a create or update is
    /// acknowledged without a body. `cancel` aborts the in-flight request; a timeout is a token
    /// cancelled by [`cancel_after`].
    ///
    /// # Errors
    ///
    /// Validation and configuration failures are reported before any network attempt. Non-2xx
    /// responses become [`ExecutionError::Http`]; cancellation becomes
    /// [`ExecutionError::Cancelled`].
    pub async fn execute(
        &self,
        op: &OperationDescriptor,
        arguments: &Value,
        base_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let request = build_request(op, arguments, base_url)?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExecutionError::Cancelled),
            result = self.dispatch(op, request) => result,
        }
    }

    async fn dispatch(
        &self,
        op: &OperationDescriptor,
        request: PreparedRequest,
    ) -> Result<Value, ExecutionError> {
        let response = self.send(&request).await?;
        if !response.status.is_success() {
            let err = upstream_error(response.status, &response.bytes);
            debug!(
                tool = %op.name,
                status = response.status.as_u16(),
                error = %err,
                "upstream returned error response"
            );
            return Err(err);
        }

        match op.kind {
            OperationKind::Delete => Ok(json!({
                "deleted": true,
                "entitySet": op.entity_set,
                "status": response.status.as_u16(),
            })),
            OperationKind::NavigateAdd => Ok(json!({
                "linked": true,
                "navigation": op.navigation.as_ref().map(|n| n.property.as_str()),
            })),
            OperationKind::NavigateRemove => Ok(json!({
                "unlinked": true,
                "navigation": op.navigation.as_ref().map(|n| n.property.as_str()),
            })),
            OperationKind::Count => {
                let body = parse_body(response.status, &response.bytes)?;
                let count = body.get("@odata.count").and_then(Value::as_u64).ok_or_else(|| {
                    ExecutionError::MalformedResponse {
                        status: response.status.as_u16(),
                        message: "response has no @odata.count".to_string(),
                    }
                })?;
                Ok(json!({ "count": count }))
            }
            OperationKind::Create | OperationKind::Update if is_empty_body(&response.bytes) => {
                let location = response
                    .entity_id
                    .as_deref()
                    .and_then(|loc| request.url.join(loc).ok());
                let read_url = match (op.kind, location) {
                    (_, Some(url)) => url,
                    // Pre-update key is authoritative when the service names no location.
                    (OperationKind::Update, None) => request.url.clone(),
                    _ => {
                        return Ok(json!({
                            "created": true,
                            "status": response.status.as_u16(),
                        }));
                    }
                };
                debug!(tool = %op.name, url = %redact_url(&read_url), "following up with read");
                self.read(read_url).await
            }
            _ => parse_body(response.status, &response.bytes),
        }
    }

    async fn read(&self, url: Url) -> Result<Value, ExecutionError> {
        let request = PreparedRequest {
            method: Method::GET,
            url,
            body: None,
            prefer_representation: false,
        };
        let response = self.send(&request).await?;
        if !response.status.is_success() {
            return Err(upstream_error(response.status, &response.bytes));
        }
        parse_body(response.status, &response.bytes)
    }

    async fn send(&self, request: &PreparedRequest) -> Result<RawResponse, ExecutionError> {
        self.inner.safety.check_url(&request.url).await?;

        let mut builder = self
            .inner
            .client
            .request(request.method.clone(), request.url.clone())
            .header("OData-Version", ODATA_VERSION)
            .header("OData-MaxVersion", ODATA_VERSION)
            .header(reqwest::header::ACCEPT, ACCEPT_JSON);
        builder = apply_auth(self.inner.auth.as_ref(), builder);
        for (key, value) in &self.inner.headers {
            builder = builder.header(key, value);
        }
        if request.prefer_representation {
            builder = builder.header("Prefer", "return=representation");
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ExecutionError::Transport(sanitize_reqwest_error(&e)))?;
        let status = response.status();
        let entity_id = ["OData-EntityId", "Location"].iter().find_map(|h| {
            response
                .headers()
                .get(*h)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
        let bytes = read_response_body_limited_bytes(response, self.inner.max_response_bytes).await?;
        Ok(RawResponse {
            status,
            entity_id,
            bytes,
        })
    }
}

/// A child of `parent` that is cancelled after `timeout`.
///
/// Cancel (or drop a [`tokio_util::sync::DropGuard`] of) the returned token once the call is done
/// so the timer task exits early.
#[must_use]
pub fn cancel_after(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let child = parent.child_token();
    let timer = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(timeout) => timer.cancel(),
            () = timer.cancelled() => {}
        }
    });
    child
}

/// Build the request for `op` without sending it.
///
/// # Errors
///
/// Returns [`ExecutionError::Configuration`] when no base address is available (checked first),
/// and [`ExecutionError::Validation`] when a required parameter is missing or a parameter value is
/// out of range.
pub fn build_request(
    op: &OperationDescriptor,
    arguments: &Value,
    base_url: Option<&str>,
) -> Result<PreparedRequest, ExecutionError> {
    let base = base_url
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| {
            ExecutionError::Configuration(format!(
                "no service base address configured for operation '{}'",
                op.name
            ))
        })?
        .trim_end_matches('/');

    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            return Err(ExecutionError::Validation(
                "arguments must be a JSON object".to_string(),
            ));
        }
    };

    for name in op.required_parameters() {
        if args.get(name).is_none_or(Value::is_null) {
            return Err(ExecutionError::Validation(format!(
                "missing required parameter '{name}'"
            )));
        }
    }

    let collection = format!("{base}/{}", encode_path_segment(&op.entity_set));
    let entity = if op.key.is_empty() {
        collection.clone()
    } else {
        format!("{collection}{}", format_key_segment(&op.key, args)?)
    };

    let mut prefer_representation = false;
    let (method, path, query, body) = match op.kind {
        OperationKind::Create => {
            prefer_representation = true;
            (Method::POST, collection, BTreeMap::new(), Some(Value::Object(args.clone())))
        }
        OperationKind::Read => (Method::GET, entity, BTreeMap::new(), None),
        OperationKind::Update => {
            let body: Map<String, Value> = args
                .iter()
                .filter(|(k, _)| !op.is_key_parameter(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (Method::PATCH, entity, BTreeMap::new(), Some(Value::Object(body)))
        }
        OperationKind::Delete => (Method::DELETE, entity, BTreeMap::new(), None),
        OperationKind::List | OperationKind::Search => {
            (Method::GET, collection, query_options(op, args)?, None)
        }
        OperationKind::Count => {
            let mut query = query_options(op, args)?;
            query.insert(QueryOption::Count, "true".to_string());
            query.insert(QueryOption::Top, "0".to_string());
            (Method::GET, collection, query, None)
        }
        OperationKind::NavigateGet => {
            let nav = navigation_segment(op)?;
            (Method::GET, format!("{entity}/{nav}"), query_options(op, args)?, None)
        }
        OperationKind::NavigateAdd => {
            let nav = navigation_segment(op)?;
            let target = target_url(op, base, args)?;
            let method = if op.navigation.as_ref().is_some_and(|n| n.collection) {
                Method::POST
            } else {
                Method::PUT
            };
            (
                method,
                format!("{entity}/{nav}/$ref"),
                BTreeMap::new(),
                Some(json!({ "@odata.id": target })),
            )
        }
        OperationKind::NavigateRemove => {
            let nav = navigation_segment(op)?;
            let path = format!("{entity}/{nav}/$ref");
            if op.navigation.as_ref().is_some_and(|n| n.collection) {
                let target = target_url(op, base, args)?;
                let url = build_url(&path, &[("$id", target.as_str())])?;
                return Ok(PreparedRequest {
                    method: Method::DELETE,
                    url,
                    body: None,
                    prefer_representation: false,
                });
            }
            (Method::DELETE, path, BTreeMap::new(), None)
        }
    };

    let pairs: Vec<(&str, &str)> = query
        .iter()
        .map(|(option, value)| (option.system_name(), value.as_str()))
        .collect();
    Ok(PreparedRequest {
        method,
        url: build_url(&path, &pairs)?,
        body,
        prefer_representation,
    })
}

fn navigation_segment(op: &OperationDescriptor) -> Result<String, ExecutionError> {
    op.navigation
        .as_ref()
        .map(|n| encode_path_segment(&n.property))
        .ok_or_else(|| {
            ExecutionError::Configuration(format!(
                "operation '{}' has no navigation property",
                op.name
            ))
        })
}

fn target_url(
    op: &OperationDescriptor,
    base: &str,
    args: &Map<String, Value>,
) -> Result<String, ExecutionError> {
    let nav = op.navigation.as_ref().ok_or_else(|| {
        ExecutionError::Configuration(format!("operation '{}' has no navigation property", op.name))
    })?;
    let set = nav.target_entity_set.as_deref().ok_or_else(|| {
        ExecutionError::Configuration(format!(
            "operation '{}' has no target entity set",
            op.name
        ))
    })?;
    Ok(format!(
        "{base}/{}{}",
        encode_path_segment(set),
        format_key_segment(&nav.target_key, args)?
    ))
}

/// Accepted query options present in `args`, keyed (and therefore ordered) by option.
fn query_options(
    op: &OperationDescriptor,
    args: &Map<String, Value>,
) -> Result<BTreeMap<QueryOption, String>, ExecutionError> {
    let mut out = BTreeMap::new();
    for &option in &op.query_options {
        let value = args.get(option.parameter()).filter(|v| !v.is_null());
        let rendered = match option {
            QueryOption::Top => {
                let Some(paging) = op.paging else {
                    if let Some(v) = value {
                        out.insert(option, integer_arg("top", v, 0, u64::MAX)?.to_string());
                    }
                    continue;
                };
                match value {
                    Some(v) => integer_arg("top", v, 1, u64::from(paging.max_top))?.to_string(),
                    None => paging.default_top.to_string(),
                }
            }
            QueryOption::Skip => match value {
                Some(v) => integer_arg("skip", v, 0, u64::MAX)?.to_string(),
                None => continue,
            },
            QueryOption::Count => match value {
                Some(Value::Bool(b)) => b.to_string(),
                Some(other) => {
                    return Err(ExecutionError::Validation(format!(
                        "parameter 'count' must be a boolean, got {other}"
                    )));
                }
                None => continue,
            },
            QueryOption::Search => match value.map(value_to_string) {
                Some(s) if !s.trim().is_empty() => s,
                Some(_) => {
                    return Err(ExecutionError::Validation(
                        "parameter 'search' must not be empty".to_string(),
                    ));
                }
                None => continue,
            },
            _ => match value.map(value_to_string) {
                Some(s) if !s.trim().is_empty() => s,
                _ => continue,
            },
        };
        out.insert(option, rendered);
    }
    Ok(out)
}

fn integer_arg(name: &str, value: &Value, min: u64, max: u64) -> Result<u64, ExecutionError> {
    let n = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if (min..=max).contains(&n) => Ok(n),
        _ if max == u64::MAX => Err(ExecutionError::Validation(format!(
            "parameter '{name}' must be an integer >= {min}, got {value}"
        ))),
        _ => Err(ExecutionError::Validation(format!(
            "parameter '{name}' must be an integer in [{min}, {max}], got {value}"
        ))),
    }
}

fn build_url(path: &str, query: &[(&str, &str)]) -> Result<Url, ExecutionError> {
    let mut url =
        Url::parse(path).map_err(|e| ExecutionError::InvalidUrl(format!("{path}: {e}")))?;
    if !query.is_empty() {
        let query = query
            .iter()
            .map(|(k, v)| format!("{k}={}", encode_query_component(v)))
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }
    Ok(url)
}

/// Percent-encode a query value. Keeps characters that are common in OData expressions and do
/// not break `&`/`=` pair splitting.
fn encode_query_component(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) || is_reserved_but_safe_in_pairs(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn is_unreserved(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~')
}

fn is_reserved_but_safe_in_pairs(b: u8) -> bool {
    matches!(
        b,
        b':' | b'/' | b'?' | b'@' | b'!' | b'$' | b'\'' | b'(' | b')' | b'*' | b',' | b';'
    )
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

pub(crate) fn apply_auth(
    auth: Option<&AuthConfig>,
    request: reqwest::RequestBuilder,
) -> reqwest::RequestBuilder {
    match auth {
        Some(AuthConfig::Bearer { token }) => request.bearer_auth(token),
        Some(AuthConfig::Header { name, value }) => request.header(name, value),
        Some(AuthConfig::Basic { username, password }) => {
            request.basic_auth(username, Some(password))
        }
        Some(AuthConfig::None) | None => request,
    }
}

async fn read_response_body_limited_bytes(
    mut response: reqwest::Response,
    max_bytes: Option<usize>,
) -> Result<Vec<u8>, ExecutionError> {
    let transport = |e: reqwest::Error| ExecutionError::Transport(sanitize_reqwest_error(&e));

    let Some(max) = max_bytes else {
        let bytes = response.bytes().await.map_err(transport)?;
        return Ok(bytes.to_vec());
    };

    if let Some(len) = response.content_length()
        && len > max as u64
    {
        return Err(ExecutionError::Blocked(format!(
            "response too large: {len} bytes (limit {max})"
        )));
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(transport)? {
        if out.len().saturating_add(chunk.len()) > max {
            return Err(ExecutionError::Blocked(format!(
                "response too large: exceeded {max} bytes"
            )));
        }
        out.extend_from_slice(&chunk);
    }

    Ok(out)
}

fn is_empty_body(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

fn parse_body(status: StatusCode, bytes: &[u8]) -> Result<Value, ExecutionError> {
    if is_empty_body(bytes) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| ExecutionError::MalformedResponse {
        status: status.as_u16(),
        message: e.to_string(),
    })
}

/// Map a non-2xx response, pulling the message out of an OData error payload when present.
fn upstream_error(status: StatusCode, bytes: &[u8]) -> ExecutionError {
    let body: Option<Value> = if is_empty_body(bytes) {
        None
    } else {
        Some(
            serde_json::from_slice(bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
        )
    };

    let message = body
        .as_ref()
        .and_then(odata_error_message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());

    ExecutionError::Http {
        status: status.as_u16(),
        message,
        body,
    }
}

fn odata_error_message(body: &Value) -> Option<String> {
    let error = body.get("error").or_else(|| body.get("odata.error"))?;
    match error.get("message")? {
        Value::String(s) => Some(s.clone()),
        // Verbose JSON: {"message": {"lang": "en-US", "value": "..."}}
        Value::Object(m) => m.get("value").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::synthesize;
    use crate::config::ToolProfile;
    use crate::metadata::parse_metadata;
    use std::collections::HashMap;

    fn query_pairs(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    const NORTHWIND: &str = include_str!("../../test-support/fixtures/northwind.xml");
    const BASE: &str = "https://example.com/odata";

    fn catalog() -> Vec<OperationDescriptor> {
        let model = parse_metadata(NORTHWIND).unwrap();
        synthesize(&model, &ToolProfile::default()).unwrap()
    }

    fn op<'a>(ops: &'a [OperationDescriptor], name: &str) -> &'a OperationDescriptor {
        ops.iter().find(|o| o.name == name).unwrap()
    }

    #[test]
    fn read_addresses_entity_by_key() {
        let ops = catalog();
        let req = build_request(op(&ops, "GetProducts"), &json!({"ProductID": 7}), Some(BASE))
            .unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.url.as_str(), "https://example.com/odata/Products(7)");
        assert!(req.body.is_none());

        let req = build_request(
            op(&ops, "GetCustomers"),
            &json!({"CustomerID": "ALFKI"}),
            Some("https://example.com/odata/"),
        )
        .unwrap();
        assert_eq!(req.url.as_str(), "https://example.com/odata/Customers('ALFKI')");
    }

    #[test]
    fn list_writes_only_supplied_options_plus_default_top() {
        let ops = catalog();
        let list = op(&ops, "ListProducts");
        let req = build_request(list, &json!({"top": 5}), Some(BASE)).unwrap();
        assert_eq!(req.url.as_str(), "https://example.com/odata/Products?$top=5");

        let req = build_request(list, &json!({}), Some(BASE)).unwrap();
        assert_eq!(req.url.as_str(), "https://example.com/odata/Products?$top=50");

        let req = build_request(
            list,
            &json!({"top": 10, "filter": "UnitPrice gt 20", "orderby": "ProductName", "select": "ProductID,ProductName", "skip": 20}),
            Some(BASE),
        )
        .unwrap();
        let query = req.url.query().unwrap();
        assert_eq!(
            query,
            "$filter=UnitPrice%20gt%2020&$orderby=ProductName&$select=ProductID,ProductName&$skip=20&$top=10"
        );
    }

    #[test]
    fn top_outside_page_bounds_is_rejected() {
        let ops = catalog();
        let list = op(&ops, "ListProducts");
        for top in [json!(0), json!(1001), json!("many")] {
            let err = build_request(list, &json!({ "top": top }), Some(BASE)).unwrap_err();
            assert_eq!(err.kind(), "validation");
        }
    }

    #[test]
    fn missing_base_is_configuration_error_before_validation() {
        let ops = catalog();
        let err = build_request(op(&ops, "GetProducts"), &json!({}), None).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        let err = build_request(op(&ops, "GetProducts"), &json!({}), Some("  ")).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn missing_or_null_required_parameter_is_validation_error() {
        let ops = catalog();
        let read = op(&ops, "GetProducts");
        for args in [json!({}), json!({"ProductID": null}), Value::Null] {
            let err = build_request(read, &args, Some(BASE)).unwrap_err();
            assert_eq!(err.kind(), "validation");
        }
        let err = build_request(read, &json!([7]), Some(BASE)).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn blank_search_is_rejected_instead_of_dropped() {
        let profile = ToolProfile {
            enable_search: true,
            ..ToolProfile::default()
        };
        let ops = synthesize(&parse_metadata(NORTHWIND).unwrap(), &profile).unwrap();
        let search = op(&ops, "SearchProducts");

        for blank in [json!(""), json!("   ")] {
            let err = build_request(search, &json!({"search": blank}), Some(BASE)).unwrap_err();
            assert!(matches!(err, ExecutionError::Validation(_)), "{err}");
            assert!(err.to_string().contains("search"));
        }

        let req = build_request(search, &json!({"search": "chai"}), Some(BASE)).unwrap();
        assert_eq!(query_pairs(&req.url).get("$search").map(String::as_str), Some("chai"));
    }

    #[test]
    fn create_posts_arguments_verbatim() {
        let ops = catalog();
        let args = json!({"ProductName": "Chai", "Discontinued": false, "UnitPrice": 18});
        let req = build_request(op(&ops, "CreateProducts"), &args, Some(BASE)).unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.url.as_str(), "https://example.com/odata/Products");
        assert_eq!(req.body, Some(args));
        assert!(req.prefer_representation);
    }

    #[test]
    fn update_patches_without_key_properties() {
        let ops = catalog();
        let req = build_request(
            op(&ops, "UpdateOrder_Details"),
            &json!({"OrderID": 10248, "ProductID": 11, "Quantity": 3}),
            Some(BASE),
        )
        .unwrap();
        assert_eq!(req.method, Method::PATCH);
        assert_eq!(
            req.url.as_str(),
            "https://example.com/odata/Order_Details(OrderID=10248,ProductID=11)"
        );
        assert_eq!(req.body, Some(json!({"Quantity": 3})));
    }

    #[test]
    fn count_requests_inline_count_with_zero_top() {
        let ops = catalog();
        let count = op(&ops, "CountProducts");
        let req = build_request(count, &json!({"filter": "Discontinued eq false"}), Some(BASE))
            .unwrap();
        assert_eq!(
            req.url.query(),
            Some("$count=true&$filter=Discontinued%20eq%20false&$top=0")
        );
    }

    #[test]
    fn navigation_requests_use_ref_addressing() {
        let ops = catalog();

        let get = build_request(
            op(&ops, "GetCategoriesProducts"),
            &json!({"CategoryID": 1, "top": 3}),
            Some(BASE),
        )
        .unwrap();
        assert_eq!(
            get.url.as_str(),
            "https://example.com/odata/Categories(1)/Products?$top=3"
        );

        let add = build_request(
            op(&ops, "AddCategoriesProducts"),
            &json!({"CategoryID": 1, "targetProductID": 5}),
            Some(BASE),
        )
        .unwrap();
        assert_eq!(add.method, Method::POST);
        assert_eq!(
            add.url.as_str(),
            "https://example.com/odata/Categories(1)/Products/$ref"
        );
        assert_eq!(
            add.body,
            Some(json!({"@odata.id": "https://example.com/odata/Products(5)"}))
        );

        let set_single = build_request(
            op(&ops, "AddProductsCategory"),
            &json!({"ProductID": 5, "targetCategoryID": 1}),
            Some(BASE),
        )
        .unwrap();
        assert_eq!(set_single.method, Method::PUT);

        let remove = build_request(
            op(&ops, "RemoveCategoriesProducts"),
            &json!({"CategoryID": 1, "targetProductID": 5}),
            Some(BASE),
        )
        .unwrap();
        assert_eq!(remove.method, Method::DELETE);
        assert_eq!(remove.url.path(), "/odata/Categories(1)/Products/$ref");
        assert_eq!(
            query_pairs(&remove.url).get("$id").map(String::as_str),
            Some("https://example.com/odata/Products(5)")
        );

        let unset_single = build_request(
            op(&ops, "RemoveProductsCategory"),
            &json!({"ProductID": 5}),
            Some(BASE),
        )
        .unwrap();
        assert_eq!(
            unset_single.url.as_str(),
            "https://example.com/odata/Products(5)/Category/$ref"
        );
        assert!(unset_single.url.query().is_none());
    }

    #[test]
    fn singleton_operations_have_no_key_segment() {
        let ops = catalog();
        let req = build_request(op(&ops, "GetCompany"), &json!({}), Some(BASE)).unwrap();
        assert_eq!(req.url.as_str(), "https://example.com/odata/Company");
        let req =
            build_request(op(&ops, "UpdateCompany"), &json!({"Name": "Acme"}), Some(BASE)).unwrap();
        assert_eq!(req.body, Some(json!({"Name": "Acme"})));
    }

    #[test]
    fn odata_error_payloads_become_messages() {
        let err = upstream_error(
            StatusCode::NOT_FOUND,
            br#"{"error":{"code":"404","message":"Product 99 not found"}}"#,
        );
        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("Product 99 not found"));

        let err = upstream_error(
            StatusCode::BAD_REQUEST,
            br#"{"odata.error":{"message":{"lang":"en-US","value":"bad filter"}}}"#,
        );
        assert!(err.to_string().contains("bad filter"));

        let err = upstream_error(StatusCode::BAD_GATEWAY, b"");
        assert!(matches!(err, ExecutionError::Http { body: None, .. }));
    }

    #[test]
    fn invalid_json_on_success_is_malformed() {
        let err = parse_body(StatusCode::OK, b"<html>").unwrap_err();
        assert_eq!(err.kind(), "malformed_upstream_response");
        assert_eq!(parse_body(StatusCode::NO_CONTENT, b"").unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let ops = catalog();
        let executor =
            ODataExecutor::new(&ServiceConfig::default(), OutboundHttpSafety::permissive()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .execute(
                op(&ops, "GetProducts"),
                &json!({"ProductID": 1}),
                Some("http://127.0.0.1:9"),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
    }

    #[tokio::test]
    async fn cancel_after_fires() {
        let parent = CancellationToken::new();
        let child = cancel_after(&parent, Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(2), child.cancelled())
            .await
            .expect("child cancelled by timer");
        assert!(!parent.is_cancelled());
    }
}
