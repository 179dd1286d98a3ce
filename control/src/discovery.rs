//! Discovery HTTP endpoint
//!
//! Read-only view over the base-path index and the live node registries:
//!
//! | Request           | Response                                        |
//! |-------------------|-------------------------------------------------|
//! | `GET /`           | every base path                                 |
//! | `GET /<basePath>` | node names currently routed for that route set  |
//! | `GET /<other>`    | 404 `{msg, expected, url}`                      |
//! | anything else     | 404 plain text                                  |
//!
//! Lists are JSON arrays unless the client prefers HTML.

use crate::routes::registry::{PrefixIndex, TargetRegistry};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";
const CONTENT_TYPE_TEXT: &str = "text/plain";

#[derive(Debug, Serialize)]
struct UnknownUrl<'a> {
    msg: &'static str,
    expected: Vec<String>,
    url: &'a str,
}

/// Request handler for the discovery listener
#[derive(Debug, Clone)]
pub struct Discovery {
    registry: Arc<TargetRegistry>,
    index: Arc<PrefixIndex>,
}

impl Discovery {
    pub fn new(registry: Arc<TargetRegistry>, index: Arc<PrefixIndex>) -> Self {
        Self { registry, index }
    }

    pub fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        let url = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let accept = req
            .headers()
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        self.respond(req.method(), url, accept)
    }

    /// Route a request by method, path (with query) and Accept header
    pub fn respond(&self, method: &Method, url: &str, accept: &str) -> Response<Full<Bytes>> {
        debug!(method = %method, url = %url, "Discovery request");

        if method != Method::GET {
            return reply(
                StatusCode::NOT_FOUND,
                CONTENT_TYPE_TEXT,
                "only GET supported".to_string(),
            );
        }

        let path = url.split('?').next().unwrap_or(url);
        if let Some(route) = self.index.lookup(path) {
            let names = self.registry.node_names(&route).unwrap_or_default();
            return list_response(path, accept, names);
        }
        if path == "/" {
            return list_response(path, accept, self.index.base_paths());
        }

        let body = UnknownUrl {
            msg: "unknown url",
            expected: self.index.base_paths(),
            url,
        };
        match serde_json::to_string(&body) {
            Ok(json) => reply(StatusCode::NOT_FOUND, CONTENT_TYPE_JSON, json),
            Err(e) => reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                CONTENT_TYPE_TEXT,
                e.to_string(),
            ),
        }
    }
}

/// Serve HTTP/1 on `listener` until the task is dropped
pub async fn serve<H>(listener: TcpListener, name: &'static str, handler: H)
where
    H: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    match listener.local_addr() {
        Ok(addr) => info!(listener = name, "Listening on {}", addr),
        Err(e) => error!(listener = name, "Listener has no local address: {}", e),
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(listener = name, "Accepted connection from {}", peer_addr);
                let handler = handler.clone();

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let response = handler.as_ref()(&req);
                        async move { Ok::<_, Infallible>(response) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(listener = name, "Connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!(listener = name, "Accept error: {}", e);
            }
        }
    }
}

/// Deduplicated list as JSON, or as an HTML list for browsers
fn list_response(path: &str, accept: &str, items: Vec<String>) -> Response<Full<Bytes>> {
    let mut seen = HashSet::new();
    let items: Vec<String> = items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect();

    if accept.starts_with("text/html") {
        return reply(StatusCode::OK, CONTENT_TYPE_HTML, html_list(path, &items));
    }

    match serde_json::to_string(&items) {
        Ok(json) => reply(StatusCode::OK, CONTENT_TYPE_JSON, json),
        Err(e) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            CONTENT_TYPE_TEXT,
            e.to_string(),
        ),
    }
}

/// Links are relative to the request path
fn link_prefix(path: &str) -> String {
    if path == "/" {
        String::new()
    } else if path.ends_with('/') {
        "./".to_string()
    } else {
        format!("{}/", path)
    }
}

fn html_list(path: &str, items: &[String]) -> String {
    let prefix = link_prefix(path);
    let mut html = String::from("<html><body>\r\n  <ul>\r\n");
    for item in items {
        let item = escape_html(item);
        html.push_str(&format!(
            "    <li><a href=\"{}{}\">{}</a></li>\r\n",
            escape_html(&prefix),
            item,
            item
        ));
    }
    html.push_str("  </ul>\r\n</body>\r\n</html>");
    html
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn reply(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::pods::handle_pod_event;
    use crate::apis::watch::EventType;
    use crate::config::{ControllerConfig, RouteSetConfig, TargetConfig};
    use crate::routes::route_set::tests::pod;
    use http_body_util::BodyExt;

    fn rs(id: u32, value: &str) -> RouteSetConfig {
        RouteSetConfig {
            id,
            name: value.to_string(),
            selector_key: "app".to_string(),
            selector_value: value.to_string(),
            port: 80,
            path: format!("/{}/NODENAME", value),
            base_path: Some(format!("/{}", value)),
            generate_name: None,
        }
    }

    fn discovery() -> Discovery {
        let registry = TargetRegistry::from_config(&ControllerConfig {
            targets: vec![TargetConfig {
                namespace: "default".to_string(),
                ingress: "web".to_string(),
                virtual_host: String::new(),
                route_sets: vec![rs(1, "svc1"), rs(2, "svc2")],
            }],
            ..Default::default()
        });
        let index = PrefixIndex::build(&registry).unwrap();
        for (name, node) in [("a", "n1"), ("b", "n2"), ("c", "n1")] {
            handle_pod_event(
                &registry,
                EventType::Added,
                &pod(name, Some(node), ("app", "svc1"), "Running"),
            );
        }
        Discovery::new(Arc::new(registry), Arc::new(index))
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_root_lists_base_paths() {
        let response = discovery().respond(&Method::GET, "/", "");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_JSON
        );
        assert_eq!(body(response).await, r#"["/svc1","/svc2"]"#);
    }

    #[tokio::test]
    async fn test_base_path_lists_distinct_nodes() {
        let discovery = discovery();
        let response = discovery.respond(&Method::GET, "/svc1", "*/*");
        assert_eq!(body(response).await, r#"["n1","n2"]"#);

        let response = discovery.respond(&Method::GET, "/svc2/", "");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "[]");
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let response = discovery().respond(&Method::GET, "/nope?x=1", "");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(json["msg"], "unknown url");
        assert_eq!(json["expected"], serde_json::json!(["/svc1", "/svc2"]));
        assert_eq!(json["url"], "/nope?x=1");
    }

    #[tokio::test]
    async fn test_only_get() {
        let response = discovery().respond(&Method::POST, "/svc1", "");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_TEXT
        );
        assert_eq!(body(response).await, "only GET supported");
    }

    #[tokio::test]
    async fn test_html_for_browsers() {
        let accept = "text/html,application/xhtml+xml,*/*;q=0.8";
        let response = discovery().respond(&Method::GET, "/svc1", accept);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_HTML
        );
        let html = body(response).await;
        assert!(html.contains(r#"<li><a href="/svc1/n1">n1</a></li>"#), "{}", html);
        assert!(html.contains(r#"<li><a href="/svc1/n2">n2</a></li>"#));
    }

    #[test]
    fn test_link_prefix() {
        assert_eq!(link_prefix("/"), "");
        assert_eq!(link_prefix("/svc1/"), "./");
        assert_eq!(link_prefix("/svc1"), "/svc1/");
    }

    #[test]
    fn test_handle_reads_accept_header() {
        let req = Request::builder()
            .uri("/")
            .header(ACCEPT, "text/html")
            .body(())
            .unwrap();
        let response = discovery().handle(&req);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_HTML
        );
    }
}
