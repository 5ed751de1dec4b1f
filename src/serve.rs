//! Preview HTTP server over the output tree, and the live reload hub.
//!
//! The server injects a small client into every HTML page. The client opens a
//! websocket to the hub and either reloads the page or swaps a stylesheet,
//! depending on the [`ReloadEvent`] it receives.

use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use tiny_http::{Header, Request, Response, Server, StatusCode};
use tungstenite::{Message, WebSocket};

use crate::error::{BuildError, Result};
use crate::stage::ReloadEvent;

/// Where the watcher publishes reload notifications
pub type ReloadSink = Sender<ReloadEvent>;

/// Live reload client, `{port}` is replaced with the hub port
const RELOAD_CLIENT: &str = r#"<script>
(function () {
  var ws = new WebSocket("ws://" + location.hostname + ":{port}");
  ws.onmessage = function (msg) {
    var event = JSON.parse(msg.data);
    if (event.type === "reload") {
      location.reload();
    } else if (event.type === "css") {
      var links = document.querySelectorAll('link[rel="stylesheet"]');
      for (var i = 0; i < links.length; i++) {
        var href = links[i].getAttribute("href").split("?")[0];
        if (href.indexOf(event.path) !== -1) {
          links[i].setAttribute("href", href + "?t=" + Date.now());
        }
      }
    }
  };
})();
</script>"#;

fn watch_error(message: impl Into<String>) -> BuildError {
    BuildError::Watch {
        message: message.into(),
    }
}

// =============================================================================
// Reload hub
// =============================================================================

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Websocket server that fans reload events out to every connected page
#[derive(Clone)]
pub struct ReloadHub {
    clients: Clients,
    port: u16,
}

impl ReloadHub {
    /// Bind the hub and start accepting clients on a background thread
    pub fn start(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .map_err(|e| watch_error(format!("cannot bind reload port {port}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| watch_error(e.to_string()))?
            .port();

        let clients: Clients = Arc::default();
        let accepted = Arc::clone(&clients);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        crate::log!("reload"; "accept error: {e}");
                        continue;
                    }
                };
                match tungstenite::accept(stream) {
                    Ok(ws) => {
                        let mut clients = accepted.lock();
                        clients.push(ws);
                        crate::debug!("reload"; "client connected (total: {})", clients.len());
                    }
                    Err(e) => crate::log!("reload"; "handshake failed: {e}"),
                }
            }
        });

        Ok(Self { clients, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Send an event to every client, dropping those that fail.
    /// Returns the number of clients reached.
    pub fn broadcast(&self, event: &ReloadEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                crate::log!("reload"; "cannot encode event: {e}");
                return 0;
            }
        };

        let mut clients = self.clients.lock();
        clients.retain_mut(|ws| ws.send(Message::Text(json.clone().into())).is_ok());
        clients.len()
    }

    /// Forward everything published on `events` until every sender is dropped
    pub fn forward(&self, events: Receiver<ReloadEvent>) -> JoinHandle<()> {
        let hub = self.clone();
        thread::spawn(move || {
            for event in events {
                let reached = hub.broadcast(&event);
                crate::debug!("reload"; "{event:?} -> {reached} client(s)");
            }
        })
    }
}

// =============================================================================
// Preview server
// =============================================================================

/// Outcome of mapping a request URL onto the output tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    File(PathBuf),
    Forbidden,
    NotFound,
}

/// Serve `root` on `port`, injecting a reload client that talks to `reload_port`
pub fn start_preview(root: PathBuf, port: u16, reload_port: u16) -> Result<u16> {
    let server = Server::http(("127.0.0.1", port))
        .map_err(|e| watch_error(format!("cannot bind preview port {port}: {e}")))?;
    let port = server
        .server_addr()
        .to_ip()
        .map(|addr| addr.port())
        .unwrap_or(port);

    thread::spawn(move || {
        for request in server.incoming_requests() {
            if let Err(e) = respond(request, &root, reload_port) {
                crate::debug!("serve"; "response failed: {e}");
            }
        }
    });

    Ok(port)
}

fn respond(request: Request, root: &Path, reload_port: u16) -> std::io::Result<()> {
    crate::debug!("serve"; "{} {}", request.method(), request.url());
    match resolve_request(request.url(), root) {
        Resolved::File(path) => {
            let content_type = content_type(&path);
            let body = fs::read(&path)?;
            let body = if content_type.starts_with("text/html") {
                inject_reload_client(&body, reload_port)
            } else {
                body
            };
            send(request, 200, content_type, body)
        }
        Resolved::Forbidden => send(request, 403, "text/plain", b"403 Forbidden".to_vec()),
        Resolved::NotFound => send(request, 404, "text/plain", b"404 Not Found".to_vec()),
    }
}

fn send(request: Request, status: u16, content_type: &str, body: Vec<u8>) -> std::io::Result<()> {
    let mut response = Response::from_data(body).with_status_code(StatusCode(status));
    if let Ok(header) = Header::from_bytes("Content-Type", content_type) {
        response.add_header(header);
    }
    request.respond(response)
}

/// Map a request URL to a file under `root`; `/` and directories map to `index.html`
pub fn resolve_request(url: &str, root: &Path) -> Resolved {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let Ok(decoded) = percent_decode_str(path).decode_utf8() else {
        return Resolved::NotFound;
    };

    let relative = Path::new(decoded.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Resolved::Forbidden;
    }

    let mut local = root.join(relative);
    if local.is_dir() {
        local = local.join("index.html");
    }
    if local.is_file() {
        Resolved::File(local)
    } else {
        Resolved::NotFound
    }
}

/// Insert the reload client before the last `</body>`, or append it
pub fn inject_reload_client(html: &[u8], reload_port: u16) -> Vec<u8> {
    const PATTERN: &[u8] = b"</body>";

    let script = RELOAD_CLIENT.replace("{port}", &reload_port.to_string());
    let at = html
        .windows(PATTERN.len())
        .rposition(|w| w.eq_ignore_ascii_case(PATTERN))
        .unwrap_or(html.len());

    let mut out = Vec::with_capacity(html.len() + script.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(script.as_bytes());
    out.extend_from_slice(&html[at..]);
    out
}

/// Content type from the file extension
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("txt") => "text/plain; charset=utf-8",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
