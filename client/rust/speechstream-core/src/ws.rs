use anyhow::Result;
use url::Url;

#[cfg(feature = "ws")]
use tokio::net::TcpStream;
#[cfg(feature = "ws")]
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
#[cfg(feature = "ws")]
use tokio_tungstenite::tungstenite::http::HeaderValue;
#[cfg(feature = "ws")]
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

#[cfg(feature = "ws")]
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake header carrying the API key.
pub const API_KEY_HEADER: &str = "xi-api-key";

/// Query keys whose values must never reach a log line.
const SECRET_QUERY_KEYS: &[&str] = &["xi_api_key", "xi-api-key"];

pub fn build_ws_url(base: &str, path: &str, query: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse(base)?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => anyhow::bail!("unsupported websocket scheme '{other}' in {base}"),
    }

    if !path.is_empty() {
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}/{}", path.trim_start_matches('/')));
    }

    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }

    Ok(url)
}

#[cfg(feature = "ws")]
pub async fn connect_ws(url: &Url, api_key: Option<&str>) -> Result<WsStream> {
    let mut req = url.as_str().into_client_request()?;

    if let Some(key) = api_key {
        let mut header_value = HeaderValue::from_str(key)?;
        header_value.set_sensitive(true);
        req.headers_mut().insert(API_KEY_HEADER, header_value);
    }

    let (ws_stream, resp) = connect_async(req).await?;
    tracing::debug!(status = %resp.status(), url = %redact_ws_url(url), "websocket handshake complete");

    Ok(ws_stream)
}

pub fn redact_ws_url(url: &Url) -> String {
    let mut url = url.clone();
    if url.query().is_none() {
        return url.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if SECRET_QUERY_KEYS.contains(&k.as_ref()) {
                (k.to_string(), "REDACTED".to_string())
            } else {
                (k.to_string(), v.to_string())
            }
        })
        .collect();

    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.to_string()
}
