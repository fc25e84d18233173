//! HTTP JSON-RPC 1.0 client backed by `reqwest`, as spoken by bitcoind and
//! dcrd. Transient failures are retried with exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::RpcError;
use crate::retry::{RetryConfig, RetryPolicy};

/// Configuration for [`RpcClient`].
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl RpcClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            pass: None,
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

pub struct RpcClient {
    url: String,
    http: reqwest::Client,
    user: Option<String>,
    pass: Option<String>,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Self {
            url: config.url,
            http,
            user: config.user,
            pass: config.pass,
            retry: RetryPolicy::new(config.retry),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and decode its result into `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut attempt = 0u32;
        let value = loop {
            attempt += 1;
            match self.send_once(&body).await {
                Ok(value) => break value,
                Err(e) => match self.retry.delay_for(attempt, &e) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            method,
                            busy = e.is_busy(),
                            error = %e,
                            "retrying RPC request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        if e.is_retryable() {
                            tracing::error!(attempt, method, error = %e, "max retries exceeded");
                        }
                        return Err(e);
                    }
                },
            }
        };

        serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }

    async fn send_once(&self, body: &Value) -> Result<Value, RpcError> {
        let mut req = self.http.post(&self.url).json(body);
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.pass.as_ref());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        // bitcoind answers application errors with HTTP 500 and a JSON body.
        match serde_json::from_str::<Response>(&text) {
            Ok(Response {
                error: Some(err), ..
            }) => Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            }),
            _ if !status.is_success() => Err(RpcError::Http {
                status: status.as_u16(),
                body: text,
            }),
            Ok(Response { result, .. }) => Ok(result.unwrap_or(Value::Null)),
            Err(e) => Err(RpcError::Decode(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one HTTP request (headers and body) and return it as text.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let len = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serve the scripted `(status, body)` responses in order, one per
    /// connection, recording each request.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let request = read_request(&mut stream).await;
                log.lock().unwrap().push(request);
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });
        (url, seen)
    }

    fn fast_retry(url: String) -> RpcClientConfig {
        RpcClientConfig {
            retry: RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                busy_factor: 2,
            },
            ..RpcClientConfig::new(url)
        }
    }

    #[tokio::test]
    async fn call_decodes_result_and_sends_auth() {
        let (url, seen) = serve(vec![(200, r#"{"result":812345,"error":null,"id":1}"#)]).await;
        let client = RpcClient::new(fast_retry(url).with_auth("user", "pass")).unwrap();

        let height: u64 = client.call("getblockcount", vec![]).await.unwrap();
        assert_eq!(height, 812_345);

        let request = seen.lock().unwrap()[0].clone();
        assert!(request.contains(r#""method":"getblockcount""#));
        // base64("user:pass")
        assert!(request.to_lowercase().contains("authorization: basic dxnlcjpwyxnz"));
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let (url, seen) = serve(vec![
            (503, "busy"),
            (503, "busy"),
            (200, r#"{"result":"00ff","error":null,"id":1}"#),
        ])
        .await;
        let client = RpcClient::new(fast_retry(url)).unwrap();

        let hash: String = client.call("getblockhash", vec![json!(7)]).await.unwrap();
        assert_eq!(hash, "00ff");
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        let (url, seen) = serve(vec![(
            500,
            r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":1}"#,
        )])
        .await;
        let client = RpcClient::new(fast_retry(url)).unwrap();

        let err = client
            .call::<String>("getblockhash", vec![json!(99)])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: -8, .. }));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (url, seen) = serve(vec![(502, "bad gateway"); 3]).await;
        let client = RpcClient::new(fast_retry(url)).unwrap();

        let err = client.call::<u64>("getblockcount", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Http { status: 502, .. }));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
