use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::CACHE_CONTROL;

use super::proxy::{EgressProxy, ProxyConfig};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether a URL is reachable. Implementations never fail: every
/// error is an unavailable link.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, url: &str) -> impl Future<Output = bool> + Send;
}

/// HEAD probe with a hard timeout.
///
/// Any response counts as reachable, whatever its status. This mirrors an
/// opaque cross-origin fetch, which can tell that a server answered but not
/// what it said, so a 404 or 500 is still "available" here.
pub struct HttpProber {
    egress: Arc<EgressProxy>,
    timeout: Duration,
    cached: Mutex<Option<(Option<ProxyConfig>, reqwest::Client)>>,
}

impl HttpProber {
    pub fn new(egress: Arc<EgressProxy>) -> Self {
        Self {
            egress,
            timeout: PROBE_TIMEOUT,
            cached: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Client for the egress path currently installed, rebuilt only when the
    /// proxy configuration changes.
    fn client(&self) -> Result<reqwest::Client, String> {
        let proxy = self.egress.current();
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((config, client)) = cached.as_ref() {
            if *config == proxy {
                return Ok(client.clone());
            }
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .pool_max_idle_per_host(8);
        builder = match proxy.as_ref() {
            Some(config) => builder.proxy(config.to_reqwest().map_err(|e| e.to_string())?),
            None => builder.no_proxy(),
        };
        let client = builder.build().map_err(|e| e.to_string())?;
        *cached = Some((proxy, client.clone()));
        Ok(client)
    }
}

impl Probe for HttpProber {
    async fn probe(&self, url: &str) -> bool {
        let client = match self.client() {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(error = %err, "failed to build probe client");
                return false;
            }
        };
        match client
            .head(url)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await
        {
            Ok(response) => {
                tracing::debug!(url, status = response.status().as_u16(), "reachable");
                true
            }
            Err(err) => {
                tracing::debug!(url, error = %err, "unreachable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/page")
    }

    #[tokio::test]
    async fn any_status_counts_as_available() {
        let prober = HttpProber::new(Arc::new(EgressProxy::new()));
        let url = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        assert!(prober.probe(&url).await);
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let prober = HttpProber::new(Arc::new(EgressProxy::new()));
        assert!(!prober.probe(&format!("http://{addr}/")).await);
    }

    #[tokio::test]
    async fn silent_server_times_out_as_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = thread::spawn(move || {
            let accepted = listener.accept();
            thread::sleep(Duration::from_secs(2));
            drop(accepted);
        });
        let prober = HttpProber::new(Arc::new(EgressProxy::new()))
            .with_timeout(Duration::from_millis(200));
        assert!(!prober.probe(&format!("http://{addr}/")).await);
    }

    #[tokio::test]
    async fn non_http_urls_are_unavailable() {
        let prober = HttpProber::new(Arc::new(EgressProxy::new()));
        assert!(!prober.probe("javascript:void(0)").await);
        assert!(!prober.probe("not a url").await);
    }
}
