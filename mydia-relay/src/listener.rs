use std::net::{SocketAddr, ToSocketAddrs as _};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::TryFutureExt as _;
use serde::Serialize;
use tap::Pipe as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;
use url::Url;

use crate::RelayState;
use crate::config::dto;
use crate::task::{ChildTask, ShutdownSignal, Task};

/// Plain API requests should be quick; the instance tunnel upgrades to a
/// WebSocket whose handling is detached before this deadline matters.
const HTTP_REQUEST_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct ListenerUrls {
    /// URL to use on local network
    pub internal_url: Url,

    /// URL to use from external networks
    pub external_url: Url,
}

pub(crate) fn to_listener_urls(conf: &dto::ListenerConf, hostname: &str) -> anyhow::Result<ListenerUrls> {
    let internal_url = parse_listener_url(&conf.internal_url, "0.0.0.0").context("invalid InternalUrl")?;
    let external_url = parse_listener_url(&conf.external_url, hostname).context("invalid ExternalUrl")?;

    anyhow::ensure!(
        matches!(internal_url.scheme(), "http" | "https"),
        "unsupported listener scheme: {}",
        internal_url.scheme()
    );

    Ok(ListenerUrls {
        internal_url,
        external_url,
    })
}

fn parse_listener_url(url: &str, wildcard_host: &str) -> anyhow::Result<Url> {
    url.replace('*', wildcard_host)
        .parse::<Url>()
        .context("failed to parse URL")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Https,
}

pub struct RelayListener {
    addr: SocketAddr,
    listener_url: Url,
    kind: ListenerKind,
    listener: TcpListener,
    state: RelayState,
}

impl RelayListener {
    /// Must be called from within a Tokio runtime so the socket can be bound.
    pub fn init_and_bind(urls: &ListenerUrls, state: RelayState) -> anyhow::Result<Self> {
        let url = urls.internal_url.clone();

        info!(%url, "Initiating listener…");

        let socket_addr = url_to_socket_addr(&url).context("invalid url")?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.bind(socket_addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the bound TCP socket")?;

        let kind = match url.scheme() {
            "http" => ListenerKind::Http,
            "https" => ListenerKind::Https,
            unsupported => anyhow::bail!("unsupported listener scheme: {unsupported}"),
        };

        info!(?kind, addr = %socket_addr, "Listener started successfully");

        Ok(Self {
            addr: socket_addr,
            listener_url: url,
            kind,
            listener,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    #[instrument("listener", skip(self), fields(port = self.listener_url.port_or_known_default()))]
    pub async fn run(self) -> anyhow::Result<()> {
        match self.kind() {
            ListenerKind::Http => run_http_listener(self.listener, self.state).await,
            ListenerKind::Https => run_https_listener(self.listener, self.state).await,
        }
    }
}

#[async_trait]
impl Task for RelayListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "relay listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn run_http_listener(listener: TcpListener, state: RelayState) -> anyhow::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = state.clone();

                let fut = tokio::time::timeout(HTTP_REQUEST_TIMEOUT, async move {
                    if let Err(e) = handle_http_peer(stream, state, peer_addr).await {
                        error!(error = format!("{e:#}"), "handle_http_peer failed");
                    }
                })
                .map_err(|error| warn!(%error, "request timed out"))
                .instrument(info_span!("http", client = %peer_addr));

                ChildTask::spawn(fut).detach();
            }
            Err(error) => {
                error!(%error, "failed to accept connection");
            }
        }
    }
}

async fn run_https_listener(listener: TcpListener, state: RelayState) -> anyhow::Result<()> {
    let conf = state.conf_handle.get_conf();

    let tls_conf = conf.tls.as_ref().context("TLS configuration is missing")?;

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let tls_acceptor = tls_conf.acceptor.clone();
                let state = state.clone();

                let fut = tokio::time::timeout(HTTP_REQUEST_TIMEOUT, async move {
                    if let Err(e) = handle_https_peer(stream, tls_acceptor, state, peer_addr).await {
                        error!(error = format!("{e:#}"), "handle_https_peer failed");
                    }
                })
                .map_err(|error| warn!(%error, "request timed out"))
                .instrument(info_span!("https", client = %peer_addr));

                ChildTask::spawn(fut).detach();
            }
            Err(error) => {
                error!(%error, "failed to accept connection");
            }
        }
    }
}

async fn handle_https_peer(
    stream: TcpStream,
    tls_acceptor: tokio_rustls::TlsAcceptor,
    state: RelayState,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    let tls_stream = tls_acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?
        .pipe(tokio_rustls::TlsStream::Server);

    handle_http_peer(tls_stream, state, peer_addr).await
}

pub async fn handle_http_peer<I>(io: I, state: RelayState, peer_addr: SocketAddr) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    use axum::extract::connect_info::ConnectInfo;

    let app: axum::Router = crate::api::make_router(state).layer(axum::Extension(ConnectInfo(peer_addr)));

    hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .serve_connection_with_upgrades(
            hyper_util::rt::TokioIo::new(io),
            hyper_util::service::TowerToHyperService::new(app),
        )
        .await
        .map_err(|error| anyhow::anyhow!("HTTP server: {error}"))
}

fn url_to_socket_addr(url: &Url) -> anyhow::Result<SocketAddr> {
    let host = url.host_str().context("URL has no host")?;
    let port = url.port_or_known_default().context("URL has no port")?;

    (host, port)
        .to_socket_addrs()
        .context("couldn't resolve listener address")?
        .next()
        .context("listener address resolved to nothing")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(internal: &str, external: &str) -> dto::ListenerConf {
        dto::ListenerConf {
            internal_url: internal.to_owned(),
            external_url: external.to_owned(),
        }
    }

    #[test]
    fn wildcard_host_is_substituted() {
        let urls = to_listener_urls(&conf("http://*:10256", "https://*:443"), "relay.example").unwrap();

        assert_eq!(urls.internal_url.as_str(), "http://0.0.0.0:10256/");
        assert_eq!(urls.external_url.as_str(), "https://relay.example/");
    }

    #[test]
    fn non_http_schemes_are_refused() {
        assert!(to_listener_urls(&conf("tcp://*:10256", "tcp://*:10256"), "relay.example").is_err());
    }
}
