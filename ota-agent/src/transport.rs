//! Byte streams that firmware images are read from.

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::{
    StatusCode,
    blocking::{Client, Response},
};
use tracing::{debug, info};
use url::Url;

#[cfg(all(feature = "allow_http", not(debug_assertions)))]
compile_error!("the `allow_http` feature must not be enabled in release builds");

const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const KEEP_ALIVE_IDLE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed parsing `{0}` as URL")]
    InvalidUrl(String, #[source] url::ParseError),
    #[error("refusing to download over `{0}`, only https is supported")]
    InsecureScheme(String),
    #[error("failed reading trust anchor at `{}`", .0.display())]
    ReadTrustAnchor(PathBuf, #[source] io::Error),
    #[error("trust anchor at `{}` is not a PEM certificate", .0.display())]
    InvalidTrustAnchor(PathBuf, #[source] reqwest::Error),
    #[error("failed initializing HTTP client")]
    BuildClient(#[source] reqwest::Error),
    #[error("failed sending request to `{0}`")]
    Request(Url, #[source] reqwest::Error),
    #[error("server responded to `{url}` with status {status}")]
    Status { url: Url, status: StatusCode },
}

/// Everything needed to open a connection, taken from the settings at update start.
#[derive(Clone, Debug)]
pub struct ConnectRequest<'a> {
    pub url: &'a str,
    /// PEM certificate that replaces the built-in root certificates.
    pub trust_anchor: Option<&'a Path>,
    /// Applies to connecting and to every single read.
    pub timeout: Duration,
    pub keep_alive: bool,
    pub skip_hostname_verification: bool,
}

/// An open download. Dropping it closes the connection.
pub trait Connection: Send {
    /// Reads the next bytes of the body. `Ok(0)` means the stream ended.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether the whole body was received, as opposed to the stream ending early.
    fn is_transfer_complete(&self) -> bool;

    fn content_length(&self) -> Option<u64>;
}

pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn open(&self, request: &ConnectRequest<'_>) -> Result<Self::Connection, Error>;
}

/// Downloads over HTTPS with TLS 1.2 or newer, never following redirects.
#[derive(Clone, Debug, Default)]
pub struct HttpsTransport;

impl HttpsTransport {
    fn http_allowed() -> bool {
        cfg!(any(test, feature = "allow_http"))
    }

    fn client(request: &ConnectRequest<'_>) -> Result<Client, Error> {
        let mut builder = Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .redirect(reqwest::redirect::Policy::none())
            .https_only(!Self::http_allowed())
            .user_agent(APP_USER_AGENT)
            .connect_timeout(request.timeout)
            .timeout(request.timeout)
            .tcp_keepalive(request.keep_alive.then_some(KEEP_ALIVE_IDLE))
            .danger_accept_invalid_hostnames(request.skip_hostname_verification);
        if !request.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }

        builder = match request.trust_anchor {
            Some(path) => {
                let pem = fs::read(path)
                    .map_err(|e| Error::ReadTrustAnchor(path.to_path_buf(), e))?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| Error::InvalidTrustAnchor(path.to_path_buf(), e))?;
                debug!("trusting only the certificate at {path:?}");
                builder.tls_built_in_root_certs(false).add_root_certificate(cert)
            }
            None => builder.tls_built_in_root_certs(true),
        };

        builder.build().map_err(Error::BuildClient)
    }
}

impl Transport for HttpsTransport {
    type Connection = HttpsConnection;

    fn open(&self, request: &ConnectRequest<'_>) -> Result<HttpsConnection, Error> {
        let url = Url::parse(request.url)
            .map_err(|e| Error::InvalidUrl(request.url.to_string(), e))?;
        match url.scheme() {
            "https" => {}
            "http" if Self::http_allowed() => {}
            other => return Err(Error::InsecureScheme(other.to_string())),
        }
        if request.skip_hostname_verification {
            info!("hostname verification is disabled");
        }

        let client = Self::client(request)?;
        let response = client
            .get(url.clone())
            .send()
            .map_err(|e| Error::Request(url.clone(), e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status { url, status });
        }

        let content_length = response.content_length();
        debug!("connected to `{url}`, content length {content_length:?}");
        Ok(HttpsConnection {
            response,
            received: 0,
            content_length,
            ended: false,
        })
    }
}

#[derive(Debug)]
pub struct HttpsConnection {
    response: Response,
    received: u64,
    content_length: Option<u64>,
    ended: bool,
}

impl Connection for HttpsConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.response.read(buf)?;
        if n == 0 {
            self.ended = true;
        }
        self.received += n as u64;
        Ok(n)
    }

    fn is_transfer_complete(&self) -> bool {
        match self.content_length {
            Some(len) => self.received == len,
            None => self.ended,
        }
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}
