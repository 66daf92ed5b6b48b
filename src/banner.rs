use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use crate::config::ScanConfig;

/// Size and time limits applied to one banner grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BannerLimits {
    pub max_bytes: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl From<&ScanConfig> for BannerLimits {
    fn from(cfg: &ScanConfig) -> Self {
        Self {
            max_bytes: cfg.banner_max_bytes.clamp(16, 64 * 1024),
            connect_timeout: cfg.connect_timeout(),
            read_timeout: cfg.read_timeout(),
        }
    }
}

/// What was learned about a service listening on an open port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BannerInfo {
    pub banner: Option<String>,
    pub service: Option<String>,
}

/// Best-effort enrichment of an open port. Errors never abort a run.
#[async_trait]
pub trait BannerGrabber: Send + Sync {
    async fn grab(&self, host: &str, port: u16, limits: &BannerLimits) -> std::io::Result<BannerInfo>;
}

/// Skips enrichment entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBannerGrabber;

#[async_trait]
impl BannerGrabber for NoopBannerGrabber {
    async fn grab(&self, _host: &str, _port: u16, _limits: &BannerLimits) -> std::io::Result<BannerInfo> {
        Ok(BannerInfo::default())
    }
}

/// Connects over TCP (TLS on TLS ports) and reads what the service says.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBannerGrabber;

const HTTP_PORTS: &[u16] = &[80, 8000, 8080];
const TLS_PORTS: &[u16] = &[443, 8443];

#[async_trait]
impl BannerGrabber for TcpBannerGrabber {
    async fn grab(&self, host: &str, port: u16, limits: &BannerLimits) -> std::io::Result<BannerInfo> {
        let stream = time::timeout(limits.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

        let (banner, cert_cn) = if TLS_PORTS.contains(&port) {
            grab_tls(stream, host, limits).await?
        } else {
            let mut stream = stream;
            if HTTP_PORTS.contains(&port) {
                stream.write_all(head_request(host).as_bytes()).await?;
            }
            (read_banner(&mut stream, limits).await, None)
        };

        let banner = match (banner, cert_cn) {
            (Some(b), _) => Some(b),
            (None, Some(cn)) => Some(format!("tls cn={cn}")),
            (None, None) => None,
        };
        let service = detect_service(port, banner.as_deref().unwrap_or(""));
        Ok(BannerInfo {
            banner,
            service: Some(service.to_string()),
        })
    }
}

async fn grab_tls(
    stream: TcpStream,
    host: &str,
    limits: &BannerLimits,
) -> std::io::Result<(Option<String>, Option<String>)> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(std::io::Error::other)?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let mut tls = time::timeout(limits.connect_timeout, connector.connect(host, stream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timed out"))?
        .map_err(std::io::Error::other)?;

    let cn = tls
        .get_ref()
        .peer_certificate()
        .ok()
        .flatten()
        .and_then(|cert| cert.to_der().ok())
        .and_then(|der| certificate_common_name(&der));

    tls.write_all(head_request(host).as_bytes()).await?;
    Ok((read_banner(&mut tls, limits).await, cn))
}

fn head_request(host: &str) -> String {
    format!("HEAD / HTTP/1.0\r\nHost: {host}\r\n\r\n")
}

/// Subject CN of a DER certificate, if present.
pub fn certificate_common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

/// Read up to `max_bytes` within the read timeout, as single-line lossy UTF-8.
async fn read_banner<S>(stream: &mut S, limits: &BannerLimits) -> Option<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; limits.max_bytes];
    match time::timeout(limits.read_timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let s = String::from_utf8_lossy(&buf);
            let s = s.trim().replace('\n', "\\n").replace('\r', "\\r");
            (!s.is_empty()).then_some(s)
        }
        _ => None,
    }
}

/// Guess the service from the port number and banner text.
pub fn detect_service(port: u16, banner: &str) -> &'static str {
    let lower = banner.to_ascii_lowercase();

    match port {
        22 => return "ssh",
        21 => return "ftp",
        25 => return "smtp",
        80 | 8080 | 8000 => return if lower.contains("http") { "http" } else { "web" },
        443 => return if lower.contains("http") { "https" } else { "tls" },
        _ => {}
    }

    if lower.contains("ssh") {
        "ssh"
    } else if lower.contains("http") {
        "http"
    } else if lower.contains("mysql") {
        "mysql"
    } else if lower.contains("postgres") {
        "postgresql"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn limits() -> BannerLimits {
        BannerLimits {
            max_bytes: 256,
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(300),
        }
    }

    #[test]
    fn service_by_port_then_banner() {
        assert_eq!(detect_service(22, ""), "ssh");
        assert_eq!(detect_service(80, "HTTP/1.1 200 OK"), "http");
        assert_eq!(detect_service(8080, ""), "web");
        assert_eq!(detect_service(443, ""), "tls");
        assert_eq!(detect_service(2222, "SSH-2.0-OpenSSH_9.6"), "ssh");
        assert_eq!(detect_service(3306, "5.7.44 mysql_native_password"), "mysql");
        assert_eq!(detect_service(6000, "\u{0}\u{1}"), "unknown");
    }

    #[test]
    fn limits_follow_scan_config() {
        let cfg = ScanConfig {
            banner_max_bytes: 0,
            connect_timeout_secs: 2,
            ..ScanConfig::default()
        };
        let l = BannerLimits::from(&cfg);
        assert_eq!(l.max_bytes, 16);
        assert_eq!(l.connect_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn grabs_greeting_from_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"SSH-2.0-TestServer\r\n").await.unwrap();
        });

        let info = TcpBannerGrabber.grab("127.0.0.1", port, &limits()).await.unwrap();
        assert_eq!(info.banner.as_deref(), Some("SSH-2.0-TestServer"));
        assert_eq!(info.service.as_deref(), Some("ssh"));
    }

    #[tokio::test]
    async fn silent_service_has_no_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let info = TcpBannerGrabber.grab("127.0.0.1", port, &limits()).await.unwrap();
        assert_eq!(info.banner, None);
        assert_eq!(info.service.as_deref(), Some("unknown"));
    }

    #[test]
    fn garbage_certificate_has_no_cn() {
        assert_eq!(certificate_common_name(b"not a certificate"), None);
    }
}
