//! Thin client for the `hook` subcommand: reads one JSON hook payload from
//! stdin and POSTs it to a running service. Built on a raw `TcpStream`
//! HTTP/1.1 request rather than pulling in an HTTP client crate, in the
//! same low-level socket-programming style as the bridge binary.

use color_eyre::eyre::{eyre, Context, Result};
use std::io::Read;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct ParsedUrl {
    host: String,
    port: u16,
    path: String,
}

fn parse_url(url: &str) -> Result<ParsedUrl> {
    let without_scheme = url
        .strip_prefix("http://")
        .ok_or_else(|| eyre!("only http:// URLs are supported, got {url}"))?;
    let (authority, path) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
    let (host, port) = authority
        .split_once(':')
        .map(|(h, p)| Ok::<_, color_eyre::eyre::Error>((h.to_string(), p.parse::<u16>()?)))
        .unwrap_or(Ok((authority.to_string(), 80)))?;
    Ok(ParsedUrl {
        host,
        port,
        path: format!("/{path}"),
    })
}

pub async fn post_hook_from_stdin(base_url: &str) -> Result<()> {
    let mut body = String::new();
    std::io::stdin()
        .read_to_string(&mut body)
        .wrap_err("reading hook payload from stdin")?;

    let parsed = parse_url(&format!("{}/api/hook", base_url.trim_end_matches('/')))?;
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        path = parsed.path,
        host = parsed.host,
        len = body.len(),
    );

    let mut stream = TcpStream::connect((parsed.host.as_str(), parsed.port))
        .await
        .wrap_err_with(|| format!("connecting to {}:{}", parsed.host, parsed.port))?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    let status_line = response.lines().next().unwrap_or("");
    tracing::info!(status = status_line, "hook posted");
    if !status_line.contains("200") {
        return Err(eyre!("hook POST failed: {status_line}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_splits_host_port_and_path() {
        let parsed = parse_url("http://127.0.0.1:3001/api/hook").unwrap();
        assert_eq!(parsed.host, "127.0.0.1");
        assert_eq!(parsed.port, 3001);
        assert_eq!(parsed.path, "/api/hook");
    }

    #[test]
    fn parse_url_defaults_port_80() {
        let parsed = parse_url("http://example.com/api/hook").unwrap();
        assert_eq!(parsed.port, 80);
    }

    #[test]
    fn parse_url_rejects_non_http() {
        assert!(parse_url("https://example.com").is_err());
    }
}
