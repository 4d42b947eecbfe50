#![cfg(feature = "tls")]

//! TLS-enabled HTTP server for secure connections.
//!
//! Terminates TLS with rustls and serves the same pipeline handler as the
//! plain listener. Certificate and key paths come from the caller (or the
//! `SSL_CERT`/`SSL_KEY` configuration). Requests served here carry a
//! [`TlsConnection`] extension marker so stages like CSRF can tell a secure
//! request from a forwarded one.

use std::{convert::Infallible, fs::File, io::BufReader, sync::Arc};

use hyper::{server::conn::http1, service::service_fn};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpListener;
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};

use crate::{
    body::HibanaBody,
    config,
    handler::BoxHandler,
    types::{BoxError, Response, TlsConnection},
};

/// Starts the HTTPS server with the given listener, handler, and PEM files.
///
/// Falls back to the configured `SSL_CERT`/`SSL_KEY` paths when `certs` or
/// `key` is `None`. Certificate problems abort boot.
pub async fn serve_tls(
    listener: TcpListener,
    handler: BoxHandler,
    certs: Option<&str>,
    key: Option<&str>,
) {
    run(listener, handler, certs, key)
        .await
        .expect("TLS server failed to start");
}

async fn run(
    listener: TcpListener,
    handler: BoxHandler,
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<(), BoxError> {
    let active = config::current();
    let cert_path = cert_path
        .map(str::to_string)
        .or_else(|| active.ssl_cert.clone())
        .ok_or("no TLS certificate configured (SSL_CERT)")?;
    let key_path = key_path
        .map(str::to_string)
        .or_else(|| active.ssl_key.clone())
        .ok_or("no TLS key configured (SSL_KEY)")?;

    let mut tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(&cert_path)?, load_key(&key_path)?)?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let handler = Arc::new(handler);

    tracing::info!(addr = %listener.local_addr()?, "hibana listening (tls)");

    loop {
        let (stream, addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(error = %e, "TLS handshake failed");
                    return;
                }
            };

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let handler = handler.clone();
                async move {
                    let mut req = req.map(HibanaBody::new);
                    req.extensions_mut().insert(addr);
                    req.extensions_mut().insert(TlsConnection);
                    let response = match handler.call(req).await {
                        Ok(response) => response,
                        Err(err) => {
                            let mut res =
                                Response::new(HibanaBody::from(err.to_json_body(false)));
                            *res.status_mut() = err.status();
                            if let Ok(value) = "application/json".parse() {
                                res.headers_mut().insert(http::header::CONTENT_TYPE, value);
                            }
                            res
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            let mut h1 = http1::Builder::new();
            h1.keep_alive(true);
            if let Err(e) = h1.serve_connection(io, svc).with_upgrades().await {
                tracing::debug!(error = %e, "TLS connection closed with error");
            }
        });
    }
}

/// Loads TLS certificates from a PEM-encoded file.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, BoxError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Result<Vec<_>, _> = certs(&mut reader).collect();
    Ok(certs?)
}

/// Loads a PKCS#8 private key from a PEM-encoded file.
fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, BoxError> {
    let mut reader = BufReader::new(File::open(path)?);
    let key = pkcs8_private_keys(&mut reader)
        .next()
        .ok_or("no private key found")??;
    Ok(key.into())
}
