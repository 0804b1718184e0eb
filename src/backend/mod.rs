//! Backend (worker) endpoint.
//!
//! Workers speak newline-delimited UTF-8 JSON over a long-lived TCP
//! connection: one single-key envelope per line (`IDENTIFY`, `PUBLISH`,
//! admin ops, `ACK` inbound; `OK`, `TOKEN`, `RPC`, `ERROR` outbound). There
//! are no protocol-level reconnection semantics — a worker reidentifies
//! after any disconnect.

pub mod frames;
pub mod handler;

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};

use crate::context::Context;
use crate::error::{BrokerError, BrokerResult};

/// The worker endpoint: accepts framed TCP connections for one broker.
///
/// Cheaply cloneable; constructed through [`Context::backend_endpoint`].
#[derive(Clone)]
pub struct BackendEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    context: Context,
    host: String,
    port: u16,
    running: AtomicBool,
    addr_tx: watch::Sender<Option<SocketAddr>>,
}

impl BackendEndpoint {
    pub(crate) fn new(context: Context, host: &str, port: u16) -> Self {
        let (addr_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(EndpointInner {
                context,
                host: host.to_owned(),
                port,
                running: AtomicBool::new(false),
                addr_tx,
            }),
        }
    }

    /// Accept plaintext worker connections until context shutdown.
    pub async fn listen_and_serve(&self) -> BrokerResult<()> {
        let listener = self.bind().await?;
        let cancel = self.inner.context.cancel_token();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = self.inner.context.clone();
                        context.tracker().clone().spawn(async move {
                            handler::handle_connection(stream, peer, context).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "backend accept failed");
                    }
                }
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Accept worker connections over TLS. `cert` and `key` are PEM file
    /// paths, loaded once at startup.
    pub async fn listen_and_serve_tls(
        &self,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> BrokerResult<()> {
        let acceptor = load_tls_acceptor(cert.as_ref(), key.as_ref())?;
        let listener = self.bind().await?;
        let cancel = self.inner.context.cancel_token();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = self.inner.context.clone();
                        let acceptor = acceptor.clone();
                        context.tracker().clone().spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    handler::handle_connection(tls_stream, peer, context).await;
                                }
                                Err(e) => {
                                    tracing::debug!(%peer, error = ?e, "tls handshake failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "backend accept failed");
                    }
                }
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The bound address, available once the listener is up.
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.inner.addr_tx.borrow()
    }

    /// Wait until the listener is bound and return its address.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.inner.addr_tx.subscribe();
        loop {
            if let Some(addr) = *rx.borrow() {
                return Some(addr);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn bind(&self) -> BrokerResult<TcpListener> {
        let listener =
            TcpListener::bind(format!("{}:{}", self.inner.host, self.inner.port)).await?;
        let local = listener.local_addr()?;
        self.inner.addr_tx.send_replace(Some(local));
        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!(addr = %local, "backend endpoint listening");
        Ok(listener)
    }
}

fn load_tls_acceptor(cert: &Path, key: &Path) -> BrokerResult<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
            .collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
            .ok_or_else(|| BrokerError::Internal("no private key in key file".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| BrokerError::Internal(format!("invalid TLS credentials: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
