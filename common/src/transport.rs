use crate::error::{RelayError, Result};
use quinn::{ClientConfig, Endpoint, ServerConfig, TransportConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const SERVER_NAME: &str = "localhost";

/// QUIC client endpoint that skips server certificate checks (self-signed
/// development certificates).
pub fn client_endpoint() -> Result<Endpoint> {
    let bind: SocketAddr = ([0, 0, 0, 0], 0).into();
    let mut endpoint = Endpoint::client(bind)?;

    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    let mut client_config = ClientConfig::new(Arc::new(crypto));
    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(100_u32.into());
    transport_config.max_idle_timeout(Duration::from_secs(60).try_into().ok());
    transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
    client_config.transport_config(Arc::new(transport_config));

    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// QUIC server endpoint with a freshly generated self-signed certificate.
pub fn server_endpoint(addr: SocketAddr) -> Result<Endpoint> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .map_err(|e| RelayError::QuicError(e.to_string()))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| RelayError::QuicError(e.to_string()))?;
    let key_der = cert.serialize_private_key_der();

    let cert_chain = vec![rustls::Certificate(cert_der)];
    let key = rustls::PrivateKey(key_der);

    let mut server_config = ServerConfig::with_single_cert(cert_chain, key)
        .map_err(|e| RelayError::QuicError(e.to_string()))?;

    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(100_u32.into());
    transport_config.max_concurrent_bidi_streams(10_u32.into());
    transport_config.max_idle_timeout(Duration::from_secs(300).try_into().ok());
    transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
    server_config.transport_config(Arc::new(transport_config));

    Endpoint::server(server_config, addr).map_err(|e| RelayError::QuicError(e.to_string()))
}

// 跳过服务器证书验证
struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
