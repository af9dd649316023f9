use anyhow::{Context, Result};
use rustls::{client::WebPkiVerifier, Certificate, ClientConfig, RootCertStore};
use rustls_native_certs::load_native_certs;
use rustls_pemfile::certs;
use sha2::{Digest, Sha256};
use std::{fs::File, io::BufReader, sync::Arc, time::SystemTime};
use subtle::ConstantTimeEq;

/// Server certificate verifier that runs normal WebPKI validation and then
/// requires the leaf certificate's SHA-256 fingerprint to match a pin.
struct PinnedVerifier {
    inner: WebPkiVerifier,
    pins: Vec<[u8; 32]>,
}

impl rustls::client::ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &rustls::client::ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp: &[u8],
        now: SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, scts, ocsp, now)?;
        if matches_pin(&self.pins, &end_entity.0) {
            Ok(rustls::client::ServerCertVerified::assertion())
        } else {
            tracing::warn!(server = ?server_name, "certificate pin mismatch");
            Err(rustls::Error::General("certificate pin mismatch".into()))
        }
    }
}

fn matches_pin(pins: &[[u8; 32]], der: &[u8]) -> bool {
    let fingerprint = Sha256::digest(der);
    pins.iter()
        .any(|p| p.as_slice().ct_eq(fingerprint.as_slice()).into())
}

/// Decode hex-encoded SHA-256 pins, rejecting anything that is not 32 bytes.
pub fn parse_pins(cert_pins: &[String]) -> Result<Vec<[u8; 32]>> {
    cert_pins
        .iter()
        .map(|p| {
            let bytes = hex::decode(p.trim()).with_context(|| format!("decoding pin: {p}"))?;
            <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| anyhow::anyhow!("pin {p} is not a SHA-256 digest"))
        })
        .collect()
}

fn root_store(ca_bundle: Option<&str>) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_native_certs().context("loading native certs")? {
        if let Err(e) = store.add(&Certificate(cert.0)) {
            tracing::debug!("skipping native cert: {}", e);
        }
    }
    if let Some(path) = ca_bundle {
        let mut reader = BufReader::new(File::open(path).context("opening CA bundle")?);
        for cert in certs(&mut reader).context("reading CA bundle")? {
            store
                .add(&Certificate(cert))
                .context("adding CA bundle certificate")?;
        }
    }
    Ok(store)
}

/// Build the TLS configuration used for every WebSocket session dial.
/// `cert_pins` must be SHA-256 certificate pins encoded as hexadecimal strings.
pub fn build_tls_config(
    ca_bundle: Option<&str>,
    cert_pins: &[String],
) -> Result<Arc<ClientConfig>> {
    let pins = parse_pins(cert_pins)?;
    let store = root_store(ca_bundle)?;
    let verifier = WebPkiVerifier::new(store.clone(), None);
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(store)
        .with_no_client_auth();
    if !pins.is_empty() {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(PinnedVerifier {
                inner: verifier,
                pins,
            }));
    }
    Ok(Arc::new(config))
}
