//! TLS context and per-connection sessions.
//!
//! A [`TlsContext`] carries the local certificate chain and private key and
//! builds the client and server rustls configurations once; the pool and all
//! sessions share it. A [`TlsSession`] wraps one connection's TLS state and
//! borrows the socket per call and never owns the fd.
//!
//! By default the peer's certificate is requested and captured but accepted
//! without chain validation: peer identity is the embedder's concern above
//! the pool (typically by comparing certificate fingerprints or public
//! keys). [`TlsContext::new`] with a root store enables WebPKI verification
//! instead.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::IpAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, DistinguishedName,
    RootCertStore, ServerConfig, ServerConnection, SignatureScheme,
};

use crate::error::Error;

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake complete; the session is ready for application data.
    Done,
    /// Re-arm for readable and step again.
    WantRead,
    /// Re-arm for writable and step again.
    WantWrite,
}

/// Shared TLS context: certificate, key, and the derived rustls configs.
#[derive(Clone, Debug)]
pub struct TlsContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
    cert: CertificateDer<'static>,
}

impl TlsContext {
    /// Build a context from a certificate chain and private key.
    ///
    /// With `roots = None` peers are required to present a certificate but
    /// it is accepted without chain validation; with a root store both
    /// directions are WebPKI-verified against it.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        roots: Option<RootCertStore>,
    ) -> Result<Self, Error> {
        let cert = chain
            .first()
            .cloned()
            .ok_or_else(|| Error::TlsLoadCert("empty certificate chain".into()))?;

        let algs = rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms;

        let client = match &roots {
            Some(store) => ClientConfig::builder()
                .with_root_certificates(store.clone())
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(|e| Error::TlsKey(e.to_string()))?,
            None => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(algs)))
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(|e| Error::TlsKey(e.to_string()))?,
        };

        let verifier: Arc<dyn ClientCertVerifier> = match roots {
            Some(store) => WebPkiClientVerifier::builder(Arc::new(store))
                .build()
                .map_err(|e| Error::TlsLoadCert(e.to_string()))?,
            None => Arc::new(AcceptAnyClientCert(algs)),
        };
        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .map_err(|e| Error::TlsKey(e.to_string()))?;

        Ok(TlsContext {
            client: Arc::new(client),
            server: Arc::new(server),
            cert,
        })
    }

    /// Build a context from PEM files on disk.
    ///
    /// `key_password` is accepted for call-shape compatibility, but the
    /// rustls stack does not decrypt PEM: encrypted key files yield a typed
    /// [`Error::TlsKey`].
    pub fn from_pem_files(
        cert_path: &str,
        key_path: &str,
        key_password: Option<&str>,
    ) -> Result<Self, Error> {
        let cert_file =
            File::open(cert_path).map_err(|e| Error::TlsX509(format!("{cert_path}: {e}")))?;
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_file))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| Error::TlsX509(format!("{cert_path}: {e}")))?;
        if chain.is_empty() {
            return Err(Error::TlsX509(format!("{cert_path}: no certificates")));
        }

        let mut key_pem = String::new();
        File::open(key_path)
            .and_then(|mut f| f.read_to_string(&mut key_pem))
            .map_err(|e| Error::TlsKey(format!("{key_path}: {e}")))?;
        if key_pem.contains("ENCRYPTED") {
            let _ = key_password;
            return Err(Error::TlsKey(format!(
                "{key_path}: encrypted PEM keys are not supported; provide DER via from_der"
            )));
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(|e| Error::TlsKey(format!("{key_path}: {e}")))?
            .ok_or_else(|| Error::TlsKey(format!("{key_path}: no private key")))?;

        Self::new(chain, key, None)
    }

    /// Build a context from DER-encoded certificate and key.
    pub fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Self, Error> {
        let cert = CertificateDer::from(cert_der);
        let key = PrivateKeyDer::try_from(key_der).map_err(|e| Error::TlsKey(e.to_string()))?;
        Self::new(vec![cert], key, None)
    }

    /// The local end-entity certificate.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert
    }
}

/// Non-blocking TLS session over a borrowed socket.
pub struct TlsSession {
    conn: Connection,
}

impl TlsSession {
    /// Client-side session for an outbound connection to `peer_ip`.
    pub(crate) fn client(
        ctx: &TlsContext,
        peer_ip: IpAddr,
        buffer_limit: usize,
    ) -> Result<Self, Error> {
        let name = ServerName::IpAddress(peer_ip.into());
        let mut conn = ClientConnection::new(ctx.client.clone(), name)
            .map_err(|e| Error::TlsGeneric(e.to_string()))?;
        conn.set_buffer_limit(Some(buffer_limit));
        Ok(TlsSession {
            conn: Connection::from(conn),
        })
    }

    /// Server-side session for an accepted connection.
    pub(crate) fn server(ctx: &TlsContext, buffer_limit: usize) -> Result<Self, Error> {
        let mut conn = ServerConnection::new(ctx.server.clone())
            .map_err(|e| Error::TlsGeneric(e.to_string()))?;
        conn.set_buffer_limit(Some(buffer_limit));
        Ok(TlsSession {
            conn: Connection::from(conn),
        })
    }

    /// Drive one step of the handshake.
    ///
    /// Returns [`HandshakeStatus::Done`] when complete, or which direction
    /// to re-arm for. Any other condition is fatal.
    pub fn handshake<S: Read + Write>(&mut self, sock: &mut S) -> Result<HandshakeStatus, Error> {
        loop {
            while self.conn.wants_write() {
                match self.conn.write_tls(sock) {
                    Ok(0) => return Err(Error::TlsGeneric("socket wrote zero bytes".into())),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::WantWrite);
                    }
                    Err(e) => return Err(Error::TlsGeneric(e.to_string())),
                }
            }
            if !self.conn.is_handshaking() {
                return Ok(HandshakeStatus::Done);
            }
            if self.conn.wants_read() {
                match self.conn.read_tls(sock) {
                    Ok(0) => return Err(Error::TlsGeneric("peer closed during handshake".into())),
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| Error::TlsGeneric(e.to_string()))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::WantRead);
                    }
                    Err(e) => return Err(Error::TlsGeneric(e.to_string())),
                }
            } else {
                // handshaking but neither direction wanted: broken state
                return Err(Error::TlsGeneric("handshake stalled".into()));
            }
        }
    }

    /// Write plaintext. `Ok(n >= 1)` bytes were accepted; `WouldBlock` means
    /// the session can take nothing right now (retry after writable).
    pub fn send<S: Read + Write>(&mut self, sock: &mut S, data: &[u8]) -> io::Result<usize> {
        self.flush(sock)?;
        let n = self.conn.writer().write(data)?;
        self.flush(sock)?;
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    /// Read plaintext into `buf`. `WouldBlock` means no data available;
    /// `Ok(0)` means the peer closed.
    pub fn recv<S: Read + Write>(&mut self, sock: &mut S, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            match self.conn.read_tls(sock) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::other(e.to_string()))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Push buffered ciphertext to the socket; stops silently at WouldBlock.
    pub(crate) fn flush<S: Write>(&mut self, sock: &mut S) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether ciphertext is still buffered and needs a writable socket.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// The peer's end-entity certificate, available once the handshake is
    /// done.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .cloned()
    }
}

/// Extract the SubjectPublicKeyInfo DER from a certificate.
pub fn public_key_der(cert: &CertificateDer<'_>) -> Result<Vec<u8>, Error> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| Error::TlsX509(e.to_string()))?;
    Ok(parsed.public_key().raw.to_vec())
}

/// SHA-256 fingerprint of a certificate's DER encoding.
pub fn fingerprint(cert: &CertificateDer<'_>) -> [u8; 32] {
    crate::hash::sha256(cert.as_ref())
}

/// Accepts any server certificate after verifying handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// Requires a client certificate but accepts any after signature checks.
#[derive(Debug)]
struct AcceptAnyClientCert(WebPkiSupportedAlgorithms);

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::net::UnixStream;

    fn test_context(name: &str) -> TlsContext {
        let ck = rcgen::generate_simple_self_signed(vec![name.into(), "127.0.0.1".into()])
            .expect("cert generation");
        TlsContext::from_der(ck.cert.der().as_ref().to_vec(), ck.key_pair.serialize_der()).unwrap()
    }

    /// Drive both sessions until each reports Done.
    fn complete_handshake(
        client: &mut TlsSession,
        server: &mut TlsSession,
        cs: &mut UnixStream,
        ss: &mut UnixStream,
    ) {
        let mut client_done = false;
        let mut server_done = false;
        for _ in 0..100 {
            if !client_done && client.handshake(cs).unwrap() == HandshakeStatus::Done {
                client_done = true;
            }
            if !server_done && server.handshake(ss).unwrap() == HandshakeStatus::Done {
                server_done = true;
            }
            if client_done && server_done {
                return;
            }
        }
        panic!("handshake did not converge");
    }

    #[test]
    fn context_from_pem_files() {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(ck.cert.pem().as_bytes()).unwrap();
        key_file
            .write_all(ck.key_pair.serialize_pem().as_bytes())
            .unwrap();
        cert_file.flush().unwrap();
        key_file.flush().unwrap();

        let ctx = TlsContext::from_pem_files(
            cert_file.path().to_str().unwrap(),
            key_file.path().to_str().unwrap(),
            None,
        )
        .unwrap();
        assert_eq!(ctx.certificate().as_ref(), ck.cert.der().as_ref());
    }

    #[test]
    fn malformed_pem_is_typed() {
        let mut bogus = tempfile::NamedTempFile::new().unwrap();
        bogus.write_all(b"not a certificate").unwrap();
        bogus.flush().unwrap();
        let path = bogus.path().to_str().unwrap();

        let err = TlsContext::from_pem_files(path, path, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TlsX509);
    }

    #[test]
    fn garbage_der_key_is_typed() {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let err = TlsContext::from_der(ck.cert.der().as_ref().to_vec(), vec![0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TlsKey);
    }

    #[test]
    fn handshake_and_echo_over_socketpair() {
        let ctx_a = test_context("a.test");
        let ctx_b = test_context("b.test");

        let (mut cs, mut ss) = UnixStream::pair().unwrap();
        cs.set_nonblocking(true).unwrap();
        ss.set_nonblocking(true).unwrap();

        let mut client =
            TlsSession::client(&ctx_a, "127.0.0.1".parse().unwrap(), 1 << 16).unwrap();
        let mut server = TlsSession::server(&ctx_b, 1 << 16).unwrap();

        complete_handshake(&mut client, &mut server, &mut cs, &mut ss);

        // mutual certificates captured
        assert_eq!(
            client.peer_certificate().unwrap().as_ref(),
            ctx_b.certificate().as_ref()
        );
        assert_eq!(
            server.peer_certificate().unwrap().as_ref(),
            ctx_a.certificate().as_ref()
        );

        // plaintext roundtrip
        assert_eq!(client.send(&mut cs, b"hello").unwrap(), 5);
        let mut buf = [0u8; 64];
        let mut got = 0;
        for _ in 0..50 {
            match server.recv(&mut ss, &mut buf[got..]) {
                Ok(n) => {
                    got += n;
                    if got >= 5 {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("recv: {e}"),
            }
        }
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn public_key_der_extraction() {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let der = CertificateDer::from(ck.cert.der().as_ref().to_vec());
        let spki = public_key_der(&der).unwrap();
        assert!(!spki.is_empty());
        // stable across calls, distinct from the whole cert
        assert_eq!(spki, public_key_der(&der).unwrap());
        assert_ne!(spki.as_slice(), der.as_ref());
    }

    #[test]
    fn fingerprint_is_sha256_of_der() {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let der = CertificateDer::from(ck.cert.der().as_ref().to_vec());
        assert_eq!(fingerprint(&der), crate::hash::sha256(der.as_ref()));
    }
}
