//! TLS material handed to broker connectors.
//!
//! The engine never reads certificate files itself; callers load the
//! material and pass it in. It is applied to every `amqps://` connection.

use std::fmt;

use crate::error::{Result, TapError};

/// Client certificate in PKCS#12 form.
#[derive(Clone)]
pub struct ClientIdentity {
    /// DER encoded PKCS#12 archive (certificate + private key).
    pub der: Vec<u8>,
    /// Password protecting the archive.
    pub password: String,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("der", &format_args!("<{} bytes>", self.der.len()))
            .field("password", &"***")
            .finish()
    }
}

/// TLS settings for broker connections.
///
/// The default uses the platform trust store and no client certificate.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Extra CA certificates (PEM) to trust.
    pub cert_chain: Option<String>,
    /// Client certificate for mutual TLS.
    pub identity: Option<ClientIdentity>,
}

impl TlsConfig {
    /// Trust the given PEM encoded CA chain.
    pub fn with_cert_chain(mut self, pem: impl Into<String>) -> Self {
        self.cert_chain = Some(pem.into());
        self
    }

    /// Present a client certificate.
    pub fn with_identity(mut self, der: Vec<u8>, password: impl Into<String>) -> Self {
        self.identity = Some(ClientIdentity {
            der,
            password: password.into(),
        });
        self
    }

    /// Whether anything beyond the platform defaults is configured.
    pub fn is_custom(&self) -> bool {
        self.cert_chain.is_some() || self.identity.is_some()
    }

    /// Check that the material can be handed to a TLS stack.
    ///
    /// The CA chain must hold at least one well formed PEM certificate and a
    /// client identity must not be empty. Failures are
    /// [`TapError::Configuration`] so they are never retried.
    pub fn validate(&self) -> Result<()> {
        if let Some(pem) = &self.cert_chain {
            let mut certificates = 0;
            for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
                cert.map_err(|e| {
                    TapError::Configuration(format!("malformed CA certificate chain: {e}"))
                })?;
                certificates += 1;
            }
            if certificates == 0 {
                return Err(TapError::Configuration(
                    "CA certificate chain contains no PEM certificate".into(),
                ));
            }
        }

        if let Some(identity) = &self.identity {
            if identity.der.is_empty() {
                return Err(TapError::Configuration("client identity is empty".into()));
            }
        }
        Ok(())
    }
}
