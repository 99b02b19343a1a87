//! SigV4 request signing for the cloud model endpoint.
//!
//! The proxy signs on behalf of the sandbox so credentials never enter the
//! container. Signing is delegated to `aws-sigv4`; this module only adapts
//! header maps in and out. Credentials are an immutable snapshot for the
//! life of a proxy instance.

use std::time::SystemTime;

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4;

use crate::error::{Result, WorkspaceError};

/// Credentials snapshot used by the signer.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

impl AwsCredentials {
    pub fn from_config(aws: &crate::config::AwsConfig) -> Self {
        Self {
            access_key_id: aws.access_key_id.clone().unwrap_or_default(),
            secret_access_key: aws.secret_access_key.clone().unwrap_or_default(),
            session_token: aws.session_token.clone(),
            region: aws.region.clone(),
        }
    }
}

/// Sign a request, returning a copy of the headers with the signature
/// fields (date, credential scope, signed headers, signature) added.
pub fn sign_request(
    credentials: &AwsCredentials,
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: &[u8],
    service: &str,
) -> Result<Vec<(String, String)>> {
    sign_request_at(
        credentials,
        method,
        url,
        headers,
        body,
        service,
        SystemTime::now(),
    )
}

/// Signing with an explicit timestamp; split out so the golden-request test
/// can pin the clock.
pub fn sign_request_at(
    credentials: &AwsCredentials,
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: &[u8],
    service: &str,
    at: SystemTime,
) -> Result<Vec<(String, String)>> {
    let identity = Credentials::new(
        credentials.access_key_id.clone(),
        credentials.secret_access_key.clone(),
        credentials.session_token.clone(),
        None,
        "workspace-proxy",
    )
    .into();

    let signing_params = v4::SigningParams::builder()
        .identity(&identity)
        .region(&credentials.region)
        .name(service)
        .time(at)
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| WorkspaceError::Internal {
            reason: format!("signing params: {e}"),
        })?
        .into();

    let signable = SignableRequest::new(
        method,
        url,
        headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        SignableBody::Bytes(body),
    )
    .map_err(|e| WorkspaceError::Internal {
        reason: format!("signable request: {e}"),
    })?;

    let (instructions, _signature) = sign(signable, &signing_params)
        .map_err(|e| WorkspaceError::Internal {
            reason: format!("signing failed: {e}"),
        })?
        .into_parts();

    let mut builder = http::Request::builder().method(method).uri(url);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let mut request = builder.body(()).map_err(|e| WorkspaceError::Internal {
        reason: format!("request build: {e}"),
    })?;
    instructions.apply_to_request_http1x(&mut request);

    Ok(request
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect())
}
