//! HTTP Signatures for inbound deliveries
//!
//! The inbound edge parses the `Signature` header and rebuilds the signing
//! string while it still has the request in hand. Both travel with the
//! queued delivery as [`SignatureParams`], so the processor can verify the
//! signature later against whatever key the sender's actor advertises.
//!
//! Format reference: https://docs.joinmastodon.org/spec/security/

use crate::error::{AppError, FederationError};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum clock skew accepted on the `Date` header, in seconds
const MAX_DATE_SKEW_SECONDS: i64 = 300;

/// Signature material carried from the HTTP edge to the inbox processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureParams {
    /// Either a key URI or an `acct:user@host` handle
    pub key_id: String,
    pub algorithm: String,
    /// Signed header names, lowercased, in signing order
    pub headers: Vec<String>,
    /// Base64-encoded signature value
    pub signature: String,
    /// The exact string the sender signed, rebuilt from the request
    pub signing_string: String,
}

impl SignatureParams {
    /// Parse and pre-check the signature of an inbound request
    ///
    /// Returns `Unauthorized` when no `Signature` header is present and
    /// `Validation` for anything malformed: unsupported algorithm, missing
    /// required signed headers, stale `Date`, or a `Digest` that does not
    /// match the body.
    pub fn from_request(
        method: &str,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<Self, AppError> {
        let signature_header = headers
            .get("signature")
            .ok_or(AppError::Unauthorized)?
            .to_str()
            .map_err(|_| AppError::Validation("Invalid Signature header".to_string()))?;

        let parsed = parse_signature_header(signature_header)?;

        if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
            return Err(AppError::Validation(format!(
                "Unsupported signature algorithm: {}",
                parsed.algorithm
            )));
        }

        for required in ["(request-target)", "host", "date"] {
            if !parsed.headers.iter().any(|h| h == required) {
                return Err(AppError::Validation(format!(
                    "Signed headers must include: {}",
                    required
                )));
            }
        }

        if !body.is_empty() && !parsed.headers.iter().any(|h| h == "digest") {
            return Err(AppError::Validation(
                "Signed headers must include: digest".to_string(),
            ));
        }

        check_date(headers)?;
        if !body.is_empty() {
            verify_digest(headers, body)?;
        }

        let signing_string = build_signing_string(method, path_and_query, headers, &parsed.headers)?;

        Ok(Self {
            key_id: parsed.key_id,
            algorithm: parsed.algorithm,
            headers: parsed.headers,
            signature: parsed.signature,
            signing_string,
        })
    }
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` defaults to `hs2019` and `headers` to `date` when omitted,
/// as draft-cavage allows.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// Rebuild the signing string for the given signed header list
pub fn build_signing_string(
    method: &str,
    path_and_query: &str,
    headers: &http::HeaderMap,
    signed_headers: &[String],
) -> Result<String, AppError> {
    let mut signing_parts = Vec::with_capacity(signed_headers.len());

    for header_name in signed_headers {
        let value = if header_name == "(request-target)" {
            format!("{} {}", method.to_lowercase(), path_and_query)
        } else {
            let values = headers
                .get_all(header_name.as_str())
                .iter()
                .map(|v| {
                    v.to_str().map(str::trim).map_err(|_| {
                        AppError::Validation(format!("Invalid {} header", header_name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if values.is_empty() {
                return Err(AppError::Validation(format!(
                    "Missing {} header",
                    header_name
                )));
            }
            values.join(", ")
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    Ok(signing_parts.join("\n"))
}

/// Reject requests whose `Date` is missing, malformed, or outside the allowed skew
pub fn check_date(headers: &http::HeaderMap) -> Result<(), AppError> {
    let date_str = headers
        .get("date")
        .ok_or_else(|| AppError::Validation("Missing Date header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Validation("Invalid Date header".to_string()))?;

    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;

    let diff = (Utc::now().timestamp() - date.timestamp()).abs();
    if diff > MAX_DATE_SKEW_SECONDS {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    Ok(())
}

/// Compare the `Digest` header against the body
pub fn verify_digest(headers: &http::HeaderMap, body: &[u8]) -> Result<(), AppError> {
    let digest_str = headers
        .get("digest")
        .ok_or_else(|| AppError::Validation("Missing Digest header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Validation("Invalid Digest header".to_string()))?;

    // Several algorithms may be listed; only SHA-256 is checked.
    let expected = generate_digest(body);
    let matches = digest_str.split(',').map(str::trim).any(|candidate| {
        candidate
            .split_once('=')
            .is_some_and(|(alg, _)| alg.eq_ignore_ascii_case("SHA-256"))
            && candidate.get(8..) == expected.get(8..)
    });

    if matches {
        Ok(())
    } else {
        Err(AppError::Validation("Digest mismatch".to_string()))
    }
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Verify a delivery's signature against the sender's public key
pub fn verify_signature(
    params: &SignatureParams,
    public_key_pem: &str,
) -> Result<(), FederationError> {
    let signature_bytes = BASE64
        .decode(&params.signature)
        .map_err(|_| FederationError::InvalidSignature("invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
        .map_err(|e| FederationError::InvalidSignature(format!("invalid public key: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| FederationError::InvalidSignature(format!("invalid signature format: {}", e)))?;

    verifier
        .verify(params.signing_string.as_bytes(), &signature)
        .map_err(|_| FederationError::InvalidSignature("signature mismatch".to_string()))
}

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub host: String,
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    pub digest: Option<String>,
}

/// Sign an HTTP request with RSA-SHA256
///
/// Signs `(request-target) host date` plus `digest` when a body is given.
/// `host` includes the port when the URL carries a non-default one.
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     Some(&body),
///     &private_key,
///     "https://my.server/users/me#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host_name = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    let host = match parsed_url.port() {
        Some(port) => format!("{}:{}", host_name, port),
        None => host_name.to_string(),
    };

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let mut signing_parts = vec![
        format!("(request-target): {} {}", method.to_lowercase(), path_and_query),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))?;
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        BASE64.encode(signature.to_bytes())
    );

    Ok(SignatureHeaders {
        host,
        signature: signature_header,
        date,
        digest,
    })
}
