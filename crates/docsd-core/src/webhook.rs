//! HMAC-SHA256 verification for inbound webhook payloads.
//!
//! The forge REST protocols themselves are out of scope for this core: a
//! forge client parses the payload body into a [`docsd_types::WebhookReceived`]
//! before the trigger layer ever sees it. This module covers the one piece
//! of the HTTP boundary the core still owns the contract for — verifying
//! that a payload actually came from the configured forge, via the
//! `X-Docsd-Signature: sha256=<hex>` convention.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify `signature_header` (the raw `X-Docsd-Signature` header value)
/// against `body` using `secret`.
///
/// Returns [`WebhookError::MissingSignature`] for an empty header,
/// [`WebhookError::MalformedSignature`] when the `sha256=` prefix or hex
/// encoding is wrong, and [`WebhookError::SignatureMismatch`] when the MAC
/// doesn't verify. Comparison is constant-time via [`Mac::verify_slice`].
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature_header: Option<&str>,
) -> Result<(), WebhookError> {
    let header = signature_header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(WebhookError::MissingSignature)?;

    let hex_sig = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| WebhookError::MalformedSignature(header.to_string()))?;

    let expected_bytes =
        hex::decode(hex_sig).map_err(|_| WebhookError::MalformedSignature(header.to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take a key of any size");
    mac.update(body);
    mac.verify_slice(&expected_bytes)
        .map_err(|_| WebhookError::SignatureMismatch)
}

/// Sign `body` with `secret`, producing the `sha256=<hex>` header value a
/// forge (or a test harness standing in for one) would send.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take a key of any size");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_verifies() {
        let secret = "topsecret";
        let body = br#"{"repo_full_name":"org/repo"}"#;
        let header = sign_payload(secret, body);
        assert!(verify_signature(secret, body, Some(&header)).is_ok());
    }

    #[test]
    fn flipped_byte_is_rejected() {
        let secret = "topsecret";
        let body = br#"{"repo_full_name":"org/repo"}"#;
        let mut header = sign_payload(secret, body);
        // Flip the last hex character so it still parses but no longer matches.
        let last = header.pop().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        header.push(flipped);
        assert_eq!(
            verify_signature(secret, body, Some(&header)),
            Err(WebhookError::SignatureMismatch)
        );
    }

    #[test]
    fn missing_prefix_is_malformed() {
        let header = "deadbeef";
        assert!(matches!(
            verify_signature("secret", b"body", Some(header)),
            Err(WebhookError::MalformedSignature(_))
        ));
    }

    #[test]
    fn missing_header_is_rejected() {
        assert_eq!(
            verify_signature("secret", b"body", None),
            Err(WebhookError::MissingSignature)
        );
        assert_eq!(
            verify_signature("secret", b"body", Some("")),
            Err(WebhookError::MissingSignature)
        );
    }

    #[test]
    fn non_hex_signature_is_malformed() {
        assert!(matches!(
            verify_signature("secret", b"body", Some("sha256=not-hex!!")),
            Err(WebhookError::MalformedSignature(_))
        ));
    }

    // The in-process tests above call `verify_signature` directly against a
    // byte slice. This one exercises it against a header and body that
    // actually crossed a socket, the way a forge's delivery would arrive.
    #[test]
    fn verifies_against_a_signature_received_over_real_http() {
        use std::io::Read;
        use std::thread;

        use tiny_http::{Response, Server};

        let secret = "webhook-secret";
        let server = Server::http("127.0.0.1:0").expect("bind test server");
        let addr = server.server_addr().to_string();

        let handle = thread::spawn(move || {
            let mut request = server.recv().expect("receive request");
            let mut body = Vec::new();
            request.as_reader().read_to_end(&mut body).expect("read body");
            let signature = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("X-Docsd-Signature"))
                .map(|h| h.value.as_str().to_string());
            request
                .respond(Response::from_string("ok"))
                .expect("respond");
            (body, signature)
        });

        let body = br#"{"repo_full_name":"org/repo"}"#;
        let signature = sign_payload(secret, body);
        let client = reqwest::blocking::Client::new();
        let response = client
            .post(format!("http://{addr}/webhook"))
            .header("X-Docsd-Signature", &signature)
            .body(body.to_vec())
            .send();
        assert!(response.is_ok(), "request to test server failed");

        let (received_body, received_signature) = handle.join().expect("server thread panicked");
        assert_eq!(received_body, body);
        assert!(verify_signature(secret, &received_body, received_signature.as_deref()).is_ok());
    }
}
