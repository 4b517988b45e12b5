//! Outbound SAML messages: signed assertions, status and logout responses,
//! and the redirect/POST bindings that carry them.
//!
//! The signature is XML-DSig shaped but computed over the serialized bytes
//! as emitted; there is no canonicalization step.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use quick_xml::escape::escape;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::io::Write;
use uuid::Uuid;

use super::SamlError;

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const STATUS_REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";
pub const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";
pub const STATUS_AUTHN_FAILED: &str = "urn:oasis:names:tc:SAML:2.0:status:AuthnFailed";

/// Assertions are valid from five minutes before issue to five after.
const VALIDITY_SKEW_MINUTES: i64 = 5;

pub fn saml_id() -> String {
    format!("_{}", Uuid::new_v4().simple())
}

fn instant(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Base64 body of the first `CERTIFICATE` PEM block.
pub fn certificate_body(pem: &str) -> Result<String, SamlError> {
    let begin = "-----BEGIN CERTIFICATE-----";
    let end = "-----END CERTIFICATE-----";
    let start = pem
        .find(begin)
        .ok_or_else(|| SamlError::Configuration("Certificate PEM block not found".to_string()))?
        + begin.len();
    let stop = pem[start..]
        .find(end)
        .ok_or_else(|| SamlError::Configuration("Certificate PEM block is truncated".to_string()))?
        + start;
    let body: String = pem[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(body.as_bytes())
        .map_err(|e| SamlError::Configuration(format!("Certificate is not valid base64: {}", e)))?;
    Ok(body)
}

/// An application's parsed key pair.
pub struct SigningMaterial {
    key: SigningKey<Sha256>,
    certificate_b64: String,
}

impl SigningMaterial {
    /// Accepts PKCS#8 or PKCS#1 private keys.
    pub fn from_pem(private_key_pem: &str, certificate_pem: &str) -> Result<Self, SamlError> {
        if private_key_pem.trim().is_empty() || certificate_pem.trim().is_empty() {
            return Err(SamlError::Configuration(
                "Application has no SAML signing key pair".to_string(),
            ));
        }
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| e.to_string())
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem).map_err(|e| e.to_string()))
            .map_err(|e| SamlError::Configuration(format!("Invalid SAML private key: {}", e)))?;
        Ok(Self {
            key: SigningKey::<Sha256>::new(private_key),
            certificate_b64: certificate_body(certificate_pem)?,
        })
    }

    pub fn certificate_b64(&self) -> &str {
        &self.certificate_b64
    }

    fn sign(&self, data: &[u8]) -> Result<String, SamlError> {
        let signature = self
            .key
            .try_sign(data)
            .map_err(|e| SamlError::Configuration(format!("RSA signing failed: {}", e)))?;
        Ok(STANDARD.encode(signature.to_bytes()))
    }

    /// Insert an enveloped `ds:Signature` after the element's `saml:Issuer`.
    fn sign_element(&self, xml: &str, reference_id: &str) -> Result<String, SamlError> {
        let digest = STANDARD.encode(Sha256::digest(xml.as_bytes()));
        let signed_info = format!(
            concat!(
                r#"<ds:SignedInfo>"#,
                r#"<ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/>"#,
                r#"<ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"/>"#,
                r##"<ds:Reference URI="#{id}">"##,
                r#"<ds:Transforms>"#,
                r#"<ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/>"#,
                r#"<ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/>"#,
                r#"</ds:Transforms>"#,
                r#"<ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/>"#,
                r#"<ds:DigestValue>{digest}</ds:DigestValue>"#,
                r#"</ds:Reference>"#,
                r#"</ds:SignedInfo>"#
            ),
            id = reference_id,
            digest = digest,
        );
        let signature_value = self.sign(signed_info.as_bytes())?;
        let signature = format!(
            concat!(
                r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">"#,
                "{signed_info}",
                r#"<ds:SignatureValue>{value}</ds:SignatureValue>"#,
                r#"<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>"#,
                r#"</ds:Signature>"#
            ),
            signed_info = signed_info,
            value = signature_value,
            cert = self.certificate_b64,
        );

        let issuer_end = "</saml:Issuer>";
        let at = xml
            .find(issuer_end)
            .map(|i| i + issuer_end.len())
            .ok_or_else(|| SamlError::Responder("Assertion has no Issuer".to_string()))?;
        let mut signed = String::with_capacity(xml.len() + signature.len());
        signed.push_str(&xml[..at]);
        signed.push_str(&signature);
        signed.push_str(&xml[at..]);
        Ok(signed)
    }
}

/// Everything that goes into one assertion.
pub struct AssertionParams<'a> {
    pub idp_entity_id: &'a str,
    pub audience: &'a str,
    pub destination: &'a str,
    pub in_response_to: Option<&'a str>,
    pub name_id: &'a str,
    pub name_id_format: &'a str,
    pub session_index: &'a str,
    pub attributes: Vec<(&'a str, Vec<String>)>,
    pub now: DateTime<Utc>,
}

fn in_response_to_attr(in_response_to: Option<&str>) -> String {
    in_response_to
        .map(|id| format!(r#" InResponseTo="{}""#, escape(id)))
        .unwrap_or_default()
}

fn build_assertion(params: &AssertionParams<'_>, assertion_id: &str) -> String {
    let not_before = instant(params.now - Duration::minutes(VALIDITY_SKEW_MINUTES));
    let not_on_or_after = instant(params.now + Duration::minutes(VALIDITY_SKEW_MINUTES));
    let issue_instant = instant(params.now);

    let mut attributes = String::new();
    for (name, values) in &params.attributes {
        attributes.push_str(&format!(
            r#"<saml:Attribute Name="{}" NameFormat="urn:oasis:names:tc:SAML:2.0:attrname-format:basic">"#,
            escape(*name)
        ));
        for value in values {
            attributes.push_str(&format!(
                r#"<saml:AttributeValue>{}</saml:AttributeValue>"#,
                escape(value.as_str())
            ));
        }
        attributes.push_str("</saml:Attribute>");
    }

    format!(
        concat!(
            r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{issue_instant}">"#,
            r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
            r#"<saml:Subject>"#,
            r#"<saml:NameID Format="{name_id_format}">{name_id}</saml:NameID>"#,
            r#"<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">"#,
            r#"<saml:SubjectConfirmationData{in_response_to} NotOnOrAfter="{not_on_or_after}" Recipient="{destination}"/>"#,
            r#"</saml:SubjectConfirmation>"#,
            r#"</saml:Subject>"#,
            r#"<saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}">"#,
            r#"<saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>"#,
            r#"</saml:Conditions>"#,
            r#"<saml:AuthnStatement AuthnInstant="{issue_instant}" SessionIndex="{session_index}">"#,
            r#"<saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext>"#,
            r#"</saml:AuthnStatement>"#,
            r#"<saml:AttributeStatement>{attributes}</saml:AttributeStatement>"#,
            r#"</saml:Assertion>"#
        ),
        id = assertion_id,
        issue_instant = issue_instant,
        issuer = escape(params.idp_entity_id),
        name_id_format = escape(params.name_id_format),
        name_id = escape(params.name_id),
        in_response_to = in_response_to_attr(params.in_response_to),
        not_on_or_after = not_on_or_after,
        destination = escape(params.destination),
        not_before = not_before,
        audience = escape(params.audience),
        session_index = escape(params.session_index),
        attributes = attributes,
    )
}

fn wrap_response(
    issuer: &str,
    destination: &str,
    in_response_to: Option<&str>,
    now: DateTime<Utc>,
    status_code: &str,
    status_message: Option<&str>,
    body: &str,
) -> String {
    let message = status_message
        .map(|m| format!("<samlp:StatusMessage>{}</samlp:StatusMessage>", escape(m)))
        .unwrap_or_default();
    format!(
        concat!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{destination}"{in_response_to}>"#,
            r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
            r#"<samlp:Status><samlp:StatusCode Value="{status}"/>{message}</samlp:Status>"#,
            "{body}",
            r#"</samlp:Response>"#
        ),
        id = saml_id(),
        issue_instant = instant(now),
        destination = escape(destination),
        in_response_to = in_response_to_attr(in_response_to),
        issuer = escape(issuer),
        status = status_code,
        message = message,
        body = body,
    )
}

/// A successful `samlp:Response` carrying one signed assertion.
pub fn signed_response(
    params: &AssertionParams<'_>,
    material: &SigningMaterial,
) -> Result<String, SamlError> {
    let assertion_id = saml_id();
    let assertion = build_assertion(params, &assertion_id);
    let signed = material.sign_element(&assertion, &assertion_id)?;
    Ok(wrap_response(
        params.idp_entity_id,
        params.destination,
        params.in_response_to,
        params.now,
        STATUS_SUCCESS,
        None,
        &signed,
    ))
}

/// A `samlp:Response` with a non-success status and no assertion.
pub fn status_response(
    issuer: &str,
    destination: &str,
    in_response_to: Option<&str>,
    now: DateTime<Utc>,
    status_code: &str,
    message: &str,
) -> String {
    wrap_response(issuer, destination, in_response_to, now, status_code, Some(message), "")
}

pub fn logout_response(
    issuer: &str,
    destination: &str,
    in_response_to: &str,
    now: DateTime<Utc>,
) -> String {
    format!(
        concat!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{destination}" InResponseTo="{in_response_to}">"#,
            r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
            r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
            r#"</samlp:LogoutResponse>"#
        ),
        id = saml_id(),
        issue_instant = instant(now),
        destination = escape(destination),
        in_response_to = escape(in_response_to),
        issuer = escape(issuer),
        status = STATUS_SUCCESS,
    )
}

// ==================== Bindings ====================

/// Raw DEFLATE then base64, as the HTTP-Redirect binding expects.
pub fn deflate_base64(xml: &str) -> Result<String, SamlError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| SamlError::Responder(format!("DEFLATE failed: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| SamlError::Responder(format!("DEFLATE failed: {}", e)))?;
    Ok(STANDARD.encode(compressed))
}

pub fn redirect_location(
    destination: &str,
    param: &str,
    xml: &str,
    relay_state: Option<&str>,
) -> Result<String, SamlError> {
    let encoded = deflate_base64(xml)?;
    let separator = if destination.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}{}={}",
        destination,
        separator,
        param,
        urlencoding::encode(&encoded)
    );
    if let Some(relay_state) = relay_state {
        url.push_str(&format!("&RelayState={}", urlencoding::encode(relay_state)));
    }
    Ok(url)
}

/// Auto-submitting HTML form for the HTTP-POST binding.
pub fn post_form(action: &str, param: &str, xml: &str, relay_state: Option<&str>) -> String {
    let encoded = STANDARD.encode(xml.as_bytes());
    let relay = relay_state
        .map(|r| format!(r#"<input type="hidden" name="RelayState" value="{}"/>"#, escape(r)))
        .unwrap_or_default();
    format!(
        concat!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Continue</title></head>",
            "<body onload=\"document.forms[0].submit()\">",
            r#"<form method="post" action="{action}">"#,
            r#"<input type="hidden" name="{param}" value="{value}"/>{relay}"#,
            r#"<noscript><button type="submit">Continue</button></noscript>"#,
            "</form></body></html>"
        ),
        action = escape(action),
        param = param,
        value = encoded,
        relay = relay,
    )
}
