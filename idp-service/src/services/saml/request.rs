//! Inbound SAML messages: binding decoding plus `AuthnRequest` and
//! `LogoutRequest` parsing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::DeflateDecoder;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::io::Read;

use super::SamlError;

/// Encoded messages above this size are rejected before decoding.
const MAX_ENCODED_LEN: usize = 512 * 1024;
/// Upper bound on inflated redirect-binding payloads.
const MAX_INFLATED_LEN: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamlBinding {
    /// HTTP-Redirect: raw DEFLATE, then base64, in the query string.
    Redirect,
    /// HTTP-POST: base64 in a form field.
    Post,
}

/// Decode a `SAMLRequest` parameter into its XML text.
pub fn decode_message(encoded: &str, binding: SamlBinding) -> Result<String, SamlError> {
    if encoded.len() > MAX_ENCODED_LEN {
        return Err(SamlError::Requester("SAML message too large".to_string()));
    }
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SamlError::Requester(format!("Invalid base64: {}", e)))?;

    let bytes = match binding {
        SamlBinding::Post => raw,
        SamlBinding::Redirect => {
            let mut inflated = Vec::new();
            DeflateDecoder::new(raw.as_slice())
                .take(MAX_INFLATED_LEN)
                .read_to_end(&mut inflated)
                .map_err(|e| SamlError::Requester(format!("Invalid DEFLATE payload: {}", e)))?;
            inflated
        }
    };

    String::from_utf8(bytes).map_err(|e| SamlError::Requester(format!("Invalid UTF-8: {}", e)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthnRequest {
    pub id: String,
    pub issuer: String,
    pub acs_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogoutRequest {
    pub id: String,
    pub issuer: String,
    pub name_id: String,
    pub session_index: Option<String>,
}

/// Root element attributes and the text of selected child elements.
#[derive(Default)]
struct Scanned {
    root: Option<String>,
    root_attrs: Vec<(String, String)>,
    texts: Vec<(String, String)>,
}

impl Scanned {
    fn attr(&self, name: &str) -> Option<String> {
        self.root_attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    fn text(&self, element: &str) -> Option<String> {
        self.texts
            .iter()
            .find(|(k, _)| k == element)
            .map(|(_, v)| v.clone())
    }
}

fn scan(xml: &str) -> Result<Scanned, SamlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut scanned = Scanned::default();
    let mut current = String::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = String::from_utf8_lossy(e.local_name().into_inner()).to_string();
                if scanned.root.is_none() {
                    for attr in e.attributes().flatten() {
                        let key =
                            String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
                        let value = attr
                            .unescape_value()
                            .map(|v| v.to_string())
                            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).to_string());
                        scanned.root_attrs.push((key, value));
                    }
                    scanned.root = Some(local.clone());
                }
                current = local;
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map(|t| t.to_string()).unwrap_or_default();
                if !current.is_empty() && scanned.text(&current).is_none() {
                    scanned.texts.push((current.clone(), text));
                }
            }
            Ok(Event::End(_)) => current.clear(),
            Ok(Event::DocType(_)) => {
                return Err(SamlError::Requester("DOCTYPE is not allowed".to_string()));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SamlError::Requester(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(scanned)
}

fn expect_root(scanned: &Scanned, name: &str) -> Result<(), SamlError> {
    match scanned.root.as_deref() {
        Some(root) if root == name => Ok(()),
        Some(other) => Err(SamlError::Requester(format!("Expected {}, got {}", name, other))),
        None => Err(SamlError::Requester("Empty SAML message".to_string())),
    }
}

fn required(value: Option<String>, what: &str) -> Result<String, SamlError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| SamlError::Requester(format!("Missing {}", what)))
}

pub fn parse_authn_request(xml: &str) -> Result<AuthnRequest, SamlError> {
    let scanned = scan(xml)?;
    expect_root(&scanned, "AuthnRequest")?;
    Ok(AuthnRequest {
        id: required(scanned.attr("ID"), "AuthnRequest ID")?,
        issuer: required(scanned.text("Issuer"), "Issuer")?,
        acs_url: scanned.attr("AssertionConsumerServiceURL"),
    })
}

pub fn parse_logout_request(xml: &str) -> Result<LogoutRequest, SamlError> {
    let scanned = scan(xml)?;
    expect_root(&scanned, "LogoutRequest")?;
    Ok(LogoutRequest {
        id: required(scanned.attr("ID"), "LogoutRequest ID")?,
        issuer: required(scanned.text("Issuer"), "Issuer")?,
        name_id: required(scanned.text("NameID"), "NameID")?,
        session_index: scanned.text("SessionIndex"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::saml::response::deflate_base64;

    const AUTHN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_req42" Version="2.0" IssueInstant="2024-06-05T12:00:00Z"
    AssertionConsumerServiceURL="https://sp.example.com/acs">
    <saml:Issuer>https://sp.example.com</saml:Issuer>
</samlp:AuthnRequest>"#;

    #[test]
    fn test_parse_authn_request() {
        let parsed = parse_authn_request(AUTHN).unwrap();
        assert_eq!(parsed.id, "_req42");
        assert_eq!(parsed.issuer, "https://sp.example.com");
        assert_eq!(parsed.acs_url.as_deref(), Some("https://sp.example.com/acs"));
    }

    #[test]
    fn test_redirect_binding_round_trip() {
        let encoded = deflate_base64(AUTHN).unwrap();
        let xml = decode_message(&encoded, SamlBinding::Redirect).unwrap();
        assert_eq!(parse_authn_request(&xml).unwrap().id, "_req42");
    }

    #[test]
    fn test_post_binding_is_plain_base64() {
        let encoded = STANDARD.encode(AUTHN);
        let xml = decode_message(&encoded, SamlBinding::Post).unwrap();
        assert_eq!(xml, AUTHN);
    }

    #[test]
    fn test_wrong_root_is_rejected() {
        let xml = AUTHN.replace("AuthnRequest", "ArtifactResolve");
        assert!(matches!(parse_authn_request(&xml), Err(SamlError::Requester(_))));
    }

    #[test]
    fn test_doctype_is_rejected() {
        let xml = format!(
            "<!DOCTYPE x [<!ENTITY e \"boom\">]>{}",
            &AUTHN[AUTHN.find("<samlp").unwrap()..]
        );
        assert!(parse_authn_request(&xml).is_err());
    }

    #[test]
    fn test_parse_logout_request() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr1" Version="2.0">
    <saml:Issuer>https://sp.example.com</saml:Issuer>
    <saml:NameID>dana@example.com</saml:NameID>
    <samlp:SessionIndex>_s1</samlp:SessionIndex>
</samlp:LogoutRequest>"#;
        let parsed = parse_logout_request(xml).unwrap();
        assert_eq!(parsed.name_id, "dana@example.com");
        assert_eq!(parsed.session_index.as_deref(), Some("_s1"));
    }

    #[test]
    fn test_garbage_is_requester_error() {
        assert!(decode_message("%%%not-base64", SamlBinding::Post).is_err());
        assert!(decode_message(&STANDARD.encode("not deflate"), SamlBinding::Redirect).is_err());
    }
}
