use quick_xml::escape::escape;

use super::response::certificate_body;
use super::SamlError;
use crate::models::federation::NAME_ID_EMAIL;

/// IdP `EntityDescriptor` advertising the application's signing certificate
/// and both bindings for SSO and SLO.
pub fn idp_metadata(
    entity_id: &str,
    sso_url: &str,
    slo_url: &str,
    certificate_pem: &str,
) -> Result<String, SamlError> {
    let certificate = certificate_body(certificate_pem)?;
    Ok(format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity_id}">"#,
            r#"<md:IDPSSODescriptor WantAuthnRequestsSigned="false" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
            r#"<md:KeyDescriptor use="signing">"#,
            r#"<ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>"#,
            r#"</md:KeyDescriptor>"#,
            r#"<md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{slo_url}"/>"#,
            r#"<md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{slo_url}"/>"#,
            r#"<md:NameIDFormat>{name_id_format}</md:NameIDFormat>"#,
            r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{sso_url}"/>"#,
            r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{sso_url}"/>"#,
            r#"</md:IDPSSODescriptor>"#,
            r#"</md:EntityDescriptor>"#
        ),
        entity_id = escape(entity_id),
        certificate = certificate,
        slo_url = escape(slo_url),
        name_id_format = NAME_ID_EMAIL,
        sso_url = escape(sso_url),
    ))
}
