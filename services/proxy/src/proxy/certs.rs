//! X.509 helpers shared by the key manager and the trust authority.

use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::CertificateError;
use x509_parser::certificate::X509Certificate;
use x509_parser::x509::AttributeTypeAndValue;

/// RFC 4514 attribute keywords, by dotted OID.
const ATTRIBUTE_KEYWORDS: &[(&str, &str)] = &[
    ("2.5.4.3", "CN"),
    ("2.5.4.7", "L"),
    ("2.5.4.8", "ST"),
    ("2.5.4.10", "O"),
    ("2.5.4.11", "OU"),
    ("2.5.4.6", "C"),
    ("2.5.4.9", "STREET"),
    ("0.9.2342.19200300.100.1.25", "DC"),
    ("0.9.2342.19200300.100.1.1", "UID"),
];

fn parse<'a>(der: &'a CertificateDer<'_>) -> Result<X509Certificate<'a>, CertificateError> {
    x509_parser::parse_x509_certificate(der.as_ref())
        .map(|(_, cert)| cert)
        .map_err(|_| CertificateError::BadEncoding)
}

/// Subject distinguished name of a certificate, in RFC 4514 string form.
///
/// RDNs are listed last to first and joined with `,`; multi-valued RDNs
/// join their attributes with `+`.
pub fn subject_name(der: &CertificateDer<'_>) -> Result<String, CertificateError> {
    let cert = parse(der)?;
    let mut rdns: Vec<String> = cert
        .subject()
        .iter()
        .map(|rdn| {
            rdn.iter()
                .map(format_attribute)
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect();
    rdns.reverse();
    Ok(rdns.join(","))
}

fn format_attribute(attr: &AttributeTypeAndValue<'_>) -> String {
    let oid = attr.attr_type().to_id_string();
    let keyword = ATTRIBUTE_KEYWORDS
        .iter()
        .find(|(dotted, _)| *dotted == oid)
        .map(|(_, keyword)| *keyword);

    match (keyword, attr.as_str()) {
        (Some(keyword), Ok(value)) => format!("{}={}", keyword, escape_value(value)),
        (Some(keyword), Err(_)) => format!("{}=#{}", keyword, hex::encode(attr.attr_value().data)),
        (None, _) => format!("{}=#{}", oid, hex::encode(attr.attr_value().data)),
    }
}

/// Escape an attribute value per RFC 4514 section 2.4.
fn escape_value(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        match c {
            '"' | '+' | ',' | ';' | '<' | '>' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '#' if i == 0 => out.push_str("\\#"),
            ' ' if i == 0 || i == last => out.push_str("\\ "),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

/// Whether a certificate names itself as its issuer (a root or self-signed cert).
///
/// Certificates that cannot be parsed are not considered self-issued.
pub fn is_self_issued(der: &CertificateDer<'_>) -> bool {
    match parse(der) {
        Ok(cert) => cert.issuer().as_raw() == cert.subject().as_raw(),
        Err(_) => false,
    }
}

/// Check that `now` falls inside the certificate's validity window.
pub fn check_validity(der: &CertificateDer<'_>, now: UnixTime) -> Result<(), CertificateError> {
    let cert = parse(der)?;
    let validity = cert.validity();
    let now = i64::try_from(now.as_secs()).unwrap_or(i64::MAX);

    if now < validity.not_before.timestamp() {
        return Err(CertificateError::NotValidYet);
    }
    if now > validity.not_after.timestamp() {
        return Err(CertificateError::Expired);
    }
    Ok(())
}
