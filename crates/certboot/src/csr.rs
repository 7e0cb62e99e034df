//! PKCS#10 certificate signing request construction.
//!
//! The CSR carries the node's identity (`CN=<certname>`), a
//! SubjectAltName extension request, plus any attributes and extension
//! requests supplied through the CSR attributes file. The request is
//! signed with the node's private key and persisted before transmission.

use std::net::IpAddr;
use std::str::FromStr;

use const_oid::{AssociatedOid, ObjectIdentifier};
use der::asn1::{BitString, Ia5String, OctetString, SetOfVec};
use der::{Decode, Encode, EncodePem};
use x509_cert::attr::Attribute;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::request::{CertReq, CertReqInfo, ExtensionReq, Version};
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::config::{AltName, CsrAttributes};
use crate::error::{Error, Result};
use crate::key::{utf8_attribute_value, PrivateKey};

fn csr_err(e: impl std::fmt::Display) -> Error {
    Error::CsrBuildFailed(e.to_string())
}

/// Build and sign a CSR, returning its PEM encoding.
pub fn build_csr(
    key: &PrivateKey,
    certname: &str,
    alt_names: &[AltName],
    attrs: &CsrAttributes,
) -> Result<String> {
    let subject = Name::from_str(&format!("CN={certname}")).map_err(csr_err)?;
    let public_key =
        SubjectPublicKeyInfoOwned::from_der(&key.public_key_der()?).map_err(csr_err)?;

    let mut extensions = vec![san_extension(alt_names)?];
    for (oid, value) in &attrs.extension_requests {
        extensions.push(requested_extension(oid, value)?);
    }

    let mut attributes = SetOfVec::<Attribute>::new();
    for (oid, value) in &attrs.custom_attributes {
        let oid = ObjectIdentifier::new(oid).map_err(csr_err)?;
        let mut values = SetOfVec::new();
        values.insert(utf8_attribute_value(value)?).map_err(csr_err)?;
        attributes.insert(Attribute { oid, values }).map_err(csr_err)?;
    }
    attributes
        .insert(Attribute::try_from(ExtensionReq(extensions)).map_err(csr_err)?)
        .map_err(csr_err)?;

    let info = CertReqInfo {
        version: Version::V1,
        subject,
        public_key,
        attributes,
    };

    let tbs = info.to_der().map_err(csr_err)?;
    let signature = key.sign(&tbs)?;
    let req = CertReq {
        info,
        algorithm: key.signature_algorithm()?,
        signature: BitString::from_bytes(&signature).map_err(csr_err)?,
    };

    req.to_pem(der::pem::LineEnding::LF).map_err(csr_err)
}

/// Encode the SubjectAltName extension for the given entries.
fn san_extension(alt_names: &[AltName]) -> Result<Extension> {
    let mut names = Vec::with_capacity(alt_names.len());
    for entry in alt_names {
        let name = match entry {
            AltName::Dns(dns) => {
                GeneralName::DnsName(Ia5String::new(dns).map_err(csr_err)?)
            }
            AltName::Ip(addr) => {
                let octets = match addr {
                    IpAddr::V4(v4) => v4.octets().to_vec(),
                    IpAddr::V6(v6) => v6.octets().to_vec(),
                };
                GeneralName::IpAddress(OctetString::new(octets).map_err(csr_err)?)
            }
        };
        names.push(name);
    }
    let san = SubjectAltName(names);
    Ok(Extension {
        extn_id: SubjectAltName::OID,
        critical: false,
        extn_value: OctetString::new(san.to_der().map_err(csr_err)?).map_err(csr_err)?,
    })
}

/// Encode one extension request, its value carried as a DER UTF8String.
fn requested_extension(oid: &str, value: &str) -> Result<Extension> {
    let content = utf8_attribute_value(value)?;
    Ok(Extension {
        extn_id: ObjectIdentifier::new(oid).map_err(csr_err)?,
        critical: false,
        extn_value: OctetString::new(content.to_der().map_err(csr_err)?).map_err(csr_err)?,
    })
}
