//! PKI core: key generation, certificate signing, Sub-CA issuance, and the
//! fingerprint/chain helpers the rest of the control plane builds on.
//!
//! All certificate material crosses module boundaries as PEM strings; DER
//! only exists transiently for hashing and verification.

use chrono::{DateTime, Utc};
use rand::Rng;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
	IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use sha1::{Digest, Sha1};
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::pem::Pem;

use crate::types::KeyAlgorithm;

pub mod rotation;

/// Leaf and CA certs are backdated to absorb clock skew between the control
/// plane and verifiers.
const BACKDATE: time::Duration = time::Duration::minutes(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("certificate generation: {0}")]
	Generate(#[from] rcgen::Error),
	#[error("certificate parse: {0}")]
	Parse(String),
	#[error("key parse: {0}")]
	Key(String),
}

impl From<Error> for warden_core::Error {
	fn from(e: Error) -> Self {
		warden_core::Error::internal(e.to_string())
	}
}

/// Material for a self-signed root CA.
#[derive(Debug, Clone)]
pub struct GeneratedCa {
	pub cert_pem: String,
	pub key_pem: String,
	/// 128-bit serial, hex.
	pub serial: String,
	pub not_before: DateTime<Utc>,
	pub not_after: DateTime<Utc>,
	pub fingerprint: String,
}

/// Material for a cert issued under some CA (Sub-CA or leaf).
#[derive(Debug, Clone)]
pub struct GeneratedCert {
	pub cert_pem: String,
	pub key_pem: String,
	pub serial: String,
	pub fingerprint: String,
	pub not_before: DateTime<Utc>,
	pub not_after: DateTime<Utc>,
}

fn generate_keypair(alg: KeyAlgorithm) -> Result<KeyPair, Error> {
	let kp = match alg {
		KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?,
		KeyAlgorithm::EcdsaP384 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?,
		KeyAlgorithm::Rsa2048 => {
			KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rcgen::RsaKeySize::_2048)?
		},
		KeyAlgorithm::Rsa3072 => {
			KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rcgen::RsaKeySize::_3072)?
		},
		KeyAlgorithm::Rsa4096 => {
			KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rcgen::RsaKeySize::_4096)?
		},
	};
	Ok(kp)
}

/// Fresh 128-bit serial. The raw bytes go into the certificate; the hex form
/// is what the store records. Callers regenerate on (store-level) collision.
pub fn random_serial() -> (Vec<u8>, String) {
	let mut buf = [0u8; 16];
	rand::rng().fill_bytes(&mut buf);
	// Keep the INTEGER positive.
	buf[0] &= 0x7f;
	(buf.to_vec(), hex::encode(buf))
}

/// RFC 5280 subject key identifier: SHA-1 over the subject public key info.
fn subject_key_id(key: &KeyPair) -> Vec<u8> {
	Sha1::digest(key.subject_public_key_info()).to_vec()
}

pub fn sha256_hex(data: &[u8]) -> String {
	let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, data);
	hex::encode(digest.as_ref())
}

fn to_chrono(t: OffsetDateTime) -> DateTime<Utc> {
	DateTime::from_timestamp(t.unix_timestamp(), 0).unwrap_or_default()
}

fn parse_pem(cert_pem: &str) -> Result<Pem, Error> {
	let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
		.map_err(|e| Error::Parse(e.to_string()))?;
	Ok(pem)
}

fn with_cert<T>(
	cert_pem: &str,
	f: impl FnOnce(&X509Certificate) -> Result<T, Error>,
) -> Result<T, Error> {
	let pem = parse_pem(cert_pem)?;
	let cert = pem.parse_x509().map_err(|e| Error::Parse(e.to_string()))?;
	f(&cert)
}

/// hex(sha256(DER)) of a PEM certificate.
pub fn fingerprint(cert_pem: &str) -> Result<String, Error> {
	let pem = parse_pem(cert_pem)?;
	Ok(sha256_hex(&pem.contents))
}

pub fn validity(cert_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
	with_cert(cert_pem, |cert| {
		let nb = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
			.unwrap_or_default();
		let na =
			DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0).unwrap_or_default();
		Ok((nb, na))
	})
}

pub fn subject_key_id_hex(cert_pem: &str) -> Result<Option<String>, Error> {
	with_cert(cert_pem, |cert| {
		for ext in cert.extensions() {
			if let ParsedExtension::SubjectKeyIdentifier(ki) = ext.parsed_extension() {
				return Ok(Some(hex::encode(ki.0)));
			}
		}
		Ok(None)
	})
}

pub fn authority_key_id_hex(cert_pem: &str) -> Result<Option<String>, Error> {
	with_cert(cert_pem, |cert| {
		for ext in cert.extensions() {
			if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
				return Ok(aki.key_identifier.as_ref().map(|ki| hex::encode(ki.0)));
			}
		}
		Ok(None)
	})
}

/// Chain verification against a pool containing only `ca`: issuer linkage
/// plus signature check.
pub fn verify_signed_by(leaf_pem: &str, ca_pem: &str) -> Result<bool, Error> {
	let leaf_raw = parse_pem(leaf_pem)?;
	let ca_raw = parse_pem(ca_pem)?;
	let leaf = leaf_raw
		.parse_x509()
		.map_err(|e| Error::Parse(e.to_string()))?;
	let ca = ca_raw
		.parse_x509()
		.map_err(|e| Error::Parse(e.to_string()))?;
	if leaf.issuer() != ca.subject() {
		return Ok(false);
	}
	Ok(leaf.verify_signature(Some(ca.public_key())).is_ok())
}

/// Fresh keypair, self-signed, `BasicConstraints{CA:true, pathLen:1}`.
pub fn generate_root_ca(
	org: &str,
	validity: chrono::Duration,
	alg: KeyAlgorithm,
) -> Result<GeneratedCa, Error> {
	let key = generate_keypair(alg)?;
	let (serial_bytes, serial_hex) = random_serial();

	let not_before = OffsetDateTime::now_utc() - BACKDATE;
	let not_after = not_before
		+ time::Duration::seconds(validity.num_seconds())
		+ BACKDATE;

	let mut params = CertificateParams::default();
	params.distinguished_name = DistinguishedName::new();
	params
		.distinguished_name
		.push(DnType::CommonName, format!("{org} Root CA"));
	params.distinguished_name.push(DnType::OrganizationName, org);
	params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::CrlSign,
		KeyUsagePurpose::DigitalSignature,
	];
	params.serial_number = Some(SerialNumber::from(serial_bytes));
	params.not_before = not_before;
	params.not_after = not_after;
	params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(&key));

	let cert = params.self_signed(&key)?;
	Ok(GeneratedCa {
		fingerprint: sha256_hex(cert.der().as_ref()),
		cert_pem: cert.pem(),
		key_pem: key.serialize_pem(),
		serial: serial_hex,
		not_before: to_chrono(not_before),
		not_after: to_chrono(not_after),
	})
}

fn issuer_from_pem(
	ca_cert_pem: &str,
	ca_key_pem: &str,
) -> Result<(Issuer<'static, KeyPair>, OffsetDateTime), Error> {
	let not_after = with_cert(ca_cert_pem, |cert| {
		Ok(cert.validity().not_after.timestamp())
	})?;
	let not_after = OffsetDateTime::from_unix_timestamp(not_after)
		.map_err(|e| Error::Parse(e.to_string()))?;
	let key = KeyPair::from_pem(ca_key_pem).map_err(|e| Error::Key(e.to_string()))?;
	let issuer =
		Issuer::from_ca_cert_pem(ca_cert_pem, key).map_err(|e| Error::Parse(e.to_string()))?;
	Ok((issuer, not_after))
}

fn clamp(requested: OffsetDateTime, issuer_not_after: OffsetDateTime) -> OffsetDateTime {
	if requested > issuer_not_after {
		issuer_not_after
	} else {
		requested
	}
}

/// Sub-CA signed by the (active) root. `pathLen:0`; AKI set to the root's
/// SKI, which is the binding the rotation detector walks.
pub fn generate_sub_ca(
	root_cert_pem: &str,
	root_key_pem: &str,
	name: &str,
	validity: chrono::Duration,
	alg: KeyAlgorithm,
) -> Result<GeneratedCert, Error> {
	let (issuer, issuer_not_after) = issuer_from_pem(root_cert_pem, root_key_pem)?;
	let key = generate_keypair(alg)?;
	let (serial_bytes, serial_hex) = random_serial();

	let not_before = OffsetDateTime::now_utc() - BACKDATE;
	let not_after = clamp(
		not_before + time::Duration::seconds(validity.num_seconds()) + BACKDATE,
		issuer_not_after,
	);

	let mut params = CertificateParams::default();
	params.distinguished_name = DistinguishedName::new();
	params
		.distinguished_name
		.push(DnType::CommonName, format!("{name} Sub CA"));
	params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::CrlSign,
		KeyUsagePurpose::DigitalSignature,
	];
	params.serial_number = Some(SerialNumber::from(serial_bytes));
	params.not_before = not_before;
	params.not_after = not_after;
	params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(&key));
	params.use_authority_key_identifier_extension = true;

	let cert = params.signed_by(&key, &issuer)?;
	Ok(GeneratedCert {
		fingerprint: sha256_hex(cert.der().as_ref()),
		cert_pem: cert.pem(),
		key_pem: key.serialize_pem(),
		serial: serial_hex,
		not_before: to_chrono(not_before),
		not_after: to_chrono(not_after),
	})
}

/// Server leaf for a gateway's VPN endpoint: `ExtKeyUsage=ServerAuth`.
pub fn generate_server_cert(
	sub_ca_cert_pem: &str,
	sub_ca_key_pem: &str,
	common_name: &str,
	sans: &[String],
	validity: chrono::Duration,
	alg: KeyAlgorithm,
) -> Result<GeneratedCert, Error> {
	let (issuer, issuer_not_after) = issuer_from_pem(sub_ca_cert_pem, sub_ca_key_pem)?;
	let key = generate_keypair(alg)?;
	let (serial_bytes, serial_hex) = random_serial();

	let not_before = OffsetDateTime::now_utc() - BACKDATE;
	let not_after = clamp(
		not_before + time::Duration::seconds(validity.num_seconds()) + BACKDATE,
		issuer_not_after,
	);

	let mut params = CertificateParams::new(sans.to_vec())?;
	params.distinguished_name = DistinguishedName::new();
	params
		.distinguished_name
		.push(DnType::CommonName, common_name);
	params.is_ca = IsCa::ExplicitNoCa;
	params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
	params.key_usages = vec![
		KeyUsagePurpose::DigitalSignature,
		KeyUsagePurpose::KeyEncipherment,
	];
	params.serial_number = Some(SerialNumber::from(serial_bytes));
	params.not_before = not_before;
	params.not_after = not_after;
	params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(&key));
	params.use_authority_key_identifier_extension = true;

	let cert = params.signed_by(&key, &issuer)?;
	Ok(GeneratedCert {
		fingerprint: sha256_hex(cert.der().as_ref()),
		cert_pem: cert.pem(),
		key_pem: key.serialize_pem(),
		serial: serial_hex,
		not_before: to_chrono(not_before),
		not_after: to_chrono(not_after),
	})
}

/// Client leaf bound to a user identity: CN and rfc822 SAN carry the email,
/// `ExtKeyUsage=ClientAuth`.
pub fn generate_client_cert(
	sub_ca_cert_pem: &str,
	sub_ca_key_pem: &str,
	email: &str,
	validity: chrono::Duration,
	alg: KeyAlgorithm,
) -> Result<GeneratedCert, Error> {
	let (issuer, issuer_not_after) = issuer_from_pem(sub_ca_cert_pem, sub_ca_key_pem)?;
	let key = generate_keypair(alg)?;
	let (serial_bytes, serial_hex) = random_serial();

	let not_before = OffsetDateTime::now_utc() - BACKDATE;
	let not_after = clamp(
		not_before + time::Duration::seconds(validity.num_seconds()) + BACKDATE,
		issuer_not_after,
	);

	let mut params = CertificateParams::default();
	params.distinguished_name = DistinguishedName::new();
	params.distinguished_name.push(DnType::CommonName, email);
	params.subject_alt_names = vec![SanType::Rfc822Name(
		email
			.try_into()
			.map_err(|_| Error::Parse(format!("email {email:?} is not IA5")))?,
	)];
	params.is_ca = IsCa::ExplicitNoCa;
	params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
	params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
	params.serial_number = Some(SerialNumber::from(serial_bytes));
	params.not_before = not_before;
	params.not_after = not_after;
	params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(&key));
	params.use_authority_key_identifier_extension = true;

	let cert = params.signed_by(&key, &issuer)?;
	Ok(GeneratedCert {
		fingerprint: sha256_hex(cert.der().as_ref()),
		cert_pem: cert.pem(),
		key_pem: key.serialize_pem(),
		serial: serial_hex,
		not_before: to_chrono(not_before),
		not_after: to_chrono(not_after),
	})
}

/// OpenVPN-compatible static key for `tls-auth`: 256 random bytes rendered
/// as 16 lines of 32 hex chars.
pub fn generate_tls_auth_key() -> String {
	let mut buf = [0u8; 256];
	rand::rng().fill_bytes(&mut buf);
	let mut out = String::from("-----BEGIN OpenVPN Static key V1-----\n");
	for line in buf.chunks(16) {
		out.push_str(&hex::encode(line));
		out.push('\n');
	}
	out.push_str("-----END OpenVPN Static key V1-----\n");
	out
}
