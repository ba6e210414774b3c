use chrono::NaiveDate;
use factura_core::access_key::UniqueCode;
use factura_core::config::EnvironmentType;
use factura_core::invoice::{
    Buyer, Invoice, InvoiceBuilder, Issuer, LineItem, RequiredInvoiceFields, TaxRate,
};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};

#[allow(dead_code)]
pub const PASSPHRASE: &str = "clave-de-prueba";

/// A throwaway RSA key and a self-signed certificate with a Uanataca-like issuer.
#[allow(dead_code)]
pub fn test_identity() -> (PKey<Private>, X509) {
    self_signed(&[
        ("C", "ES"),
        ("L", "Barcelona"),
        ("O", "UANATACA S.A."),
        ("OU", "TSP-UANATACA"),
        ("CN", "UANATACA CA2 2021"),
    ])
}

/// DER certificate and PKCS#8 key for a self-signed identity named by `entries`.
#[allow(dead_code)]
pub fn identity_der(entries: &[(&str, &str)]) -> (Vec<u8>, Vec<u8>) {
    let (pkey, cert) = self_signed(entries);
    (
        cert.to_der().expect("cert der"),
        pkey.private_key_to_pkcs8().expect("key der"),
    )
}

fn self_signed(entries: &[(&str, &str)]) -> (PKey<Private>, X509) {
    let rsa = Rsa::generate(2048).expect("rsa key");
    let pkey = PKey::from_rsa(rsa).expect("pkey");

    let mut name = X509NameBuilder::new().expect("name builder");
    for (field, value) in entries {
        name.append_entry_by_text(field, value).expect("name entry");
    }
    let name = name.build();

    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(424_242)
        .and_then(|n| n.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("serial number");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(&pkey).expect("public key");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(365).expect("not after"))
        .expect("not after");
    builder.sign(&pkey, MessageDigest::sha256()).expect("self sign");

    (pkey, builder.build())
}

/// PKCS#12 container protected by [`PASSPHRASE`].
#[allow(dead_code)]
pub fn test_p12() -> Vec<u8> {
    let (pkey, cert) = test_identity();
    let mut builder = Pkcs12::builder();
    builder.name("factura-test").pkey(&pkey).cert(&cert);
    builder
        .build2(PASSPHRASE)
        .and_then(|p12| p12.to_der())
        .expect("pkcs12")
}

/// 100.00 subtotal with 15% IVA.
#[allow(dead_code)]
pub fn sample_invoice() -> Invoice {
    InvoiceBuilder::new(RequiredInvoiceFields {
        issue_date: NaiveDate::from_ymd_opt(2025, 5, 6).expect("date"),
        environment: EnvironmentType::Test,
        issuer: Issuer {
            business_name: "Comercial Andina S.A.".into(),
            trade_name: Some("Andina".into()),
            tax_id: "1206039933001".into(),
            head_office_address: "Av. Amazonas N34-12, Quito".into(),
            establishment: "001".into(),
            emission_point: "001".into(),
            establishment_address: None,
            keeps_accounting: Some(false),
        },
        buyer: Buyer::final_consumer(),
        sequence: 60,
    })
    .unique_code(UniqueCode::new("06083642").expect("unique code"))
    .line_item(LineItem::new(
        "SRV-001",
        "Servicio de consultoria",
        1.0,
        100.0,
        TaxRate::iva(15.0).expect("rate"),
    ))
    .additional_field("Email", "cliente@example.com")
    .build()
    .expect("invoice")
}
