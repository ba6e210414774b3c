use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use httpmock::{Method::POST, MockServer};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};

const KNOWN_KEY: &str = "0605202501120603993300110010010000000600608364218";
const PASSWORD: &str = "clave-de-prueba";

fn cli_exe() -> &'static str {
    env!("CARGO_BIN_EXE_factura")
}

fn soap_fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("factura-core")
        .join("tests")
        .join("fixtures")
        .join("soap")
        .join(format!("{name}.xml"))
}

fn unique_temp_path(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    path.push(format!("{prefix}-{}-{nonce}", std::process::id()));
    path
}

fn write_test_p12(path: &Path) {
    let pkey = PKey::from_rsa(Rsa::generate(2048).expect("rsa")).expect("pkey");
    let mut name = X509NameBuilder::new().expect("name");
    name.append_entry_by_text("CN", "Factura Test CA").expect("CN");
    name.append_entry_by_text("C", "EC").expect("C");
    let name = name.build();

    let mut cert = X509::builder().expect("builder");
    cert.set_version(2).expect("version");
    let serial = BigNum::from_u32(7)
        .and_then(|n| n.to_asn1_integer())
        .expect("serial");
    cert.set_serial_number(&serial).expect("serial");
    cert.set_subject_name(&name).expect("subject");
    cert.set_issuer_name(&name).expect("issuer");
    cert.set_pubkey(&pkey).expect("pubkey");
    cert.set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .expect("not before");
    cert.set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .expect("not after");
    cert.sign(&pkey, MessageDigest::sha256()).expect("sign");
    let cert = cert.build();

    let mut builder = Pkcs12::builder();
    builder.name("factura-cli-test").pkey(&pkey).cert(&cert);
    let der = builder.build2(PASSWORD).and_then(|p| p.to_der()).expect("p12");
    std::fs::write(path, der).expect("write p12");
}

fn write_unsigned_invoice(path: &Path) {
    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            "\n<factura id=\"comprobante\" version=\"1.1.0\">\n",
            "  <infoTributaria>\n    <ambiente>1</ambiente>\n    <claveAcceso>{}</claveAcceso>\n  </infoTributaria>\n",
            "  <infoFactura>\n    <importeTotal>115.00</importeTotal>\n  </infoFactura>\n",
            "</factura>\n"
        ),
        KNOWN_KEY
    );
    std::fs::write(path, xml).expect("write invoice");
}

fn run(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut command = Command::new(cli_exe());
    command.args(args).env_remove("FACTURA_SRI_BASE_URL");
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("run factura")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn access_key_command_builds_key_from_fields() {
    let output = run(
        &[
            "access-key",
            "--date",
            "2025-05-06",
            "--tax-id",
            "1206039933001",
            "--sequence",
            "60",
            "--unique-code",
            "06083642",
        ],
        &[],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output).trim(), KNOWN_KEY);
}

#[test]
fn access_key_check_reports_fields_and_rejects_bad_digit() {
    let output = run(&["access-key", "--check", KNOWN_KEY], &[]);
    assert!(output.status.success(), "{}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(json["sequence"], "000000060");
    assert_eq!(json["environment"], "test");
    assert_eq!(json["check_digit"], 8);

    let tampered = format!("{}9", &KNOWN_KEY[..48]);
    let output = run(&["access-key", "--check", &tampered], &[]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("check digit"), "{}", stderr(&output));
}

#[test]
fn sign_then_validate_round_trip() {
    let p12 = unique_temp_path("factura-p12");
    let invoice = unique_temp_path("factura-invoice");
    let signed = unique_temp_path("factura-signed");
    write_test_p12(&p12);
    write_unsigned_invoice(&invoice);

    let output = run(
        &[
            "sign",
            "--xml",
            invoice.to_str().unwrap(),
            "--p12",
            p12.to_str().unwrap(),
            "--output",
            signed.to_str().unwrap(),
        ],
        &[("FACTURA_P12_PASSWORD", PASSWORD)],
    );
    assert!(output.status.success(), "sign failed: {}", stderr(&output));

    let signed_xml = std::fs::read_to_string(&signed).expect("signed output");
    assert_eq!(signed_xml.matches("<ds:Signature ").count(), 1);
    assert!(signed_xml.contains("<ds:X509IssuerName>CN=Factura Test CA,C=EC</ds:X509IssuerName>"));

    let output = run(&["validate", "--xml", signed.to_str().unwrap()], &[]);
    assert!(output.status.success(), "validate failed: {}", stderr(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(report["valid"], true);
    assert_eq!(report["warnings"].as_array().map(Vec::len), Some(1));

    for path in [p12, invoice, signed] {
        let _ = std::fs::remove_file(path);
    }
}

#[test]
fn validate_rejects_unsigned_document() {
    let invoice = unique_temp_path("factura-unsigned");
    write_unsigned_invoice(&invoice);

    let output = run(&["validate", "--xml", invoice.to_str().unwrap()], &[]);
    assert!(!output.status.success());
    assert!(stdout(&output).contains("no ds:Signature"));

    let _ = std::fs::remove_file(invoice);
}

#[test]
fn sign_with_wrong_password_fails() {
    let p12 = unique_temp_path("factura-p12-bad");
    let invoice = unique_temp_path("factura-invoice-bad");
    write_test_p12(&p12);
    write_unsigned_invoice(&invoice);

    let output = run(
        &[
            "sign",
            "--xml",
            invoice.to_str().unwrap(),
            "--p12",
            p12.to_str().unwrap(),
            "--password",
            "not-it",
        ],
        &[],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid passphrase"), "{}", stderr(&output));

    let _ = std::fs::remove_file(p12);
    let _ = std::fs::remove_file(invoice);
}

#[test]
fn authorize_rejects_short_key_without_network() {
    let output = run(
        &["authorize", "--access-key", &KNOWN_KEY[..48]],
        &[("FACTURA_SRI_BASE_URL", "http://127.0.0.1:9")],
    );
    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("access key must have 49 digits, got 48"),
        "{}",
        stderr(&output)
    );
}

#[test]
fn submit_posts_to_reception_override() {
    let server = MockServer::start();
    let body = std::fs::read_to_string(soap_fixture("reception_received")).expect("fixture");
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/RecepcionComprobantesOffline")
            .body_contains("<ec:validarComprobante>");
        then.status(200).header("content-type", "text/xml").body(body);
    });

    let signed = unique_temp_path("factura-submit");
    std::fs::write(&signed, "<factura id=\"comprobante\"/>").expect("write");
    let output = run(
        &["submit", "--xml", signed.to_str().unwrap()],
        &[("FACTURA_SRI_BASE_URL", &server.base_url())],
    );

    assert!(output.status.success(), "submit failed: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(json["status"], "RECIBIDA");
    assert_eq!(json["accepted"], true);
    mock.assert();

    let _ = std::fs::remove_file(signed);
}
