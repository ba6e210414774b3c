use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use factura_core::access_key::{AccessKey, AccessKeyFields, UniqueCode};
use factura_core::api::{Authority, SriClient};
use factura_core::certificate::{CertificateSource, Pkcs12File};
use factura_core::config::{Config, EnvironmentType};
use factura_core::operation::{JournalSink, MemorySink, Operation, OperationRunner, TransitionSink};
use factura_core::sign::{self, UnsignedDocument, validate_xml};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "factura")]
#[command(about = "Sign and submit SRI Ecuador electronic invoices")]
struct Cli {
    /// `test` or `production`.
    #[arg(long, global = true, env = "FACTURA_ENVIRONMENT", default_value = "test")]
    environment: EnvironmentType,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CertificateArgs {
    /// PKCS#12 (.p12/.pfx) signing certificate.
    #[arg(long)]
    p12: PathBuf,
    #[arg(long, env = "FACTURA_P12_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an access key, or check one with --check.
    AccessKey {
        #[arg(long, conflicts_with_all = ["date", "tax_id", "sequence"])]
        check: Option<String>,
        /// Issue date, YYYY-MM-DD.
        #[arg(long, required_unless_present = "check")]
        date: Option<NaiveDate>,
        #[arg(long, required_unless_present = "check")]
        tax_id: Option<String>,
        #[arg(long, required_unless_present = "check")]
        sequence: Option<u64>,
        #[arg(long, default_value = "01")]
        document_type: String,
        #[arg(long, default_value = "001")]
        establishment: String,
        #[arg(long, default_value = "001")]
        emission_point: String,
        /// Eight digits; random when omitted.
        #[arg(long)]
        unique_code: Option<String>,
    },
    /// Append an XAdES-BES signature to a document.
    Sign {
        #[arg(long)]
        xml: PathBuf,
        #[command(flatten)]
        certificate: CertificateArgs,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Structural checks on a signed document.
    Validate {
        #[arg(long)]
        xml: PathBuf,
    },
    /// Send a signed document to the reception service.
    Submit {
        #[arg(long)]
        xml: PathBuf,
    },
    /// Query the authorization service for an access key.
    Authorize {
        #[arg(long)]
        access_key: String,
    },
    /// Sign, submit, wait and query authorization in one go.
    Process {
        #[arg(long)]
        xml: PathBuf,
        #[command(flatten)]
        certificate: CertificateArgs,
        /// Defaults to the document's claveAcceso.
        #[arg(long)]
        access_key: Option<String>,
        #[arg(long, default_value_t = 3)]
        delay_secs: u64,
        /// Append transitions to this JSON-lines journal.
        #[arg(long)]
        journal: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::new(cli.environment);

    match cli.command {
        Commands::AccessKey {
            check,
            date,
            tax_id,
            sequence,
            document_type,
            establishment,
            emission_point,
            unique_code,
        } => {
            if let Some(key) = check {
                let key = AccessKey::parse(&key)?;
                print_json(&json!({
                    "access_key": key.as_str(),
                    "issue_date": key.issue_date(),
                    "document_type": key.document_type(),
                    "tax_id": key.tax_id(),
                    "environment": key.environment(),
                    "series": key.series(),
                    "sequence": key.sequence(),
                    "unique_code": key.unique_code(),
                    "emission_type": key.emission_type(),
                    "check_digit": key.check_digit(),
                }))?;
            } else {
                let unique_code = match unique_code {
                    Some(code) => UniqueCode::new(&code)?,
                    None => UniqueCode::random(),
                };
                let key = AccessKey::build(&AccessKeyFields {
                    issue_date: date.context("--date is required")?,
                    document_type,
                    tax_id: tax_id.context("--tax-id is required")?,
                    environment: cli.environment,
                    establishment,
                    emission_point,
                    sequence: sequence.context("--sequence is required")?,
                    unique_code,
                    emission_type: "1".into(),
                })?;
                println!("{key}");
            }
        }
        Commands::Sign {
            xml,
            certificate,
            output,
        } => {
            let document = read_document(&xml)?;
            let source = Pkcs12File::new(certificate.p12, certificate.password);
            let signed = sign::sign(&document, &source.load()?)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, signed.xml())
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), signature_id = signed.signature_id(), "signed document written");
                }
                None => println!("{}", signed.xml()),
            }
        }
        Commands::Validate { xml } => {
            let report = validate_xml(&read_to_string(&xml)?);
            print_json(&report)?;
            if !report.valid {
                bail!("{} is not a valid signed document", xml.display());
            }
        }
        Commands::Submit { xml } => {
            let signed = read_to_string(&xml)?;
            let client = SriClient::new(config)?;
            let result = client.submit(&sign::transport_base64(&signed)).await?;
            print_json(&json!({
                "status": result.status().as_str(),
                "accepted": result.accepted(),
                "duplicate": result.is_duplicate(),
                "messages": result.messages(),
                "summary": result.summary(),
            }))?;
            if !(result.accepted() || result.is_duplicate()) {
                bail!("reception did not accept the document: {}", result.summary());
            }
        }
        Commands::Authorize { access_key } => {
            let client = SriClient::new(config.clone())?;
            let result = client
                .query_authorization(&access_key, &config.authorization_url())
                .await?;
            print_json(&json!({
                "authorized": result.authorized(),
                "authorization_number": result.authorization_number(),
                "authorization_date": result.authorization_date(),
                "environment": result.environment(),
                "status": result.status(),
                "document_count": result.document_count(),
                "messages": result.messages(),
            }))?;
        }
        Commands::Process {
            xml,
            certificate,
            access_key,
            delay_secs,
            journal,
        } => {
            let document = read_document(&xml)?;
            let access_key = match access_key.as_deref().or(document.access_key()) {
                Some(key) => AccessKey::parse(key)?,
                None => bail!("document has no claveAcceso; pass --access-key"),
            };
            let config = config.with_authorization_delay(Duration::from_secs(delay_secs));
            let client = SriClient::new(config.clone())?;
            let source = Arc::new(Pkcs12File::new(certificate.p12, certificate.password));
            let operation = Operation::new(access_key.to_string(), access_key);

            match journal {
                Some(path) => {
                    let runner = OperationRunner::new(client, JournalSink::open(path)?, &config);
                    process(&runner, operation, &document, source).await?;
                }
                None => {
                    let runner = OperationRunner::new(client, MemorySink::new(), &config);
                    process(&runner, operation, &document, source).await?;
                }
            }
        }
    }

    Ok(())
}

async fn process<A: Authority, S: TransitionSink>(
    runner: &OperationRunner<A, S>,
    mut operation: Operation,
    document: &UnsignedDocument,
    source: Arc<Pkcs12File>,
) -> Result<()> {
    let outcome = runner.process(&mut operation, document, source).await;
    print_json(&json!({
        "id": operation.id(),
        "access_key": operation.access_key(),
        "state": operation.state(),
        "last_error": operation.last_error(),
        "history": operation.history(),
        "authorization_number": operation
            .authorization()
            .and_then(|a| a.authorization_number()),
    }))?;
    outcome?;
    Ok(())
}

fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_document(path: &Path) -> Result<UnsignedDocument> {
    read_to_string(path).map(UnsignedDocument::new)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
