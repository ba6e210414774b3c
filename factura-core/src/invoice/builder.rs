use super::{
    AdditionalField, Buyer, INVOICE_DOCUMENT_TYPE, InvoiceError, InvoiceTotals, Issuer, LineItem,
    PAYMENT_WITHOUT_FINANCIAL_SYSTEM, Payment, ToXml,
};
use crate::access_key::{AccessKey, AccessKeyFields, UniqueCode};
use crate::config::EnvironmentType;
use crate::sign::UnsignedDocument;
use chrono::NaiveDate;

const NORMAL_EMISSION: &str = "1";
const DEFAULT_CURRENCY: &str = "DOLAR";

/// Fields every invoice needs before line items are added.
#[derive(Debug, Clone)]
pub struct RequiredInvoiceFields {
    pub issue_date: NaiveDate,
    pub environment: EnvironmentType,
    pub issuer: Issuer,
    pub buyer: Buyer,
    /// Document sequence within the issuer's series; rendered with 9 digits.
    pub sequence: u64,
}

/// An invoice with its access key assigned and totals computed.
#[derive(Debug, Clone)]
pub struct Invoice {
    fields: RequiredInvoiceFields,
    line_items: Vec<LineItem>,
    payments: Vec<Payment>,
    additional_fields: Vec<AdditionalField>,
    remission_guide: Option<String>,
    currency: String,
    access_key: AccessKey,
    totals: InvoiceTotals,
}

/// Builds an [`Invoice`] from its required fields and line items.
///
/// # Examples
///
/// ```rust
/// use chrono::NaiveDate;
/// use factura_core::config::EnvironmentType;
/// use factura_core::invoice::{
///     Buyer, InvoiceBuilder, Issuer, LineItem, RequiredInvoiceFields, TaxRate,
/// };
///
/// let invoice = InvoiceBuilder::new(RequiredInvoiceFields {
///     issue_date: NaiveDate::from_ymd_opt(2025, 5, 6).expect("date"),
///     environment: EnvironmentType::Test,
///     issuer: Issuer {
///         business_name: "Comercial Andina S.A.".into(),
///         trade_name: None,
///         tax_id: "1790012345001".into(),
///         head_office_address: "Av. Amazonas N34-12, Quito".into(),
///         establishment: "1".into(),
///         emission_point: "1".into(),
///         establishment_address: None,
///         keeps_accounting: None,
///     },
///     buyer: Buyer::final_consumer(),
///     sequence: 60,
/// })
/// .line_item(LineItem::new("SKU-1", "Servicio", 1.0, 100.0, TaxRate::iva(15.0).expect("rate")))
/// .build()?;
///
/// assert_eq!(invoice.totals().total(), 115.0);
/// assert_eq!(invoice.access_key().sequence(), "000000060");
/// # Ok::<(), factura_core::invoice::InvoiceError>(())
/// ```
#[derive(Debug)]
pub struct InvoiceBuilder {
    fields: RequiredInvoiceFields,
    line_items: Vec<LineItem>,
    payments: Vec<Payment>,
    additional_fields: Vec<AdditionalField>,
    remission_guide: Option<String>,
    currency: String,
    unique_code: Option<UniqueCode>,
    tip: f64,
}

impl InvoiceBuilder {
    pub fn new(fields: RequiredInvoiceFields) -> Self {
        Self {
            fields,
            line_items: Vec::new(),
            payments: Vec::new(),
            additional_fields: Vec::new(),
            remission_guide: None,
            currency: DEFAULT_CURRENCY.to_string(),
            unique_code: None,
            tip: 0.0,
        }
    }

    pub fn line_item(mut self, item: LineItem) -> Self {
        self.line_items.push(item);
        self
    }

    pub fn line_items(mut self, items: impl IntoIterator<Item = LineItem>) -> Self {
        self.line_items.extend(items);
        self
    }

    /// Adds a payment. Without any, a single cash payment for the total is rendered.
    pub fn payment(mut self, payment: Payment) -> Self {
        self.payments.push(payment);
        self
    }

    pub fn additional_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_fields.push(AdditionalField {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Defaults to `estab-ptoEmi-secuencial`.
    pub fn remission_guide(mut self, guide: impl Into<String>) -> Self {
        self.remission_guide = Some(guide.into());
        self
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Fixes the access key's unique code; a random one is drawn otherwise.
    pub fn unique_code(mut self, code: UniqueCode) -> Self {
        self.unique_code = Some(code);
        self
    }

    pub fn tip(mut self, tip: f64) -> Self {
        self.tip = tip;
        self
    }

    pub fn build(self) -> Result<Invoice, InvoiceError> {
        if self.line_items.is_empty() {
            return Err(InvoiceError::MissingLineItems);
        }

        let access_key = AccessKey::build(&AccessKeyFields {
            issue_date: self.fields.issue_date,
            document_type: INVOICE_DOCUMENT_TYPE.to_string(),
            tax_id: self.fields.issuer.tax_id.clone(),
            environment: self.fields.environment,
            establishment: self.fields.issuer.establishment.clone(),
            emission_point: self.fields.issuer.emission_point.clone(),
            sequence: self.fields.sequence,
            unique_code: self.unique_code.unwrap_or_else(UniqueCode::random),
            emission_type: NORMAL_EMISSION.to_string(),
        })?;
        let totals = InvoiceTotals::from_line_items(&self.line_items, self.tip);
        let payments = if self.payments.is_empty() {
            vec![Payment::new(PAYMENT_WITHOUT_FINANCIAL_SYSTEM, totals.total())]
        } else {
            self.payments
        };

        Ok(Invoice {
            fields: self.fields,
            line_items: self.line_items,
            payments,
            additional_fields: self.additional_fields,
            remission_guide: self.remission_guide,
            currency: self.currency,
            access_key,
            totals,
        })
    }
}

impl Invoice {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn totals(&self) -> &InvoiceTotals {
        &self.totals
    }

    pub fn issue_date(&self) -> NaiveDate {
        self.fields.issue_date
    }

    pub fn environment(&self) -> EnvironmentType {
        self.fields.environment
    }

    pub fn issuer(&self) -> &Issuer {
        &self.fields.issuer
    }

    pub fn buyer(&self) -> &Buyer {
        &self.fields.buyer
    }

    pub fn line_items(&self) -> &[LineItem] {
        &self.line_items
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn additional_fields(&self) -> &[AdditionalField] {
        &self.additional_fields
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Zero-padded establishment code, as embedded in the access key.
    pub fn establishment(&self) -> &str {
        &self.access_key.series()[..3]
    }

    pub fn emission_point(&self) -> &str {
        &self.access_key.series()[3..]
    }

    /// Nine-digit `secuencial`.
    pub fn sequence(&self) -> &str {
        self.access_key.sequence()
    }

    /// Printed document number, `estab-ptoEmi-secuencial`.
    pub fn document_number(&self) -> String {
        format!(
            "{}-{}-{}",
            self.establishment(),
            self.emission_point(),
            self.sequence()
        )
    }

    pub fn remission_guide(&self) -> String {
        self.remission_guide
            .clone()
            .unwrap_or_else(|| self.document_number())
    }

    /// Renders the invoice as the input of the signer.
    pub fn to_unsigned_document(&self) -> Result<UnsignedDocument, InvoiceError> {
        Ok(UnsignedDocument::new(self.to_xml()?))
    }
}
