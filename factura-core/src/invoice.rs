//! Invoice domain types and builders.
mod builder;
pub mod xml;

pub use builder::{Invoice, InvoiceBuilder, RequiredInvoiceFields};
pub use xml::{InvoiceXmlError, ToXml, XmlFormat};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access_key::AccessKeyError;

/// `codDoc` of a sales invoice.
pub const INVOICE_DOCUMENT_TYPE: &str = "01";
/// `codigo` of the value-added tax in the SRI tax tables.
pub const IVA_TAX_CODE: &str = "2";
/// `formaPago` for payments made outside the financial system.
pub const PAYMENT_WITHOUT_FINANCIAL_SYSTEM: &str = "01";

/// Invoice-related errors.
#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("invoice must contain at least one line item")]
    MissingLineItems,
    #[error(transparent)]
    AccessKey(#[from] AccessKeyError),
    #[error(transparent)]
    Xml(#[from] InvoiceXmlError),
}

/// Issuing taxpayer and the point of sale the invoice is emitted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issuer {
    /// `razonSocial`.
    pub business_name: String,
    pub trade_name: Option<String>,
    /// 13-digit RUC.
    pub tax_id: String,
    /// `dirMatriz`.
    pub head_office_address: String,
    /// Three-digit establishment code (`estab`).
    pub establishment: String,
    /// Three-digit emission point code (`ptoEmi`).
    pub emission_point: String,
    pub establishment_address: Option<String>,
    /// `obligadoContabilidad`, rendered as `SI` / `NO` when present.
    pub keeps_accounting: Option<bool>,
}

impl Issuer {
    /// `estab-ptoEmi` prefix of printed document numbers.
    pub fn series(&self) -> String {
        format!("{}-{}", self.establishment, self.emission_point)
    }
}

/// Buyer identification as required by `infoFactura`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buyer {
    /// `tipoIdentificacionComprador`: `04` RUC, `05` cedula, `06` passport, `07` final consumer.
    pub id_type: String,
    pub name: String,
    pub identification: String,
    pub address: Option<String>,
}

impl Buyer {
    /// The anonymous final consumer (`9999999999999`).
    pub fn final_consumer() -> Self {
        Self {
            id_type: "07".into(),
            name: "CONSUMIDOR FINAL".into(),
            identification: "9999999999999".into(),
            address: None,
        }
    }
}

/// A tax code/percentage pair from the SRI tables and its rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRate {
    pub code: String,
    pub percentage_code: String,
    /// Rate in percent, e.g. `15.0`.
    pub rate: f64,
}

impl TaxRate {
    pub fn new(code: impl Into<String>, percentage_code: impl Into<String>, rate: f64) -> Self {
        Self {
            code: code.into(),
            percentage_code: percentage_code.into(),
            rate,
        }
    }

    /// IVA at one of the published rates.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use factura_core::invoice::TaxRate;
    ///
    /// let iva = TaxRate::iva(15.0).expect("published rate");
    /// assert_eq!(iva.percentage_code, "4");
    /// assert!(TaxRate::iva(7.0).is_none());
    /// ```
    pub fn iva(rate: f64) -> Option<Self> {
        let percentage_code = match (rate * 100.0).round() as i64 {
            0 => "0",
            500 => "5",
            1200 => "2",
            1300 => "10",
            1400 => "3",
            1500 => "4",
            _ => return None,
        };
        Some(Self::new(IVA_TAX_CODE, percentage_code, rate))
    }

    fn key(&self) -> (&str, &str) {
        (&self.code, &self.percentage_code)
    }
}

/// A single `detalle` of the invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub main_code: String,
    pub auxiliary_code: Option<String>,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub discount: f64,
    pub tax: TaxRate,
}

impl LineItem {
    pub fn new(
        main_code: impl Into<String>,
        description: impl Into<String>,
        quantity: f64,
        unit_price: f64,
        tax: TaxRate,
    ) -> Self {
        Self {
            main_code: main_code.into(),
            auxiliary_code: None,
            description: description.into(),
            quantity,
            unit_price,
            discount: 0.0,
            tax,
        }
    }

    pub fn with_auxiliary_code(mut self, code: impl Into<String>) -> Self {
        self.auxiliary_code = Some(code.into());
        self
    }

    pub fn with_discount(mut self, discount: f64) -> Self {
        self.discount = discount;
        self
    }

    /// `precioTotalSinImpuesto`: quantity times unit price, less the discount.
    pub fn total_without_tax(&self) -> f64 {
        round2(self.quantity * self.unit_price - self.discount)
    }

    pub fn tax_amount(&self) -> f64 {
        round2(self.total_without_tax() * self.tax.rate / 100.0)
    }
}

/// An entry of `pagos`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// `formaPago` code.
    pub method: String,
    pub total: f64,
    pub term: Option<u32>,
    /// `unidadTiempo`, e.g. `dias`.
    pub time_unit: Option<String>,
}

impl Payment {
    pub fn new(method: impl Into<String>, total: f64) -> Self {
        Self {
            method: method.into(),
            total,
            term: None,
            time_unit: None,
        }
    }

    pub fn with_term(mut self, term: u32, time_unit: impl Into<String>) -> Self {
        self.term = Some(term);
        self.time_unit = Some(time_unit.into());
        self
    }
}

/// A `campoAdicional` of `infoAdicional`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalField {
    pub name: String,
    pub value: String,
}

/// One `totalImpuesto` entry: line items grouped by tax code and percentage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaxTotal {
    pub code: String,
    pub percentage_code: String,
    pub rate: f64,
    pub taxable_base: f64,
    pub value: f64,
}

/// Totals derived from the line items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceTotals {
    subtotal: f64,
    discount: f64,
    taxes: Vec<TaxTotal>,
    tip: f64,
}

impl InvoiceTotals {
    pub(crate) fn from_line_items(line_items: &[LineItem], tip: f64) -> Self {
        let mut taxes: Vec<TaxTotal> = Vec::new();
        for item in line_items {
            let base = item.total_without_tax();
            match taxes
                .iter_mut()
                .find(|t| (t.code.as_str(), t.percentage_code.as_str()) == item.tax.key())
            {
                Some(total) => {
                    total.taxable_base = round2(total.taxable_base + base);
                    total.value = round2(total.value + item.tax_amount());
                }
                None => taxes.push(TaxTotal {
                    code: item.tax.code.clone(),
                    percentage_code: item.tax.percentage_code.clone(),
                    rate: item.tax.rate,
                    taxable_base: base,
                    value: item.tax_amount(),
                }),
            }
        }

        Self {
            subtotal: round2(line_items.iter().map(LineItem::total_without_tax).sum()),
            discount: round2(line_items.iter().map(|li| li.discount).sum()),
            taxes,
            tip: round2(tip),
        }
    }

    /// `totalSinImpuestos`.
    pub fn subtotal(&self) -> f64 {
        self.subtotal
    }

    pub fn discount(&self) -> f64 {
        self.discount
    }

    pub fn taxes(&self) -> &[TaxTotal] {
        &self.taxes
    }

    pub fn tax_amount(&self) -> f64 {
        round2(self.taxes.iter().map(|t| t.value).sum())
    }

    /// `propina`.
    pub fn tip(&self) -> f64 {
        self.tip
    }

    /// `importeTotal`.
    pub fn total(&self) -> f64 {
        round2(self.subtotal + self.tax_amount() + self.tip)
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
