//! XML serialization for invoices.
use super::{AdditionalField, Invoice, LineItem, Payment, TaxTotal};

use helpers::{FixedPrecision, amount};
use quick_xml::se::{SeError, Serializer as QuickXmlSerializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

const ROOT_ID: &str = "comprobante";
const FACTURA_VERSION: &str = "1.1.0";

/// XML serialization error.
#[derive(Debug, Error)]
pub enum InvoiceXmlError {
    #[error("failed to serialize invoice to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
}

/// XML formatting options.
#[derive(Debug, Clone, Copy, Default)]
pub enum XmlFormat {
    #[default]
    Compact,
    Pretty {
        indent_char: char,
        indent_size: usize,
    },
}

pub trait ToXml {
    fn to_xml_with_format(&self, format: XmlFormat) -> Result<String, InvoiceXmlError>;

    /// Compact rendering, the form handed to the signer.
    fn to_xml(&self) -> Result<String, InvoiceXmlError> {
        self.to_xml_with_format(XmlFormat::Compact)
    }

    fn to_xml_pretty(&self) -> Result<String, InvoiceXmlError> {
        self.to_xml_with_format(XmlFormat::Pretty {
            indent_char: ' ',
            indent_size: 2,
        })
    }
}

impl ToXml for Invoice {
    fn to_xml_with_format(&self, format: XmlFormat) -> Result<String, InvoiceXmlError> {
        let mut buffer = String::with_capacity(4096);
        buffer.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        buffer.push('\n');

        {
            let mut serializer = QuickXmlSerializer::new(&mut buffer);
            if let XmlFormat::Pretty {
                indent_char,
                indent_size,
            } = format
            {
                serializer.indent(indent_char, indent_size);
            }
            FacturaXml(self).serialize(serializer)?;
        }

        Ok(buffer)
    }
}

mod helpers {
    use serde::ser::{Serialize, Serializer};
    use std::fmt::{self, Display, Formatter};

    pub(super) struct FixedPrecision {
        value: f64,
        precision: usize,
    }

    impl FixedPrecision {
        pub(super) fn new(value: f64, precision: usize) -> Self {
            Self { value, precision }
        }
    }

    impl Display for FixedPrecision {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{:.*}", self.precision, self.value)
        }
    }

    impl Serialize for FixedPrecision {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    pub(super) fn amount(value: f64) -> FixedPrecision {
        FixedPrecision::new(value, 2)
    }
}

struct FacturaXml<'a>(&'a Invoice);

impl<'a> Serialize for FacturaXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let invoice = self.0;
        let mut root = s.serialize_struct("factura", 0)?;
        root.serialize_field("@id", ROOT_ID)?;
        root.serialize_field("@version", FACTURA_VERSION)?;
        root.serialize_field("infoTributaria", &InfoTributariaXml(invoice))?;
        root.serialize_field("infoFactura", &InfoFacturaXml(invoice))?;
        root.serialize_field("detalles", &DetallesXml(invoice.line_items()))?;
        if !invoice.additional_fields().is_empty() {
            root.serialize_field("infoAdicional", &InfoAdicionalXml(invoice.additional_fields()))?;
        }
        root.end()
    }
}

struct InfoTributariaXml<'a>(&'a Invoice);

impl<'a> Serialize for InfoTributariaXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let invoice = self.0;
        let issuer = invoice.issuer();
        let key = invoice.access_key();

        let mut st = s.serialize_struct("infoTributaria", 0)?;
        st.serialize_field("ambiente", &invoice.environment().code())?;
        st.serialize_field("tipoEmision", key.emission_type())?;
        st.serialize_field("razonSocial", &issuer.business_name)?;
        if let Some(trade_name) = issuer.trade_name.as_ref() {
            st.serialize_field("nombreComercial", trade_name)?;
        }
        st.serialize_field("ruc", key.tax_id())?;
        st.serialize_field("claveAcceso", key.as_str())?;
        st.serialize_field("codDoc", key.document_type())?;
        st.serialize_field("estab", invoice.establishment())?;
        st.serialize_field("ptoEmi", invoice.emission_point())?;
        st.serialize_field("secuencial", invoice.sequence())?;
        st.serialize_field("dirMatriz", &issuer.head_office_address)?;
        st.end()
    }
}

struct InfoFacturaXml<'a>(&'a Invoice);

impl<'a> Serialize for InfoFacturaXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let invoice = self.0;
        let issuer = invoice.issuer();
        let buyer = invoice.buyer();
        let totals = invoice.totals();

        let mut st = s.serialize_struct("infoFactura", 0)?;
        st.serialize_field(
            "fechaEmision",
            &invoice.issue_date().format("%d/%m/%Y").to_string(),
        )?;
        if let Some(address) = issuer.establishment_address.as_ref() {
            st.serialize_field("dirEstablecimiento", address)?;
        }
        if let Some(keeps_accounting) = issuer.keeps_accounting {
            st.serialize_field(
                "obligadoContabilidad",
                if keeps_accounting { "SI" } else { "NO" },
            )?;
        }
        st.serialize_field("tipoIdentificacionComprador", &buyer.id_type)?;
        st.serialize_field("guiaRemision", &invoice.remission_guide())?;
        st.serialize_field("razonSocialComprador", &buyer.name)?;
        st.serialize_field("identificacionComprador", &buyer.identification)?;
        if let Some(address) = buyer.address.as_ref() {
            st.serialize_field("direccionComprador", address)?;
        }
        st.serialize_field("totalSinImpuestos", &amount(totals.subtotal()))?;
        st.serialize_field("totalDescuento", &amount(totals.discount()))?;
        st.serialize_field("totalConImpuestos", &TotalConImpuestosXml(totals.taxes()))?;
        st.serialize_field("propina", &amount(totals.tip()))?;
        st.serialize_field("importeTotal", &amount(totals.total()))?;
        st.serialize_field("moneda", invoice.currency())?;
        st.serialize_field("pagos", &PagosXml(invoice.payments()))?;
        st.end()
    }
}

struct TotalConImpuestosXml<'a>(&'a [TaxTotal]);

impl<'a> Serialize for TotalConImpuestosXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("totalConImpuestos", 0)?;
        for tax in self.0 {
            st.serialize_field("totalImpuesto", &TotalImpuestoXml(tax))?;
        }
        st.end()
    }
}

struct TotalImpuestoXml<'a>(&'a TaxTotal);

impl<'a> Serialize for TotalImpuestoXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let tax = self.0;
        let mut st = s.serialize_struct("totalImpuesto", 0)?;
        st.serialize_field("codigo", &tax.code)?;
        st.serialize_field("codigoPorcentaje", &tax.percentage_code)?;
        st.serialize_field("baseImponible", &amount(tax.taxable_base))?;
        st.serialize_field("tarifa", &amount(tax.rate))?;
        st.serialize_field("valor", &amount(tax.value))?;
        st.end()
    }
}

struct PagosXml<'a>(&'a [Payment]);

impl<'a> Serialize for PagosXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("pagos", 0)?;
        for payment in self.0 {
            st.serialize_field("pago", &PagoXml(payment))?;
        }
        st.end()
    }
}

struct PagoXml<'a>(&'a Payment);

impl<'a> Serialize for PagoXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let payment = self.0;
        let mut st = s.serialize_struct("pago", 0)?;
        st.serialize_field("formaPago", &payment.method)?;
        st.serialize_field("total", &amount(payment.total))?;
        if let Some(term) = payment.term {
            st.serialize_field("plazo", &term)?;
        }
        if let Some(unit) = payment.time_unit.as_ref() {
            st.serialize_field("unidadTiempo", unit)?;
        }
        st.end()
    }
}

struct DetallesXml<'a>(&'a [LineItem]);

impl<'a> Serialize for DetallesXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("detalles", 0)?;
        for item in self.0 {
            st.serialize_field("detalle", &DetalleXml(item))?;
        }
        st.end()
    }
}

struct DetalleXml<'a>(&'a LineItem);

impl<'a> Serialize for DetalleXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let item = self.0;
        let mut st = s.serialize_struct("detalle", 0)?;
        st.serialize_field("codigoPrincipal", &item.main_code)?;
        if let Some(code) = item.auxiliary_code.as_ref() {
            st.serialize_field("codigoAuxiliar", code)?;
        }
        st.serialize_field("descripcion", &item.description)?;
        st.serialize_field("cantidad", &FixedPrecision::new(item.quantity, 6))?;
        st.serialize_field("precioUnitario", &FixedPrecision::new(item.unit_price, 6))?;
        st.serialize_field("descuento", &amount(item.discount))?;
        st.serialize_field("precioTotalSinImpuesto", &amount(item.total_without_tax()))?;
        st.serialize_field("impuestos", &ImpuestosXml(item))?;
        st.end()
    }
}

struct ImpuestosXml<'a>(&'a LineItem);

impl<'a> Serialize for ImpuestosXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let item = self.0;
        let mut st = s.serialize_struct("impuestos", 0)?;
        st.serialize_field(
            "impuesto",
            &TotalImpuestoXml(&TaxTotal {
                code: item.tax.code.clone(),
                percentage_code: item.tax.percentage_code.clone(),
                rate: item.tax.rate,
                taxable_base: item.total_without_tax(),
                value: item.tax_amount(),
            }),
        )?;
        st.end()
    }
}

struct InfoAdicionalXml<'a>(&'a [AdditionalField]);

impl<'a> Serialize for InfoAdicionalXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("infoAdicional", 0)?;
        for field in self.0 {
            st.serialize_field("campoAdicional", &CampoAdicionalXml(field))?;
        }
        st.end()
    }
}

struct CampoAdicionalXml<'a>(&'a AdditionalField);

impl<'a> Serialize for CampoAdicionalXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("campoAdicional", 2)?;
        st.serialize_field("@nombre", &self.0.name)?;
        st.serialize_field("$text", &self.0.value)?;
        st.end()
    }
}
