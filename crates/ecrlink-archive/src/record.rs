//! The completed-transaction record format.
//!
//! Records are plain text with INI-like sections:
//!
//! ```text
//! [TransactionInfo]
//! TransactionId=00042
//! Amount=1234
//! ...
//! [BonusInfo]          (only when bonus data was collected)
//! CustomerNumber=9876543210
//! ...
//! [ExtraInfo]
//! PayerReceipt=b64:...
//! ```
//!
//! Value encoding: absent values write the `null:` marker, empty strings
//! stay empty, values that would collide with the markers or contain line
//! breaks are base64-encoded behind a `b64:` prefix. Receipts and the flags
//! byte are always base64. Serialization round-trips losslessly.

use crate::error::{ArchiveError, ArchiveResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ecrlink_core::{Amount, BonusInfo, EcrTimestamp, TransactionId};
use ecrlink_protocol::TransactionResult;
use std::collections::HashMap;
use std::fmt::Write as _;

const NULL_MARKER: &str = "null:";
const B64_MARKER: &str = "b64:";

const SECTION_TRANSACTION: &str = "TransactionInfo";
const SECTION_BONUS: &str = "BonusInfo";
const SECTION_EXTRA: &str = "ExtraInfo";

/// A completed transaction as archived to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub result: TransactionResult,
    pub bonus: Option<BonusInfo>,
}

impl TransactionRecord {
    #[must_use]
    pub fn new(result: TransactionResult) -> Self {
        Self {
            result,
            bonus: None,
        }
    }

    #[must_use]
    pub fn with_bonus(mut self, bonus: BonusInfo) -> Self {
        self.bonus = Some(bonus);
        self
    }

    /// Filename stem: `yyyy-MM-dd-HH-mm-ss-<txId>-<txType>`.
    ///
    /// The record timestamp names the file; a record without one falls back
    /// to the current local time.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let when = match self.result.timestamp.inner() {
            Some(dt) => dt.format("%Y-%m-%d-%H-%M-%S").to_string(),
            None => chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string(),
        };
        format!(
            "{when}-{}-{}",
            self.result.transaction_id,
            self.result.transaction_type
        )
    }

    /// Serialize to the archive text format.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let r = &self.result;

        let _ = writeln!(out, "[{SECTION_TRANSACTION}]");
        write_value(&mut out, "Extended", if r.extended { "1" } else { "0" });
        write_value(&mut out, "TransactionType", &r.transaction_type.to_string());
        write_value(&mut out, "PaymentMethod", &r.payment_method.to_string());
        write_value(&mut out, "CardType", &r.card_type.to_string());
        write_value(&mut out, "TransactionUsage", &r.transaction_usage.to_string());
        write_value(&mut out, "SettlementId", &r.settlement_id);
        write_value(&mut out, "MaskedCardNumber", &r.masked_card_number);
        write_value(&mut out, "Aid", &r.aid);
        write_value(&mut out, "Certificate", &r.certificate);
        write_value(&mut out, "Tvr", &r.tvr);
        write_value(&mut out, "Tsi", &r.tsi);
        write_value(&mut out, "TransactionId", r.transaction_id.as_str());
        write_value(&mut out, "FilingCode", &r.filing_code);
        write_value(&mut out, "Timestamp", &r.timestamp.to_wire());
        write_value(&mut out, "Amount", &r.amount.minor().to_string());
        write_value(&mut out, "Currency", &r.currency);
        write_value(&mut out, "ReaderSerialNumber", &r.reader_serial_number);
        write_value(
            &mut out,
            "PrintPayeeReceipt",
            if r.print_payee_receipt { "1" } else { "0" },
        );

        if let Some(bonus) = &self.bonus {
            let _ = writeln!(out, "[{SECTION_BONUS}]");
            write_value(&mut out, "CustomerNumber", &bonus.customer_number);
            write_value(&mut out, "MemberClass", &bonus.member_class);
            write_optional(&mut out, "StatusCode", bonus.status_code.as_deref());
            write_optional(&mut out, "StatusText", bonus.status_text.as_deref());
        }

        let _ = writeln!(out, "[{SECTION_EXTRA}]");
        write_bytes(&mut out, "PayerReceipt", &r.payer_receipt);
        write_bytes(&mut out, "PayeeReceipt", &r.payee_receipt);
        write_bytes(&mut out, "Flags", &[r.flags as u8]);

        out
    }

    /// Parse the archive text format.
    ///
    /// # Errors
    /// `ArchiveError::Format` on malformed sections, missing keys or
    /// undecodable values.
    pub fn from_text(text: &str) -> ArchiveResult<Self> {
        let sections = parse_sections(text)?;
        let tx = sections
            .get(SECTION_TRANSACTION)
            .ok_or_else(|| ArchiveError::Format("missing [TransactionInfo] section".to_string()))?;
        let extra = sections
            .get(SECTION_EXTRA)
            .ok_or_else(|| ArchiveError::Format("missing [ExtraInfo] section".to_string()))?;

        let flags_bytes = read_bytes(extra, "Flags")?;
        let result = TransactionResult {
            extended: read_string(tx, "Extended")? == "1",
            transaction_type: read_char(tx, "TransactionType")?,
            payment_method: read_char(tx, "PaymentMethod")?,
            card_type: read_char(tx, "CardType")?,
            transaction_usage: read_char(tx, "TransactionUsage")?,
            settlement_id: read_string(tx, "SettlementId")?,
            masked_card_number: read_string(tx, "MaskedCardNumber")?,
            aid: read_string(tx, "Aid")?,
            certificate: read_string(tx, "Certificate")?,
            tvr: read_string(tx, "Tvr")?,
            tsi: read_string(tx, "Tsi")?,
            transaction_id: TransactionId::new(&read_string(tx, "TransactionId")?)
                .map_err(|e| ArchiveError::Format(e.to_string()))?,
            filing_code: read_string(tx, "FilingCode")?,
            timestamp: EcrTimestamp::parse_wire(&read_string(tx, "Timestamp")?)
                .map_err(|e| ArchiveError::Format(e.to_string()))?,
            amount: Amount::new(
                read_string(tx, "Amount")?
                    .parse()
                    .map_err(|e| ArchiveError::Format(format!("bad amount: {e}")))?,
            )
            .map_err(|e| ArchiveError::Format(e.to_string()))?,
            currency: read_string(tx, "Currency")?,
            reader_serial_number: read_string(tx, "ReaderSerialNumber")?,
            print_payee_receipt: read_string(tx, "PrintPayeeReceipt")? == "1",
            flags: *flags_bytes.first().unwrap_or(&b'0') as char,
            payer_receipt: read_bytes(extra, "PayerReceipt")?,
            payee_receipt: read_bytes(extra, "PayeeReceipt")?,
        };

        let bonus = match sections.get(SECTION_BONUS) {
            Some(section) => Some(BonusInfo {
                customer_number: read_string(section, "CustomerNumber")?,
                member_class: read_string(section, "MemberClass")?,
                status_code: read_optional(section, "StatusCode")?,
                status_text: read_optional(section, "StatusText")?,
            }),
            None => None,
        };

        Ok(Self { result, bonus })
    }
}

type Section = HashMap<String, String>;

fn parse_sections(text: &str) -> ArchiveResult<HashMap<String, Section>> {
    let mut sections: HashMap<String, Section> = HashMap::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.to_string());
            sections.entry(name.to_string()).or_default();
            continue;
        }
        let Some(section) = &current else {
            return Err(ArchiveError::Format(format!(
                "value line before any section: {line:?}"
            )));
        };
        let Some((key, value)) = line.split_once('=') else {
            return Err(ArchiveError::Format(format!("malformed line: {line:?}")));
        };
        sections
            .get_mut(section)
            .expect("section entry exists")
            .insert(key.to_string(), value.to_string());
    }
    Ok(sections)
}

/// True when the literal value would be misread on the way back.
fn needs_escaping(value: &str) -> bool {
    value.starts_with(NULL_MARKER)
        || value.starts_with(B64_MARKER)
        || value.contains('\n')
        || value.contains('\r')
}

fn write_value(out: &mut String, key: &str, value: &str) {
    if needs_escaping(value) {
        let _ = writeln!(out, "{key}={B64_MARKER}{}", BASE64.encode(value.as_bytes()));
    } else {
        let _ = writeln!(out, "{key}={value}");
    }
}

fn write_optional(out: &mut String, key: &str, value: Option<&str>) {
    match value {
        Some(value) => write_value(out, key, value),
        None => {
            let _ = writeln!(out, "{key}={NULL_MARKER}");
        }
    }
}

fn write_bytes(out: &mut String, key: &str, bytes: &[u8]) {
    let _ = writeln!(out, "{key}={B64_MARKER}{}", BASE64.encode(bytes));
}

fn raw<'a>(section: &'a Section, key: &str) -> ArchiveResult<&'a str> {
    section
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ArchiveError::Format(format!("missing key {key}")))
}

fn read_string(section: &Section, key: &str) -> ArchiveResult<String> {
    let value = raw(section, key)?;
    if let Some(encoded) = value.strip_prefix(B64_MARKER) {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ArchiveError::Format(format!("bad base64 in {key}: {e}")))?;
        return String::from_utf8(bytes)
            .map_err(|e| ArchiveError::Format(format!("bad utf-8 in {key}: {e}")));
    }
    Ok(value.to_string())
}

fn read_optional(section: &Section, key: &str) -> ArchiveResult<Option<String>> {
    if raw(section, key)? == NULL_MARKER {
        return Ok(None);
    }
    read_string(section, key).map(Some)
}

fn read_char(section: &Section, key: &str) -> ArchiveResult<char> {
    read_string(section, key)?
        .chars()
        .next()
        .ok_or_else(|| ArchiveError::Format(format!("empty char field {key}")))
}

fn read_bytes(section: &Section, key: &str) -> ArchiveResult<Vec<u8>> {
    let value = raw(section, key)?;
    let encoded = value.strip_prefix(B64_MARKER).ok_or_else(|| {
        ArchiveError::Format(format!("{key} must be base64-encoded, got {value:?}"))
    })?;
    BASE64
        .decode(encoded)
        .map_err(|e| ArchiveError::Format(format!("bad base64 in {key}: {e}")))
}
