use crate::{
    Result,
    constants::{AMOUNT_WIDTH, PLACEHOLDER_TRANSACTION_ID, TRANSACTION_ID_LEN},
    error::Error,
};
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Monetary amount in minor units (cents).
///
/// The wire form is a left-zero-padded 12-digit decimal string, which bounds
/// the representable value; `new` rejects anything that does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount(u64);

impl Amount {
    /// Largest value encodable in the 12-digit wire field.
    pub const MAX_MINOR: u64 = 999_999_999_999;

    /// Create an amount from minor units.
    ///
    /// # Errors
    /// Returns `Error::Validation` if the value does not fit the 12-digit
    /// wire field.
    pub fn new(minor: u64) -> Result<Self> {
        if minor > Self::MAX_MINOR {
            return Err(Error::Validation(format!(
                "Amount {minor} exceeds the 12-digit wire field"
            )));
        }
        Ok(Amount(minor))
    }

    /// A zero amount (used for reversal and retrieval requests).
    #[must_use]
    pub const fn zero() -> Self {
        Amount(0)
    }

    /// Minor units as u64.
    #[must_use]
    pub fn minor(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Left-zero-padded 12-digit wire form.
    #[must_use]
    pub fn to_wire(&self) -> String {
        format!("{:0>width$}", self.0, width = AMOUNT_WIDTH)
    }

    /// Parse a wire amount field of any width (7 or 12 digits).
    ///
    /// # Errors
    /// Returns `Error::Validation` if the field contains non-digit bytes.
    pub fn parse_wire(field: &str) -> Result<Self> {
        let trimmed = field.trim_start_matches('0');
        if trimmed.is_empty() {
            return Ok(Amount(0));
        }
        let minor: u64 = trimmed.parse().map_err(|_| {
            Error::Validation(format!("Invalid wire amount field: {field:?}"))
        })?;
        Amount::new(minor)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Terminal-assigned transaction identifier (5 characters).
///
/// New sessions start with the placeholder `"00000"` until the terminal
/// reports the real id in the first phase-`A` status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a transaction id with validation.
    ///
    /// # Errors
    /// Returns `Error::Validation` unless the id is exactly 5 ASCII
    /// characters.
    pub fn new(id: &str) -> Result<Self> {
        if id.len() != TRANSACTION_ID_LEN || !id.is_ascii() {
            return Err(Error::Validation(format!(
                "Transaction id must be {TRANSACTION_ID_LEN} ASCII chars, got {id:?}"
            )));
        }
        Ok(TransactionId(id.to_string()))
    }

    /// The placeholder id used before the terminal assigns one.
    #[must_use]
    pub fn placeholder() -> Self {
        TransactionId(PLACEHOLDER_TRANSACTION_ID.to_string())
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.0 == PLACEHOLDER_TRANSACTION_ID
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TransactionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TransactionId::new(s)
    }
}

/// Protocol timestamp (`yyMMddHHmmss` on the wire).
///
/// An empty timestamp encodes as all zeros; this is what reversal and
/// retrieval requests send when the original timestamp is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcrTimestamp(Option<NaiveDateTime>);

impl EcrTimestamp {
    const WIRE_FORMAT: &'static str = "%y%m%d%H%M%S";
    const EMPTY_WIRE: &'static str = "000000000000";

    /// Current local time.
    #[must_use]
    pub fn now() -> Self {
        EcrTimestamp(Some(Local::now().naive_local()))
    }

    /// The empty timestamp (all zeros on the wire).
    #[must_use]
    pub const fn empty() -> Self {
        EcrTimestamp(None)
    }

    #[must_use]
    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        EcrTimestamp(Some(dt))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Parse the 12-digit wire form. All zeros parses as empty.
    ///
    /// # Errors
    /// Returns `Error::Validation` for malformed fields.
    pub fn parse_wire(s: &str) -> Result<Self> {
        if s == Self::EMPTY_WIRE {
            return Ok(EcrTimestamp(None));
        }
        let dt = NaiveDateTime::parse_from_str(s, Self::WIRE_FORMAT).map_err(|e| {
            Error::Validation(format!("Invalid timestamp {s:?}: {e}"))
        })?;
        Ok(EcrTimestamp(Some(dt)))
    }

    /// 12-digit wire form.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self.0 {
            Some(dt) => dt.format(Self::WIRE_FORMAT).to_string(),
            None => Self::EMPTY_WIRE.to_string(),
        }
    }

    /// Accounting date (`yyMMdd`); today when the timestamp is empty.
    #[must_use]
    pub fn accounting_date(&self) -> String {
        let date: NaiveDate = match self.0 {
            Some(dt) => dt.date(),
            None => Local::now().date_naive(),
        };
        date.format("%y%m%d").to_string()
    }

    #[must_use]
    pub fn inner(&self) -> Option<&NaiveDateTime> {
        self.0.as_ref()
    }
}

impl fmt::Display for EcrTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "-"),
        }
    }
}

/// Correlation id for a caller-initiated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        SessionId(id)
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of caller-initiated terminal interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Payment,
    Refund,
    Reversal,
    Retrieve,
}

impl TransactionKind {
    /// Type digit carried in the transaction request.
    #[must_use]
    pub fn wire_digit(&self) -> char {
        match self {
            TransactionKind::Payment => '0',
            TransactionKind::Refund => '1',
            TransactionKind::Reversal => '2',
            TransactionKind::Retrieve => '3',
        }
    }

    /// Parse a type digit from the wire.
    ///
    /// # Errors
    /// Returns `Error::Validation` for unknown digits.
    pub fn from_wire(c: char) -> Result<Self> {
        match c {
            '0' => Ok(TransactionKind::Payment),
            '1' => Ok(TransactionKind::Refund),
            '2' => Ok(TransactionKind::Reversal),
            '3' => Ok(TransactionKind::Retrieve),
            _ => Err(Error::Validation(format!("Unknown transaction type digit {c:?}"))),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionKind::Payment => "Payment",
            TransactionKind::Refund => "Refund",
            TransactionKind::Reversal => "Reversal",
            TransactionKind::Retrieve => "Retrieve",
        };
        write!(f, "{s}")
    }
}

/// Loyalty-card data collected alongside a payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusInfo {
    pub customer_number: String,
    pub member_class: String,
    pub status_code: Option<String>,
    pub status_text: Option<String>,
}

/// Four-character outcome tag carried in status messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultCode(String);

impl ResultCode {
    /// Create a result code with validation.
    ///
    /// # Errors
    /// Returns `Error::Validation` unless the code is exactly 4 ASCII
    /// characters.
    pub fn new(code: &str) -> Result<Self> {
        if code.len() != 4 || !code.is_ascii() {
            return Err(Error::Validation(format!(
                "Result code must be 4 ASCII chars, got {code:?}"
            )));
        }
        Ok(ResultCode(code.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading class character (`0` informational, `1`/`9` error, ...).
    #[must_use]
    pub fn class(&self) -> char {
        self.0.chars().next().unwrap_or('0')
    }

    /// Informational codes require no action beyond the status event.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        self.class() == '0'
    }

    /// `1xxx` and `9xxx` codes mean the terminal aborted the flow.
    #[must_use]
    pub fn is_terminal_abort(&self) -> bool {
        matches!(self.class(), '1' | '9')
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ResultCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ResultCode::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_amount_wire_padding() {
        let amount = Amount::new(1234).unwrap();
        assert_eq!(amount.to_wire(), "000000001234");
        assert_eq!(amount.to_string(), "12.34");
    }

    #[test]
    fn test_amount_rejects_overflow() {
        assert!(Amount::new(Amount::MAX_MINOR).is_ok());
        assert!(Amount::new(Amount::MAX_MINOR + 1).is_err());
    }

    #[rstest]
    #[case("000000001234", 1234)]
    #[case("0001234", 1234)]
    #[case("000000000000", 0)]
    fn test_amount_parse_wire(#[case] field: &str, #[case] expected: u64) {
        assert_eq!(Amount::parse_wire(field).unwrap().minor(), expected);
    }

    #[test]
    fn test_amount_parse_wire_rejects_garbage() {
        assert!(Amount::parse_wire("0000x001234").is_err());
    }

    #[test]
    fn test_transaction_id_placeholder() {
        let id = TransactionId::placeholder();
        assert!(id.is_placeholder());
        assert_eq!(id.as_str(), "00000");
    }

    #[rstest]
    #[case("00042")]
    #[case("A1234")]
    fn test_transaction_id_valid(#[case] input: &str) {
        let id: TransactionId = input.parse().unwrap();
        assert_eq!(id.as_str(), input);
        assert!(!id.is_placeholder());
    }

    #[rstest]
    #[case("1234")] // too short
    #[case("123456")] // too long
    fn test_transaction_id_invalid(#[case] input: &str) {
        assert!(TransactionId::new(input).is_err());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = EcrTimestamp::parse_wire("260802143015").unwrap();
        assert_eq!(ts.to_wire(), "260802143015");
        assert_eq!(ts.accounting_date(), "260802");
    }

    #[test]
    fn test_timestamp_empty_is_zeros() {
        let ts = EcrTimestamp::empty();
        assert!(ts.is_empty());
        assert_eq!(ts.to_wire(), "000000000000");
        assert_eq!(EcrTimestamp::parse_wire("000000000000").unwrap(), ts);
    }

    #[test]
    fn test_timestamp_rejects_malformed() {
        assert!(EcrTimestamp::parse_wire("26-8-2 14:30").is_err());
    }

    #[rstest]
    #[case(TransactionKind::Payment, '0')]
    #[case(TransactionKind::Refund, '1')]
    #[case(TransactionKind::Reversal, '2')]
    #[case(TransactionKind::Retrieve, '3')]
    fn test_transaction_kind_digits(#[case] kind: TransactionKind, #[case] digit: char) {
        assert_eq!(kind.wire_digit(), digit);
        assert_eq!(TransactionKind::from_wire(digit).unwrap(), kind);
    }

    #[test]
    fn test_result_code_classes() {
        assert!(ResultCode::new("0003").unwrap().is_informational());
        assert!(ResultCode::new("1002").unwrap().is_terminal_abort());
        assert!(ResultCode::new("9001").unwrap().is_terminal_abort());
        assert!(!ResultCode::new("2001").unwrap().is_terminal_abort());
        assert!(ResultCode::new("200").is_err());
    }

    #[test]
    fn test_session_id_display_roundtrip() {
        let id = SessionId::generate();
        let other = SessionId::from_uuid(id.as_uuid());
        assert_eq!(id, other);
    }
}
