//! Encoders for the host-to-terminal wire messages.
//!
//! The transaction request is a fixed-layout 80-byte record; every field is
//! fixed width and zero padded. The remaining messages are short control
//! payloads. All payloads here are unframed; [`crate::frame::build_frame`]
//! wraps them before transmission. The handshake ENQ is the one exception
//! and is written as a single raw byte by the link layer.

use ecrlink_core::{
    Amount, EcrTimestamp, TransactionId, TransactionKind,
    charset,
    constants::{
        AUTH_CODE_WIDTH, CURRENCY_WIDTH, DEFAULT_CURRENCY, DISPLAY_LINE_LEN, ECR_NUMBER_WIDTH,
        FIELD_TERMINATOR, SERIAL_NUMBER_WIDTH, TRANSACTION_REQUEST_LEN,
    },
};
use tracing::debug;

/// Fixed-layout transaction request (`y` message, 80 bytes).
///
/// Payment and refund requests carry a fresh timestamp and the placeholder
/// transaction id; reversal and retrieval requests carry the original
/// timestamp and id verbatim with zero amounts.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub kind: TransactionKind,
    pub amount: Amount,
    pub transaction_id: TransactionId,
    pub timestamp: EcrTimestamp,
    pub bonus_handled: bool,
    pub auth_code: Option<String>,
    pub serial_number: String,
    pub currency: String,
    pub ecr_number: u16,
}

impl TransactionRequest {
    /// A payment request with a fresh timestamp.
    #[must_use]
    pub fn payment(amount: Amount, transaction_id: TransactionId, bonus_handled: bool) -> Self {
        Self {
            kind: TransactionKind::Payment,
            amount,
            transaction_id,
            timestamp: EcrTimestamp::now(),
            bonus_handled,
            auth_code: None,
            serial_number: String::new(),
            currency: DEFAULT_CURRENCY.to_string(),
            ecr_number: 1,
        }
    }

    /// A refund request: fresh timestamp, placeholder transaction id.
    #[must_use]
    pub fn refund(amount: Amount) -> Self {
        Self {
            kind: TransactionKind::Refund,
            amount,
            transaction_id: TransactionId::placeholder(),
            timestamp: EcrTimestamp::now(),
            bonus_handled: false,
            auth_code: None,
            serial_number: String::new(),
            currency: DEFAULT_CURRENCY.to_string(),
            ecr_number: 1,
        }
    }

    /// A reversal of an earlier transaction; id and timestamp verbatim.
    #[must_use]
    pub fn reversal(transaction_id: TransactionId, original: EcrTimestamp) -> Self {
        Self {
            kind: TransactionKind::Reversal,
            amount: Amount::zero(),
            transaction_id,
            timestamp: original,
            bonus_handled: false,
            auth_code: None,
            serial_number: String::new(),
            currency: DEFAULT_CURRENCY.to_string(),
            ecr_number: 1,
        }
    }

    /// A retrieval of an earlier transaction; id and timestamp verbatim.
    #[must_use]
    pub fn retrieve(transaction_id: TransactionId, original: EcrTimestamp) -> Self {
        Self {
            kind: TransactionKind::Retrieve,
            amount: Amount::zero(),
            transaction_id,
            timestamp: original,
            bonus_handled: false,
            auth_code: None,
            serial_number: String::new(),
            currency: DEFAULT_CURRENCY.to_string(),
            ecr_number: 1,
        }
    }

    #[must_use]
    pub fn with_auth_code(mut self, code: impl Into<String>) -> Self {
        self.auth_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_ecr_number(mut self, ecr_number: u16) -> Self {
        self.ecr_number = ecr_number;
        self
    }

    #[must_use]
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    #[must_use]
    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = serial.into();
        self
    }

    /// Encode the 80-byte request payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TRANSACTION_REQUEST_LEN);
        out.push(b'y');
        out.push(self.kind.wire_digit() as u8);
        out.extend_from_slice(self.amount.to_wire().as_bytes());
        out.extend_from_slice(Amount::zero().to_wire().as_bytes()); // other amount
        out.extend_from_slice(self.transaction_id.as_str().as_bytes());
        out.push(b'0'); // force online
        out.push(if self.auth_code.is_some() { b'1' } else { b'0' }); // manual entry
        out.push(if self.bonus_handled { b'1' } else { b'0' });
        out.extend_from_slice(&encode_auth_code(self.auth_code.as_deref()));
        out.extend_from_slice(self.timestamp.to_wire().as_bytes());
        out.extend_from_slice(pad_digits(&self.serial_number, SERIAL_NUMBER_WIDTH).as_bytes());
        out.push(b'0'); // payment restriction
        out.push(b'0'); // surcharge
        out.push(b'0'); // look for date of birth
        out.push(b'0'); // flags
        out.push(b'0'); // rfu
        out.extend_from_slice(pad_digits(&self.currency, CURRENCY_WIDTH).as_bytes());
        out.extend_from_slice(self.timestamp.accounting_date().as_bytes());
        out.push(b'0'); // accounting sequence
        out.extend_from_slice(
            pad_digits(&self.ecr_number.to_string(), ECR_NUMBER_WIDTH).as_bytes(),
        );
        debug_assert_eq!(out.len(), TRANSACTION_REQUEST_LEN);
        out
    }
}

/// Auth-code slot: code bytes, the 0x1C terminator, zero padding to 7 bytes.
fn encode_auth_code(code: Option<&str>) -> [u8; AUTH_CODE_WIDTH] {
    let mut slot = [b'0'; AUTH_CODE_WIDTH];
    let code = code.unwrap_or("");
    let copy = code.len().min(AUTH_CODE_WIDTH - 1);
    slot[..copy].copy_from_slice(&code.as_bytes()[..copy]);
    slot[copy] = FIELD_TERMINATOR;
    slot
}

/// Left-zero-pad a digit field, truncating from the left when overlong.
fn pad_digits(value: &str, width: usize) -> String {
    let mut padded = format!("{value:0>width$}");
    if padded.len() > width {
        padded = padded[padded.len() - width..].to_string();
    }
    padded
}

/// Abort the transaction in progress: `7` · `2`.
#[must_use]
pub fn abort() -> Vec<u8> {
    b"72".to_vec()
}

/// Accept or reject a paused transaction:
/// `$` · transactionId(5) · (`1`|`9`) · zeros(9).
#[must_use]
pub fn accept_or_reject(transaction_id: &TransactionId, accept: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.push(b'$');
    out.extend_from_slice(transaction_id.as_str().as_bytes());
    out.push(if accept { b'1' } else { b'9' });
    out.extend_from_slice(b"000000000");
    out
}

/// Display font selector for [`display_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayOption {
    Clear,
    SmallFont,
    BigFont,
}

impl DisplayOption {
    fn wire_digit(self) -> u8 {
        match self {
            DisplayOption::Clear => b'0',
            DisplayOption::SmallFont => b'1',
            DisplayOption::BigFont => b'2',
        }
    }
}

/// Show two lines on the terminal display:
/// `Z` · option · line1(21) · line2(21) · spaces(4).
///
/// A line longer than 21 encoded bytes silently downgrades the request to
/// the small font and is truncated to fit.
#[must_use]
pub fn display_text(line1: &str, line2: &str, option: DisplayOption) -> Vec<u8> {
    let mut l1 = charset::encode(line1);
    let mut l2 = charset::encode(line2);

    let mut option = option;
    if l1.len() > DISPLAY_LINE_LEN || l2.len() > DISPLAY_LINE_LEN {
        if option == DisplayOption::BigFont {
            debug!("display line exceeds 21 bytes, downgrading to small font");
            option = DisplayOption::SmallFont;
        }
        l1.truncate(DISPLAY_LINE_LEN);
        l2.truncate(DISPLAY_LINE_LEN);
    }
    l1.resize(DISPLAY_LINE_LEN, b' ');
    l2.resize(DISPLAY_LINE_LEN, b' ');

    let mut out = Vec::with_capacity(2 + 2 * DISPLAY_LINE_LEN + 4);
    out.push(b'Z');
    out.push(option.wire_digit());
    out.extend_from_slice(&l1);
    out.extend_from_slice(&l2);
    out.extend_from_slice(b"    ");
    out
}

/// Clear the terminal display.
#[must_use]
pub fn clear_display() -> Vec<u8> {
    display_text("", "", DisplayOption::Clear)
}

/// Set or reset the auxiliary accept mode: `S` · `2` · (`1`|`0`).
#[must_use]
pub fn auxiliary_mode(enable: bool) -> Vec<u8> {
    vec![b'S', b'2', if enable { b'1' } else { b'0' }]
}

/// Device-control query selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceQuery {
    Status,
    TcsMessage,
    Version,
}

impl DeviceQuery {
    fn wire_digit(self) -> u8 {
        match self {
            DeviceQuery::Status => b'0',
            DeviceQuery::TcsMessage => b'1',
            DeviceQuery::Version => b'2',
        }
    }
}

/// Query the device-control interface: `s` · `0` · (`0`|`1`|`2`).
#[must_use]
pub fn device_control(query: DeviceQuery) -> Vec<u8> {
    vec![b's', b'0', query.wire_digit()]
}

/// Bonus-card mode activation byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BonusActivation {
    Off,
    On,
    OnWithAutoReply,
}

impl BonusActivation {
    fn wire_digit(self) -> u8 {
        match self {
            BonusActivation::Off => b'0',
            BonusActivation::On => b'1',
            BonusActivation::OnWithAutoReply => b'2',
        }
    }
}

/// Switch bonus-card mode: `C` · activation · `0` · `0` · `0`.
#[must_use]
pub fn bonus_card_mode(activation: BonusActivation) -> Vec<u8> {
    vec![b'C', activation.wire_digit(), b'0', b'0', b'0']
}

/// Request customer bonus info: `D` · activation.
///
/// The activation byte is documented as stop (`0`) / keep active (`1`); some
/// firmwares ignore it, so nothing downstream depends on the distinction.
#[must_use]
pub fn customer_request(keep_active: bool) -> Vec<u8> {
    vec![b'D', if keep_active { b'1' } else { b'0' }]
}
