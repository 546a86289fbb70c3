//! Decoders for the terminal-to-host wire messages.
//!
//! The first payload byte is the message id; [`decode_payload`] routes on it
//! and returns a typed [`WireMessage`]. Fixed-layout records are extracted by
//! offset; free-form tails go through the link charset.

use ecrlink_core::{
    Amount, EcrTimestamp, Error, ResultCode, Result, TransactionId,
    charset,
    constants::{ABORT_CONFIRMED_CODE, ETX, RECEIPT_SEPARATOR, TRANSACTION_RESULT_MIN_LEN},
};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A decoded terminal-to-host message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Status(StatusMessage),
    Result(Box<TransactionResult>),
    AbortResult(AbortResult),
    DeviceStatus(DeviceStatus),
    CustomerBonus(CustomerBonus),
    VerifySignature(String),
    Wakeup,
}

/// Transaction status (`2` message): phase, result code, free-form info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub phase: char,
    pub code: ResultCode,
    pub info: String,
}

/// Abort-transaction result (`7` message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortResult {
    pub code: String,
    pub aborted: bool,
}

/// Device-control result (`S` message), raw tail included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub code: ResultCode,
    pub reader_state: char,
    pub environment: char,
    pub message_present: bool,
    pub data: String,
}

/// Customer bonus-card result (`D` message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerBonus {
    pub status: char,
    pub customer_number: String,
    pub member_class: String,
}

/// Completed-transaction record (`4` short / `5` extended layout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub extended: bool,
    pub transaction_type: char,
    pub payment_method: char,
    pub card_type: char,
    pub transaction_usage: char,
    pub settlement_id: String,
    pub masked_card_number: String,
    pub aid: String,
    pub certificate: String,
    pub tvr: String,
    pub tsi: String,
    pub transaction_id: TransactionId,
    pub filing_code: String,
    pub timestamp: EcrTimestamp,
    pub amount: Amount,
    pub currency: String,
    pub reader_serial_number: String,
    pub print_payee_receipt: bool,
    pub flags: char,
    pub payer_receipt: Vec<u8>,
    pub payee_receipt: Vec<u8>,
}

/// Route a reassembled payload to its decoder by message id.
///
/// # Errors
/// Returns `Error::Decode` for empty payloads, unknown ids and truncated
/// records. The caller logs and drops such payloads; no event is emitted.
pub fn decode_payload(payload: &[u8]) -> Result<WireMessage> {
    let &id = payload.first().ok_or(Error::Decode {
        message_id: '?',
        reason: "empty payload".to_string(),
    })?;
    trace!(id = %(id as char), len = payload.len(), "decoding payload");

    match id {
        b'2' => decode_status(payload).map(WireMessage::Status),
        b'4' | b'5' => decode_result(payload).map(|r| WireMessage::Result(Box::new(r))),
        b'7' => decode_abort_result(payload).map(WireMessage::AbortResult),
        b'S' => decode_device_status(payload).map(WireMessage::DeviceStatus),
        b'D' => decode_customer_bonus(payload).map(WireMessage::CustomerBonus),
        b'F' => Ok(WireMessage::VerifySignature(charset::decode(&payload[1..]))),
        b'W' => Ok(WireMessage::Wakeup),
        other => Err(Error::Decode {
            message_id: other as char,
            reason: "unknown message id".to_string(),
        }),
    }
}

fn decode_status(payload: &[u8]) -> Result<StatusMessage> {
    if payload.len() < 6 {
        return Err(Error::Decode {
            message_id: '2',
            reason: format!("status needs phase and result code, got {} bytes", payload.len()),
        });
    }
    let phase = payload[1] as char;
    let code = ResultCode::new(&charset::decode(&payload[2..6]))?;
    let info = charset::decode(&payload[6..]);
    Ok(StatusMessage { phase, code, info })
}

fn decode_abort_result(payload: &[u8]) -> Result<AbortResult> {
    if payload.len() < 4 {
        return Err(Error::Decode {
            message_id: '7',
            reason: format!("abort result needs 3 code bytes, got {}", payload.len() - 1),
        });
    }
    let code = charset::decode(&payload[1..4]);
    let aborted = code == ABORT_CONFIRMED_CODE;
    Ok(AbortResult { code, aborted })
}

fn decode_device_status(payload: &[u8]) -> Result<DeviceStatus> {
    if payload.len() < 8 {
        return Err(Error::Decode {
            message_id: 'S',
            reason: format!("device status needs 8 bytes, got {}", payload.len()),
        });
    }
    Ok(DeviceStatus {
        code: ResultCode::new(&charset::decode(&payload[1..5]))?,
        reader_state: payload[5] as char,
        environment: payload[6] as char,
        message_present: payload[7] == b'1',
        data: charset::decode(&payload[8..]),
    })
}

fn decode_customer_bonus(payload: &[u8]) -> Result<CustomerBonus> {
    if payload.len() < 24 {
        return Err(Error::Decode {
            message_id: 'D',
            reason: format!("customer bonus needs 24 bytes, got {}", payload.len()),
        });
    }
    Ok(CustomerBonus {
        status: payload[1] as char,
        customer_number: charset::decode(&payload[2..22]).trim().to_string(),
        member_class: charset::decode(&payload[22..24]),
    })
}

/// Field offsets that differ between the short (`4`) and extended (`5`)
/// layouts. Everything before the amount is common.
struct ResultLayout {
    amount_width: usize,
    currency: usize,
    serial: usize,
    print: usize,
    flags: usize,
}

const SHORT_LAYOUT: ResultLayout = ResultLayout {
    amount_width: 7,
    currency: 124,
    serial: 127,
    print: 136,
    flags: 137,
};

const EXTENDED_LAYOUT: ResultLayout = ResultLayout {
    amount_width: 12,
    currency: 129,
    serial: 132,
    print: 141,
    flags: 142,
};

fn decode_result(payload: &[u8]) -> Result<TransactionResult> {
    let id = payload[0] as char;
    if payload.len() < TRANSACTION_RESULT_MIN_LEN {
        return Err(Error::Decode {
            message_id: id,
            reason: format!(
                "result record needs at least {TRANSACTION_RESULT_MIN_LEN} bytes, got {}",
                payload.len()
            ),
        });
    }

    let extended = id == '5';
    let layout = if extended { &EXTENDED_LAYOUT } else { &SHORT_LAYOUT };
    if payload.len() < layout.flags {
        return Err(Error::Decode {
            message_id: id,
            reason: format!(
                "extended result record truncated at {} bytes",
                payload.len()
            ),
        });
    }

    let text = |range: std::ops::Range<usize>| charset::decode(&payload[range]);

    let transaction_id = TransactionId::new(&text(88..93)).map_err(|e| Error::Decode {
        message_id: id,
        reason: format!("bad transaction id field: {e}"),
    })?;
    let timestamp = EcrTimestamp::parse_wire(&text(105..117)).map_err(|e| Error::Decode {
        message_id: id,
        reason: format!("bad timestamp field: {e}"),
    })?;
    let amount = Amount::parse_wire(&text(117..117 + layout.amount_width)).map_err(|e| {
        Error::Decode {
            message_id: id,
            reason: format!("bad amount field: {e}"),
        }
    })?;

    let (payer_receipt, payee_receipt) = split_receipts(payload, layout.flags + 1);

    Ok(TransactionResult {
        extended,
        transaction_type: payload[1] as char,
        payment_method: payload[2] as char,
        card_type: payload[3] as char,
        transaction_usage: payload[4] as char,
        settlement_id: text(5..7),
        masked_card_number: text(7..26),
        aid: text(26..58),
        certificate: text(58..74),
        tvr: text(74..84),
        tsi: text(84..88),
        transaction_id,
        filing_code: text(93..105),
        timestamp,
        amount,
        currency: text(layout.currency..layout.currency + 3),
        reader_serial_number: text(layout.serial..layout.serial + 9),
        print_payee_receipt: payload[layout.print] == b'1',
        flags: *payload.get(layout.flags).unwrap_or(&b'0') as char,
        payer_receipt,
        payee_receipt,
    })
}

/// Receipt tail: payer-receipt · RS · payee-receipt, trailing ETX stripped.
fn split_receipts(payload: &[u8], start: usize) -> (Vec<u8>, Vec<u8>) {
    if start >= payload.len() {
        return (Vec::new(), Vec::new());
    }
    let mut tail = &payload[start..];
    while tail.last() == Some(&ETX) {
        tail = &tail[..tail.len() - 1];
    }
    match tail.iter().position(|&b| b == RECEIPT_SEPARATOR) {
        Some(pos) => (tail[..pos].to_vec(), tail[pos + 1..].to_vec()),
        None => (tail.to_vec(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a minimal short-layout result record for tests.
    pub(crate) fn sample_result(id: u8, amount_field: &str) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(id);
        p.push(b'0'); // transaction type
        p.push(b'1'); // payment method
        p.push(b'2'); // card type
        p.push(b'0'); // usage
        p.extend_from_slice(b"01"); // settlement id
        p.extend_from_slice(format!("{:<19}", "541333******1234").as_bytes());
        p.extend_from_slice(format!("{:<32}", "A0000000041010").as_bytes());
        p.extend_from_slice(format!("{:<16}", "0123456789ABCDEF").as_bytes());
        p.extend_from_slice(b"0000048000");
        p.extend_from_slice(b"E800");
        p.extend_from_slice(b"00042"); // transaction id
        p.extend_from_slice(b"000000000123"); // filing code
        p.extend_from_slice(b"260802143015"); // timestamp
        let extended = id == b'5';
        let width = if extended { 12 } else { 7 };
        p.extend_from_slice(format!("{amount_field:0>width$}").as_bytes());
        p.extend_from_slice(b"978"); // currency
        p.extend_from_slice(b"000001234"); // reader serial
        p.push(b'1'); // print payee receipt
        p.push(b'0'); // flags
        p
    }

    #[test]
    fn test_decode_status() {
        let msg = decode_payload(b"2A000000042").unwrap();
        let WireMessage::Status(status) = msg else {
            panic!("expected status");
        };
        assert_eq!(status.phase, 'A');
        assert_eq!(status.code.as_str(), "0000");
        assert_eq!(status.info, "00042");
    }

    #[test]
    fn test_decode_status_too_short() {
        assert!(decode_payload(b"2A00").is_err());
    }

    #[test]
    fn test_decode_abort_result() {
        let WireMessage::AbortResult(abort) = decode_payload(b"7721").unwrap() else {
            panic!("expected abort result");
        };
        assert!(abort.aborted);
        assert_eq!(abort.code, "721");

        let WireMessage::AbortResult(abort) = decode_payload(b"7000").unwrap() else {
            panic!("expected abort result");
        };
        assert!(!abort.aborted);
    }

    #[test]
    fn test_decode_wakeup_and_signature() {
        assert_eq!(decode_payload(b"W").unwrap(), WireMessage::Wakeup);
        let WireMessage::VerifySignature(text) = decode_payload(b"FPlease verify").unwrap() else {
            panic!("expected verify signature");
        };
        assert_eq!(text, "Please verify");
    }

    #[test]
    fn test_decode_device_status() {
        let WireMessage::DeviceStatus(status) = decode_payload(b"S0000RE1extra").unwrap() else {
            panic!("expected device status");
        };
        assert_eq!(status.code.as_str(), "0000");
        assert_eq!(status.reader_state, 'R');
        assert_eq!(status.environment, 'E');
        assert!(status.message_present);
        assert_eq!(status.data, "extra");
    }

    #[test]
    fn test_decode_customer_bonus() {
        let mut payload = vec![b'D', b'0'];
        payload.extend_from_slice(format!("{:>20}", "12345678901").as_bytes());
        payload.extend_from_slice(b"05");
        let WireMessage::CustomerBonus(bonus) = decode_payload(&payload).unwrap() else {
            panic!("expected customer bonus");
        };
        assert_eq!(bonus.status, '0');
        assert_eq!(bonus.customer_number, "12345678901");
        assert_eq!(bonus.member_class, "05");
    }

    #[test]
    fn test_decode_short_result() {
        let payload = sample_result(b'4', "1234");
        let WireMessage::Result(result) = decode_payload(&payload).unwrap() else {
            panic!("expected result");
        };
        assert!(!result.extended);
        assert_eq!(result.transaction_id.as_str(), "00042");
        assert_eq!(result.amount.minor(), 1234);
        assert_eq!(result.currency, "978");
        assert_eq!(result.reader_serial_number, "000001234");
        assert!(result.print_payee_receipt);
        assert_eq!(result.timestamp.to_wire(), "260802143015");
        assert!(result.payer_receipt.is_empty());
    }

    #[test]
    fn test_decode_extended_result_with_receipts() {
        let mut payload = sample_result(b'5', "000000001234");
        payload.extend_from_slice(b"PAYER RECEIPT");
        payload.push(RECEIPT_SEPARATOR);
        payload.extend_from_slice(b"PAYEE RECEIPT");
        payload.push(ETX);
        payload.push(ETX);

        let WireMessage::Result(result) = decode_payload(&payload).unwrap() else {
            panic!("expected result");
        };
        assert!(result.extended);
        assert_eq!(result.amount.minor(), 1234);
        assert_eq!(result.payer_receipt, b"PAYER RECEIPT");
        assert_eq!(result.payee_receipt, b"PAYEE RECEIPT");
    }

    #[test]
    fn test_result_below_minimum_is_rejected() {
        let payload = vec![b'4'; TRANSACTION_RESULT_MIN_LEN - 1];
        assert!(decode_payload(&payload).is_err());
    }

    #[test]
    fn test_unknown_message_id() {
        assert!(decode_payload(b"Qxyz").is_err());
        assert!(decode_payload(b"").is_err());
    }
}
