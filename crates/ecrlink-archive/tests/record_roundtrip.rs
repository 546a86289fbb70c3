//! Property test: the archive format is lossless for every representable
//! record, whatever the field contents — including values that collide with
//! the `null:`/`b64:` markers, embedded line breaks, and arbitrary receipt
//! bytes.

use ecrlink_archive::TransactionRecord;
use ecrlink_core::{Amount, BonusInfo, EcrTimestamp, TransactionId};
use ecrlink_protocol::TransactionResult;
use proptest::prelude::*;

/// Arbitrary text fields, deliberately including marker prefixes and
/// line breaks that force the `b64:` escape path.
fn field_text() -> impl Strategy<Value = String> {
    prop_oneof![
        "[ -~]{0,32}",                  // printable ASCII
        "(null:|b64:)[ -~]{0,16}",      // marker collisions
        "[ -~]{0,8}\n[ -~]{0,8}",       // embedded newline
        "[ -~]{0,8}\r[ -~]{0,8}",       // embedded carriage return
        "[\\PC]{0,16}",                 // arbitrary printable unicode
    ]
}

fn ascii_char() -> impl Strategy<Value = char> {
    (0x20u8..=0x7E).prop_map(|b| b as char)
}

fn receipt_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..128)
}

fn timestamp() -> impl Strategy<Value = EcrTimestamp> {
    prop_oneof![
        Just(EcrTimestamp::empty()),
        Just(EcrTimestamp::parse_wire("260802143015").unwrap()),
        Just(EcrTimestamp::parse_wire("991231235959").unwrap()),
    ]
}

fn bonus() -> impl Strategy<Value = Option<BonusInfo>> {
    prop::option::of(
        (field_text(), field_text(), prop::option::of(field_text())).prop_map(
            |(customer_number, member_class, status_code)| BonusInfo {
                customer_number,
                member_class,
                status_code,
                status_text: None,
            },
        ),
    )
}

fn record() -> impl Strategy<Value = TransactionRecord> {
    let result = (
        (
            any::<bool>(),
            ascii_char(),
            ascii_char(),
            ascii_char(),
            ascii_char(),
            field_text(),
            field_text(),
            field_text(),
        ),
        (
            field_text(),
            field_text(),
            field_text(),
            "[0-9A-Z]{5}",
            field_text(),
            timestamp(),
            0u64..=999_999_999_999,
            field_text(),
        ),
        (
            field_text(),
            any::<bool>(),
            (0x20u8..=0x7E),
            receipt_bytes(),
            receipt_bytes(),
        ),
    )
        .prop_map(|(head, mid, tail)| {
            let (extended, transaction_type, payment_method, card_type, usage, settlement, masked, aid) =
                head;
            let (certificate, tvr, tsi, tx_id, filing, ts, minor, currency) = mid;
            let (serial, print_payee, flags, payer, payee) = tail;
            TransactionResult {
                extended,
                transaction_type,
                payment_method,
                card_type,
                transaction_usage: usage,
                settlement_id: settlement,
                masked_card_number: masked,
                aid,
                certificate,
                tvr,
                tsi,
                transaction_id: TransactionId::new(&tx_id).unwrap(),
                filing_code: filing,
                timestamp: ts,
                amount: Amount::new(minor).unwrap(),
                currency,
                reader_serial_number: serial,
                print_payee_receipt: print_payee,
                flags: flags as char,
                payer_receipt: payer,
                payee_receipt: payee,
            }
        });

    (result, bonus()).prop_map(|(result, bonus)| TransactionRecord { result, bonus })
}

proptest! {
    /// serialize → deserialize yields a record equal on every parsed field,
    /// with receipts and flags byte-exact.
    #[test]
    fn prop_record_roundtrip(record in record()) {
        let text = record.to_text();
        let parsed = TransactionRecord::from_text(&text).unwrap();
        prop_assert_eq!(parsed, record);
    }
}
