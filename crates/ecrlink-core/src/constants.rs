/// Wire control bytes
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ETB: u8 = 0x17;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const ENQ: u8 = 0x05;

/// Separator between payer and payee receipt in a transaction result
pub const RECEIPT_SEPARATOR: u8 = 0x1E; // RS

/// In-field terminator for the authorization-code slot
pub const FIELD_TERMINATOR: u8 = 0x1C; // FS

/// Fixed message sizes
pub const TRANSACTION_REQUEST_LEN: usize = 80;
pub const TRANSACTION_RESULT_MIN_LEN: usize = 137;
pub const TRANSACTION_ID_LEN: usize = 5;
pub const DISPLAY_LINE_LEN: usize = 21;
pub const CUSTOMER_NUMBER_LEN: usize = 20;
pub const MEMBER_CLASS_LEN: usize = 2;

/// Field widths inside the transaction request
pub const AMOUNT_WIDTH: usize = 12;
pub const TIMESTAMP_WIDTH: usize = 12;
pub const ACCOUNTING_DATE_WIDTH: usize = 6;
pub const AUTH_CODE_WIDTH: usize = 7;
pub const SERIAL_NUMBER_WIDTH: usize = 9;
pub const ECR_NUMBER_WIDTH: usize = 3;
pub const CURRENCY_WIDTH: usize = 3;

/// Placeholder transaction id used until the terminal assigns one
pub const PLACEHOLDER_TRANSACTION_ID: &str = "00000";

/// ISO 4217 numeric code for EUR, the default currency
pub const DEFAULT_CURRENCY: &str = "978";

/// Serial link defaults (19200 8-N-1)
pub const DEFAULT_BAUD_RATE: u32 = 19200;
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 3000;

/// Sender defaults
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_SEND_RETRIES: u32 = 3;

/// Delay before acknowledging a received part (bus turnaround throttle)
pub const DEFAULT_ACK_DELAY_MS: u64 = 100;

/// Delay before disabling bonus-card mode after a bonus-only abort
pub const BONUS_DISABLE_DELAY_MS: u64 = 500;

/// Session ledger capacity; oldest sessions are dropped first
pub const SESSION_LEDGER_CAPACITY: usize = 100;

/// Abort-result code reported by the terminal for a successful abort
pub const ABORT_CONFIRMED_CODE: &str = "721";

/// Synthetic result code for the retry-transaction prompt
pub const RETRY_TRANSACTION_CODE: &str = "A000";

/// Status phase that carries the assigned transaction id
pub const PHASE_INITIALIZED: char = 'A';
