pub mod decode;
pub mod encode;
pub mod frame;

pub use decode::{
    AbortResult, CustomerBonus, DeviceStatus, StatusMessage, TransactionResult, WireMessage,
    decode_payload,
};
pub use encode::{
    BonusActivation, DeviceQuery, DisplayOption, TransactionRequest, abort, accept_or_reject,
    auxiliary_mode, bonus_card_mode, clear_display, customer_request, device_control, display_text,
};
pub use frame::{WireAssembler, WireEvent, build_frame, lrc, payload_lrc};
