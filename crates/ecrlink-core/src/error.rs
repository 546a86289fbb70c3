use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Link errors
    #[error("Communication failure: {0}")]
    Communication(String),

    #[error("No response from terminal: {attempts} of {attempts} send attempts failed")]
    Timeout { attempts: u32 },

    // Session errors
    #[error(
        "Another session is active: {kind} {session_id} in state {state} \
         (transaction {transaction_id}, created {created_at})"
    )]
    SessionConflict {
        session_id: String,
        kind: String,
        state: String,
        transaction_id: String,
        created_at: String,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Invalid argument: {0}")]
    Validation(String),

    // Decode errors
    #[error("Cannot decode '{message_id}' message: {reason}")]
    Decode { message_id: char, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
