pub mod events;
pub mod manager;
pub mod session;

pub use events::{
    BonusInfo, DefaultPromptHandler, ErrorKind, ErrorNotice, PromptAnswer, PromptHandler,
    PromptRequest, TerminalEvent, TransactionOutcome,
};
pub use manager::{ManagerConfig, PortFactory, TerminalManager};
pub use session::{Session, SessionInfo, SessionLedger, SessionState};
