pub mod callback_processor;
pub mod gateway;
pub mod retry_ledger;
pub mod state_machine;
pub mod token_cache;

pub use callback_processor::{CallbackOutcome, CallbackProcessor};
pub use gateway::{ChargeResult, GatewayClient, GatewayStatusResponse, PaymentGateway, SavedCardCharge};
pub use retry_ledger::{backoff_delay, calculate_next_retry_time, CallbackRetryLedger};
pub use state_machine::PaymentStateMachine;
pub use token_cache::{AccessToken, TokenCache, TOKEN_REFRESH_BUFFER_SECS};
