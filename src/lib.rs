pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod state;
pub mod store;
pub mod turn;

pub use error::{AppError, AppResult};
pub use state::ClientState;
pub use turn::{run_turn, TurnAction, TurnPhase};

/// Initialize logging for hosts that have no logger of their own.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .try_init();
}
